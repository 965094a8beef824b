//! Shared application state

use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::hub::EventHub;
use crate::orchestrator::Orchestrator;

/// Dependencies shared by API handlers and WebSocket subscribers
pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub hub: EventHub,
    pub orchestrator: Arc<Orchestrator>,
}
