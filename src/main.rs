use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use kubeforge::config::Config;
use kubeforge::db::Database;
use kubeforge::hub::EventHub;
use kubeforge::orchestrator::Orchestrator;
use kubeforge::provision::ProvisionerRegistry;
use kubeforge::shutdown::ShutdownCoordinator;
use kubeforge::ssh::{RusshSessionFactory, SessionFactory};
use kubeforge::{api, logging, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    logging::init(&config.logging);

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    if config.database.driver != "sqlite" {
        anyhow::bail!(
            "database driver '{}' is not supported by this build; use sqlite",
            config.database.driver
        );
    }

    let database = Arc::new(
        Database::new(&config.database.dsn)
            .await
            .context("failed to connect to database")?,
    );
    database
        .migrate()
        .await
        .context("failed to run database migrations")?;

    let hub = EventHub::new();
    let coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout());

    let sessions: Arc<dyn SessionFactory> = Arc::new(RusshSessionFactory::new());
    let registry = Arc::new(ProvisionerRegistry::with_defaults(sessions));
    let orchestrator = Arc::new(Orchestrator::new(
        database.clone(),
        hub.clone(),
        registry,
        coordinator.cancellation_token(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        db: database.clone(),
        hub,
        orchestrator: orchestrator.clone(),
    });

    let app = api::router(state);

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    info!("kubeforge API listening on {}", address);

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        signal_coordinator.wait_for_signal().await;
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(coordinator.signal())
        .await
        .context("server error")?;

    info!("server stopped, draining orchestrator tasks");

    // in-flight cluster tasks observed the cancellation token; give
    // their best-effort cleanup a bounded budget
    let tracker = orchestrator.tasks();
    tracker.close();
    if tokio::time::timeout(coordinator.timeout(), tracker.wait())
        .await
        .is_err()
    {
        warn!(
            "orchestrator tasks did not finish within {:?}",
            coordinator.timeout()
        );
    }

    database.close().await;
    info!("shutdown complete");

    Ok(())
}
