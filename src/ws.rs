//! Live event stream over WebSocket
//!
//! `/ws/clusters/{id}/events` delivers up to the 50 most recent
//! persisted events in chronological order, then live events as the hub
//! broadcasts them. The server pings every 30 seconds; a failed write or
//! a client read error ends the subscription.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::db::{self, Database};
use crate::error::ApiError;
use crate::hub::{EventHub, Subscription};
use crate::state::AppState;
use crate::types::Event;

/// How many persisted events are replayed to a fresh subscriber
pub const HISTORY_REPLAY_LIMIT: i64 = 50;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Fetch the replay window, then attach a live subscription.
///
/// History is read before subscribing, so an event landing in between
/// may be missed by the replay; clients tolerate that brief race rather
/// than seeing duplicates.
pub async fn open_event_stream(
    db: &Database,
    hub: &EventHub,
    cluster_id: i64,
) -> (Vec<Event>, Subscription) {
    let history = db::events::recent(db.pool(), cluster_id, HISTORY_REPLAY_LIMIT)
        .await
        .unwrap_or_default();
    let subscription = hub.subscribe(cluster_id).await;
    (history, subscription)
}

/// Upgrade handler for the per-cluster event stream
pub async fn events_handler(
    ws: WebSocketUpgrade,
    Path(cluster_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    // unknown clusters are rejected before the upgrade
    db::clusters::get(state.db.pool(), cluster_id).await?;

    info!(cluster_id, "event stream subscriber connecting");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, cluster_id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, cluster_id: i64) {
    let (mut sender, mut receiver) = socket.split();

    let (history, mut subscription) = open_event_stream(&state.db, &state.hub, cluster_id).await;

    for event in history {
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            event = subscription.rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                match message {
                    // client payloads are ignored; only closure and read
                    // errors matter
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    debug!(cluster_id, "event stream subscriber disconnected");
}
