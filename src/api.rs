//! HTTP/JSON API surface
//!
//! Request handlers accept, validate and persist, then return; the
//! long-running work happens in orchestrator tasks.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::db;
use crate::error::{ApiError, ApiResponse};
use crate::state::AppState;
use crate::types::{Cluster, ClusterDetail, ClusterSpec, Event};
use crate::ws;

/// Most recent events returned by the events endpoint
const EVENTS_PAGE_LIMIT: i64 = 100;

/// Assemble the application router with its middleware stack.
pub fn router(state: Arc<AppState>) -> Router {
    let read_timeout = state.config.server.read_timeout();

    Router::new()
        .route("/api/health", get(health))
        .route("/api/clusters", get(list_clusters).post(create_cluster))
        .route("/api/clusters/:id", get(get_cluster).delete(delete_cluster))
        .route("/api/clusters/:id/kubeconfig", get(get_kubeconfig))
        .route("/api/clusters/:id/events", get(list_events))
        .route("/ws/clusters/:id/events", get(ws::events_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(read_timeout))
}

#[derive(Debug, Serialize)]
struct HealthView {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct MessageView {
    message: String,
}

async fn health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.db.health_check().await?;
    Ok(ApiResponse::new(HealthView { status: "ok" }))
}

async fn list_clusters(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Cluster>>>, ApiError> {
    let clusters = db::clusters::list(state.db.pool()).await?;
    Ok(ApiResponse::new(clusters))
}

async fn create_cluster(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<ClusterSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let cluster = state.orchestrator.create_cluster(spec).await?;
    Ok((StatusCode::CREATED, ApiResponse::new(cluster)))
}

async fn get_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<ClusterDetail>>, ApiError> {
    let pool = state.db.pool();

    let cluster = db::clusters::get(pool, id).await?;
    let nodes = db::nodes::list_by_cluster(pool, id).await?;
    let events = db::events::recent_desc(pool, id, EVENTS_PAGE_LIMIT).await?;

    Ok(ApiResponse::new(ClusterDetail {
        cluster,
        nodes,
        events,
    }))
}

async fn delete_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<MessageView>>, ApiError> {
    state.orchestrator.delete_cluster(id).await?;
    Ok(ApiResponse::new(MessageView {
        message: "cluster destruction started".to_string(),
    }))
}

async fn get_kubeconfig(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let cluster = db::clusters::get(state.db.pool(), id).await?;

    if cluster.kubeconfig.is_empty() {
        return Err(ApiError::NotFound(format!(
            "kubeconfig is not yet available for cluster '{}'",
            cluster.name
        )));
    }

    let disposition = format!("attachment; filename=\"{}-kubeconfig.yaml\"", cluster.name);

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-yaml".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        cluster.kubeconfig,
    )
        .into_response())
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Vec<Event>>>, ApiError> {
    // ensure the cluster exists so unknown ids are 404 rather than []
    db::clusters::get(state.db.pool(), id).await?;

    let events = db::events::recent_desc(state.db.pool(), id, EVENTS_PAGE_LIMIT).await?;
    Ok(ApiResponse::new(events))
}
