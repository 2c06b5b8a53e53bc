//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub replica_id: String,
    pub started_at: DateTime<Utc>,
    pub connections: usize,
    pub subscriptions: usize,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let subscriptions = state.db.lock().await.subscription_count();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        replica_id: state.config.replica_id.clone(),
        started_at: state.started_at,
        connections: state.conn_manager.connection_count(),
        subscriptions,
    })
}

/// Root handler.
async fn root() -> &'static str {
    "Weft Sync Server"
}
