//! HTTP routes: health probes and the sync upgrade endpoint.

mod health;
mod sync;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// The full application router with tracing and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
