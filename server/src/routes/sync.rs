//! Sync endpoint routes.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

use crate::auth::AuthUser;
use crate::handlers::{handle_websocket_connection, ConnectQuery};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// GET /ws - Upgrade to a sync connection.
///
/// Query string: `client` (replica id), `schema` (schema hash) and `token`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ConnectQuery>,
) -> Response {
    let params = query.into_params();
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, state, params, user))
}
