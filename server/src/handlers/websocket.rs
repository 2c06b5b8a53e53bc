//! WebSocket handler for real-time sync.
//!
//! Bridges one socket to one [`SyncConnection`]: inbound text frames are fed
//! to the connection, outbound messages go through a channel drained by a
//! forwarding task.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::AuthUser;
use crate::sync::{ConnectionParams, ConnectionState, SyncConnection};
use crate::websocket::ServerMessage;
use crate::AppState;

/// Query string of the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Client replica id; a random one is assigned when absent
    pub client: Option<String>,
    /// Hash of the client's schema
    pub schema: Option<String>,
}

impl ConnectQuery {
    pub fn into_params(self) -> ConnectionParams {
        ConnectionParams {
            client_id: self
                .client
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            schema_hash: self.schema.filter(|s| !s.is_empty()),
        }
    }
}

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing messages
/// 3. Negotiates the schema and processes incoming messages in a loop
/// 4. Closes the sync session and cleans up on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    state: AppState,
    params: ConnectionParams,
    user: AuthUser,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let (conn_id, buffer) = state
        .conn_manager
        .register(params.client_id.clone(), tx.clone());

    tracing::info!(
        conn_id = %conn_id,
        client_id = %params.client_id,
        role = ?user.role,
        skips_rules = user.skips_rules(),
        "WebSocket client connected"
    );

    // Forward messages from the channel to the socket until every sender is gone.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, ServerMessage::Close { .. });
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
            if closing {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    });

    let mut connection = SyncConnection::new(
        conn_id.clone(),
        params,
        state.db.clone(),
        tx,
        buffer,
    );
    connection.start().await;

    while connection.state() != ConnectionState::Closed {
        let Some(result) = ws_receiver.next().await else {
            break;
        };
        match result {
            Ok(Message::Text(text)) => connection.handle_text(text.as_str()).await,
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => connection.handle_text(text).await,
                Err(_) => tracing::warn!(conn_id = %conn_id, "Ignoring non-UTF-8 binary frame"),
            },
            Ok(Message::Ping(data)) => {
                // Axum answers pings itself.
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    // Clean up. Dropping the last senders lets the forwarder drain and exit.
    connection.close().await;
    state.conn_manager.unregister(&conn_id);
    drop(connection);
    let _ = send_task.await;

    tracing::info!(
        conn_id = %conn_id,
        active_connections = state.conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}
