//! WebSocket connection manager.
//!
//! Tracks active connections and periodically flushes each one's buffered
//! entity data to its socket.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::ServerMessage;
use crate::sync::EntityBuffer;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Client's replica id
    pub client_id: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
    /// Live-query deltas waiting for the next flush
    pub buffer: Arc<EntityBuffer>,
    pub connected_at: DateTime<Utc>,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Connection>,
    /// Connection ids per client id
    by_client_id: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection id and the buffer its queries write into.
    pub fn register(&self, client_id: String, sender: MessageSender) -> (String, Arc<EntityBuffer>) {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let buffer = Arc::new(EntityBuffer::new());

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                client_id: client_id.clone(),
                sender,
                buffer: Arc::clone(&buffer),
                connected_at: Utc::now(),
            },
        );
        self.by_client_id
            .entry(client_id)
            .or_default()
            .push(conn_id.clone());

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        (conn_id, buffer)
    }

    /// Unregister a connection. Anything still buffered for it is dropped.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_client_id.get_mut(&conn.client_id) {
                conn_ids.retain(|id| id != conn_id);
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_client_id.remove(&conn.client_id);
                }
            }

            tracing::info!(
                conn_id = %conn_id,
                client_id = %conn.client_id,
                connected_for = %(Utc::now() - conn.connected_at),
                "WebSocket connection unregistered"
            );
        }
    }

    /// Send every connection's buffered entity data.
    ///
    /// A connection whose socket has gone away loses its payload; nothing
    /// here waits on a slow client. Returns the number of messages sent.
    pub fn flush_all(&self) -> usize {
        let mut sent = 0;
        for entry in self.connections.iter() {
            let conn = entry.value();
            let Some(message) = conn.buffer.take() else {
                continue;
            };
            if conn.sender.send(message).is_ok() {
                sent += 1;
            } else {
                tracing::debug!(conn_id = %conn.id, "Dropped entity data for closed connection");
            }
        }
        if sent > 0 {
            tracing::trace!(messages = sent, "Flushed entity data");
        }
        sent
    }

    /// Flush every `interval` until the runtime shuts down.
    pub fn spawn_flush_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.flush_all();
            }
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct client ids connected.
    pub fn client_count(&self) -> usize {
        self.by_client_id.len()
    }
}
