//! Weft Server - sync server for the Weft replicated triple store.
//!
//! Clients connect over WebSocket, negotiate schemas, subscribe to live
//! queries and push their local writes. The server owns one
//! [`weft_engine::Database`] shared by every connection.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod sync;
pub mod websocket;

pub use routes::router;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::db::SharedDatabase;
use crate::websocket::ConnectionManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SharedDatabase,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SharedDatabase, config: Config) -> Self {
        Self {
            db,
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
            started_at: Utc::now(),
        }
    }
}
