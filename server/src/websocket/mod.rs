//! WebSocket transport for the sync protocol.
//!
//! Clients connect over WebSocket, negotiate schemas and subscribe to live
//! queries; result deltas are pushed back in periodic `ENTITY_DATA` batches.

mod manager;
mod protocol;

pub use manager::{Connection, ConnectionManager, MessageSender};
pub use protocol::*;
