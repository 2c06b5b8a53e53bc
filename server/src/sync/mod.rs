//! Sync protocol sessions.

mod buffer;
mod chunks;
mod connection;

pub use buffer::EntityBuffer;
pub use chunks::{ChunkAssembler, ChunkLimits};
pub use connection::{ConnectionParams, ConnectionState, SyncConnection};
