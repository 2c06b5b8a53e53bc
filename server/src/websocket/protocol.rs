//! WebSocket message protocol definitions.
//!
//! Every frame is a JSON envelope `{"type": "...", "payload": {...}}` with
//! SCREAMING_SNAKE_CASE type names and camelCase payload fields.

use serde::{Deserialize, Serialize};
use weft_engine::{CollectionQuery, DBChanges, Error, Schema, Timestamp};

/// Type names a client may send.
pub const CLIENT_MESSAGE_TYPES: [&str; 6] = [
    "SCHEMA_RESPONSE",
    "CONNECT_QUERY",
    "DISCONNECT_QUERY",
    "CHANGES",
    "CHUNK",
    "PING",
];

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// The client's full schema, answering `SCHEMA_REQUEST`
    SchemaResponse {
        #[serde(default)]
        schema: Option<Schema>,
    },

    /// Start a live query under a client-chosen id.
    ConnectQuery {
        id: String,
        params: CollectionQuery,
        /// Client's last seen frontier. Accepted but not used to trim the
        /// initial results.
        #[serde(default)]
        state: Option<serde_json::Value>,
    },

    /// Stop a live query.
    DisconnectQuery { id: String },

    /// Local writes to apply at one server timestamp.
    Changes { changes: DBChanges },

    /// One piece of a message split across frames.
    Chunk {
        data: String,
        total: usize,
        index: usize,
        id: String,
    },

    /// Keep-alive ping.
    Ping,
}

/// Why a frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParseFailure {
    /// The envelope's type, when it could be read
    pub message_type: Option<String>,
    pub error: Error,
}

impl ClientMessage {
    /// Parse one text frame.
    ///
    /// Invalid JSON or a payload of the wrong shape is a
    /// `MalformedMessagePayload`; a well-formed envelope with an unknown type
    /// is an `UnrecognizedMessageType`.
    pub fn parse(text: &str) -> Result<Self, ParseFailure> {
        let envelope: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ParseFailure {
                message_type: None,
                error: Error::MalformedMessagePayload(e.to_string()),
            })?;

        let Some(kind) = envelope.get("type").and_then(|t| t.as_str()) else {
            return Err(ParseFailure {
                message_type: None,
                error: Error::MalformedMessagePayload("missing message type".into()),
            });
        };
        let kind = kind.to_string();

        if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ParseFailure {
                error: Error::UnrecognizedMessageType(kind.clone()),
                message_type: Some(kind),
            });
        }
        if kind == "PING" {
            return Ok(ClientMessage::Ping);
        }

        serde_json::from_value(envelope).map_err(|e| ParseFailure {
            message_type: Some(kind),
            error: Error::MalformedMessagePayload(e.to_string()),
        })
    }

    /// The wire type name.
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::SchemaResponse { .. } => "SCHEMA_RESPONSE",
            ClientMessage::ConnectQuery { .. } => "CONNECT_QUERY",
            ClientMessage::DisconnectQuery { .. } => "DISCONNECT_QUERY",
            ClientMessage::Changes { .. } => "CHANGES",
            ClientMessage::Chunk { .. } => "CHUNK",
            ClientMessage::Ping => "PING",
        }
    }
}

/// Reason carried by a `CLOSE` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    SchemaMismatch,
    Unauthorized,
}

/// Error body inside an `ERROR` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    pub status: u16,
}

impl From<&Error> for ErrorPayload {
    fn from(error: &Error) -> Self {
        Self {
            name: error.name().to_string(),
            message: error.to_string(),
            status: error.status(),
        }
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// The connection may now sync.
    Ready {},

    /// Ask the client for its full schema.
    SchemaRequest {},

    /// The server is closing the connection.
    Close {
        #[serde(rename = "type")]
        reason: CloseReason,
        retry: bool,
        message: String,
    },

    /// A message could not be handled. The connection stays open.
    Error {
        #[serde(rename = "messageType")]
        message_type: Option<String>,
        error: ErrorPayload,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },

    /// A `CHANGES` batch was committed at `timestamp`.
    ChangesAck { timestamp: Timestamp },

    /// Buffered result deltas for one or more live queries.
    EntityData {
        changes: DBChanges,
        timestamp: Option<Timestamp>,
        #[serde(rename = "forQueries")]
        for_queries: Vec<String>,
    },

    /// Response to ping.
    Pong,
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(
        message_type: Option<String>,
        error: &Error,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        ServerMessage::Error {
            message_type,
            error: error.into(),
            metadata,
        }
    }

    /// A non-retryable close.
    pub fn close(reason: CloseReason, message: impl Into<String>) -> Self {
        ServerMessage::Close {
            reason,
            retry: false,
            message: message.into(),
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Ready {} => "READY",
            ServerMessage::SchemaRequest {} => "SCHEMA_REQUEST",
            ServerMessage::Close { .. } => "CLOSE",
            ServerMessage::Error { .. } => "ERROR",
            ServerMessage::ChangesAck { .. } => "CHANGES_ACK",
            ServerMessage::EntityData { .. } => "ENTITY_DATA",
            ServerMessage::Pong => "PONG",
        }
    }
}
