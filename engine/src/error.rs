//! Error types for the Weft engine.

use crate::{CollectionName, EntityId, Timestamp};
use thiserror::Error;

/// All possible errors from the Weft engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Codec errors
    #[error("encoding error: {0}")]
    Encoding(String),

    // Storage errors
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("cannot apply triple for entity '{triple_entity}' to entity '{entity}'")]
    InvalidTripleApplication {
        entity: EntityId,
        triple_entity: EntityId,
    },

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("invalid timestamp index scan: {0}")]
    InvalidTimestampIndexScan(String),

    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("hook rejected write: {0}")]
    HookRejected(String),

    // Database errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("entity already exists: {0}")]
    EntityAlreadyExists(EntityId),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    // Query errors
    #[error("unknown query variable: {0}")]
    UnknownVariable(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(u64),

    #[error("changes rejected at {tx_id} for collections {collections:?}: {cause}")]
    ChangesRejected {
        tx_id: Timestamp,
        collections: Vec<CollectionName>,
        cause: Box<Error>,
    },

    // Protocol errors
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("malformed message payload: {0}")]
    MalformedMessagePayload(String),

    #[error("unrecognized message type: {0}")]
    UnrecognizedMessageType(String),

    #[error("connection is not ready for {0}")]
    ConnectionNotReady(String),

    #[error("query sync failed for '{query_id}': {cause}")]
    QuerySync { query_id: String, cause: Box<Error> },
}

impl Error {
    /// Stable machine-readable name, used when errors cross the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Encoding(_) => "EncodingError",
            Error::InvalidValue(_) => "InvalidValueError",
            Error::InvalidTripleApplication { .. } => "InvalidTripleApplicationError",
            Error::IndexNotFound(_) => "IndexNotFoundError",
            Error::InvalidTimestampIndexScan(_) => "InvalidTimestampIndexScanError",
            Error::InvalidEntityId(_) => "InvalidEntityIdError",
            Error::Storage(_) => "StorageError",
            Error::HookRejected(_) => "HookRejectedError",
            Error::CollectionNotFound(_) => "CollectionNotFoundError",
            Error::EntityNotFound(_) => "EntityNotFoundError",
            Error::EntityAlreadyExists(_) => "EntityAlreadyExistsError",
            Error::MissingRequiredField(_) => "MissingRequiredFieldError",
            Error::TypeMismatch { .. } => "TypeMismatchError",
            Error::InvalidSnapshot(_) => "InvalidSnapshotError",
            Error::UnknownVariable(_) => "UnknownVariableError",
            Error::SubscriptionNotFound(_) => "SubscriptionNotFoundError",
            Error::ChangesRejected { .. } => "ChangesRejectedError",
            Error::SchemaMismatch(_) => "SchemaMismatchError",
            Error::MalformedMessagePayload(_) => "MalformedMessagePayloadError",
            Error::UnrecognizedMessageType(_) => "UnrecognizedMessageTypeError",
            Error::ConnectionNotReady(_) => "ConnectionNotReadyError",
            Error::QuerySync { .. } => "QuerySyncError",
        }
    }

    /// HTTP-style status classification for wire errors.
    pub fn status(&self) -> u16 {
        match self {
            Error::CollectionNotFound(_)
            | Error::EntityNotFound(_)
            | Error::SubscriptionNotFound(_) => 404,
            Error::EntityAlreadyExists(_) => 409,
            Error::Storage(_) | Error::InvalidSnapshot(_) => 500,
            Error::QuerySync { cause, .. } | Error::ChangesRejected { cause, .. } => cause.status(),
            _ => 400,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
