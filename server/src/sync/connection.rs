//! One client's sync session.
//!
//! A connection negotiates schemas, then serves live queries and applies
//! client writes. Query results never go straight to the socket: they land
//! in the connection's [`EntityBuffer`] and leave with the next flush.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use weft_engine::{
    schema::{backwards_incompatible_edits, diff_schemas},
    CollectionQuery, DBChanges, Error, Schema, SubscriptionId, SubscriptionUpdate,
};

use super::{ChunkAssembler, EntityBuffer};
use crate::db::SharedDatabase;
use crate::websocket::{ClientMessage, CloseReason, MessageSender, ServerMessage};

/// Lifecycle of a [`SyncConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unstarted,
    AwaitingSchemaResponse,
    Ready,
    Closed,
}

/// What the client declared when it connected.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    pub client_id: String,
    /// Hash of the client's schema; `None` for a schemaless client
    pub schema_hash: Option<String>,
}

enum Negotiation {
    Ready,
    RequestSchema,
    Mismatch(String),
}

pub struct SyncConnection {
    conn_id: String,
    params: ConnectionParams,
    db: SharedDatabase,
    sender: MessageSender,
    buffer: Arc<EntityBuffer>,
    state: ConnectionState,
    queries: HashMap<String, SubscriptionId>,
    chunks: ChunkAssembler,
}

impl SyncConnection {
    pub fn new(
        conn_id: impl Into<String>,
        params: ConnectionParams,
        db: SharedDatabase,
        sender: MessageSender,
        buffer: Arc<EntityBuffer>,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            params,
            db,
            sender,
            buffer,
            state: ConnectionState::Unstarted,
            queries: HashMap::new(),
            chunks: ChunkAssembler::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Ids of the live queries, sorted.
    pub fn query_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.queries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Begin schema negotiation. Does nothing after the first call.
    pub async fn start(&mut self) {
        if self.state != ConnectionState::Unstarted {
            return;
        }
        let Some(hash) = self.params.schema_hash.clone() else {
            return self.ready();
        };

        let negotiation = {
            let db = self.db.lock().await;
            match db.schema() {
                None => Negotiation::Mismatch(
                    "client has a schema but the server is schemaless".into(),
                ),
                Some(schema) if schema.hash().is_ok_and(|own| own == hash) => Negotiation::Ready,
                Some(_) => match db.is_schema_compatible(&hash) {
                    Ok(true) => Negotiation::Ready,
                    Ok(false) => Negotiation::RequestSchema,
                    Err(e) => {
                        tracing::warn!(conn_id = %self.conn_id, error = %e, "Schema compatibility lookup failed");
                        Negotiation::RequestSchema
                    }
                },
            }
        };

        match negotiation {
            Negotiation::Ready => self.ready(),
            Negotiation::RequestSchema => {
                tracing::debug!(conn_id = %self.conn_id, schema_hash = %hash, "Requesting client schema");
                self.state = ConnectionState::AwaitingSchemaResponse;
                self.send(ServerMessage::SchemaRequest {});
            }
            Negotiation::Mismatch(message) => self.reject_schema(message).await,
        }
    }

    /// Handle one text frame, including any message reassembled from chunks.
    pub async fn handle_text(&mut self, text: &str) {
        let mut next = Some(text.to_string());
        while let Some(text) = next.take() {
            match ClientMessage::parse(&text) {
                Ok(message) => next = self.handle_message(message).await,
                Err(failure) => {
                    tracing::debug!(conn_id = %self.conn_id, error = %failure.error, "Rejected frame");
                    self.send(ServerMessage::error(
                        failure.message_type,
                        &failure.error,
                        None,
                    ));
                }
            }
        }
    }

    /// Handle one parsed message. Returns the text of a message completed by
    /// a `CHUNK`, for the caller to dispatch next.
    pub async fn handle_message(&mut self, message: ClientMessage) -> Option<String> {
        let message_type = message.message_type();
        match (self.state, message) {
            (ConnectionState::Closed, _) => {
                tracing::debug!(conn_id = %self.conn_id, message_type, "Ignoring message on closed connection");
            }
            (_, ClientMessage::Ping) => self.send(ServerMessage::Pong),
            (ConnectionState::AwaitingSchemaResponse, ClientMessage::SchemaResponse { schema }) => {
                self.on_schema_response(schema).await
            }
            (ConnectionState::Ready, ClientMessage::SchemaResponse { .. }) => {
                tracing::warn!(conn_id = %self.conn_id, "Unexpected SCHEMA_RESPONSE on ready connection");
            }
            (ConnectionState::Ready, ClientMessage::ConnectQuery { id, params, .. }) => {
                self.connect_query(id, params).await
            }
            (ConnectionState::Ready, ClientMessage::DisconnectQuery { id }) => {
                self.disconnect_query(&id).await
            }
            (ConnectionState::Ready, ClientMessage::Changes { changes }) => {
                self.apply_changes(changes).await
            }
            (
                ConnectionState::Ready,
                ClientMessage::Chunk {
                    data,
                    total,
                    index,
                    id,
                },
            ) => match self.chunks.accept(&id, index, total, data) {
                Ok(complete) => return complete,
                Err(e) => self.send(ServerMessage::error(
                    Some(message_type.to_string()),
                    &e,
                    Some(json!({ "chunkId": id })),
                )),
            },
            (_, _) => {
                let error = Error::ConnectionNotReady(message_type.to_string());
                self.send(ServerMessage::error(
                    Some(message_type.to_string()),
                    &error,
                    None,
                ));
            }
        }
        None
    }

    /// Drop every live query and buffered state. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        if !self.queries.is_empty() {
            let mut db = self.db.lock().await;
            for (query_id, subscription) in self.queries.drain() {
                if let Err(e) = db.unsubscribe(subscription) {
                    tracing::debug!(conn_id = %self.conn_id, query_id = %query_id, error = %e, "Unsubscribe failed");
                }
            }
        }
        self.buffer.clear();
        self.chunks.clear();

        tracing::info!(conn_id = %self.conn_id, client_id = %self.params.client_id, "Sync connection closed");
    }

    fn send(&self, message: ServerMessage) {
        if self.sender.send(message).is_err() {
            tracing::debug!(conn_id = %self.conn_id, "Dropped message for disconnected client");
        }
    }

    fn ready(&mut self) {
        self.state = ConnectionState::Ready;
        self.send(ServerMessage::Ready {});
        tracing::info!(conn_id = %self.conn_id, client_id = %self.params.client_id, "Sync connection ready");
    }

    async fn reject_schema(&mut self, message: String) {
        tracing::warn!(conn_id = %self.conn_id, reason = %message, "Closing on schema mismatch");
        self.send(ServerMessage::close(CloseReason::SchemaMismatch, message));
        self.close().await;
    }

    async fn on_schema_response(&mut self, client_schema: Option<Schema>) {
        let Some(client_schema) = client_schema else {
            return self.ready();
        };

        let outcome = {
            let mut db = self.db.lock().await;
            let Some(server_schema) = db.schema() else {
                drop(db);
                return self
                    .reject_schema("client has a schema but the server is schemaless".into())
                    .await;
            };

            let edits = diff_schemas(server_schema, &client_schema);
            let incompatible = backwards_incompatible_edits(&edits);
            if incompatible.is_empty() {
                let hash = match self.params.schema_hash.clone() {
                    Some(declared) => Ok(declared),
                    None => client_schema.hash(),
                };
                if let Err(e) = hash.and_then(|hash| db.mark_schema_compatible(&hash)) {
                    tracing::warn!(conn_id = %self.conn_id, error = %e, "Could not cache schema compatibility");
                }
                Ok(edits.len())
            } else {
                Err(incompatible.len())
            }
        };

        match outcome {
            Ok(edits) => {
                tracing::debug!(conn_id = %self.conn_id, edits, "Client schema is compatible");
                self.ready()
            }
            Err(incompatible) => {
                self.reject_schema(format!(
                    "client schema has {} backwards incompatible edit(s)",
                    incompatible
                ))
                .await
            }
        }
    }

    async fn connect_query(&mut self, id: String, params: CollectionQuery) {
        let db = Arc::clone(&self.db);
        let mut db = db.lock().await;

        if let Some(previous) = self.queries.remove(&id) {
            if let Err(e) = db.unsubscribe(previous) {
                tracing::debug!(conn_id = %self.conn_id, query_id = %id, error = %e, "Unsubscribe of replaced query failed");
            }
            self.buffer.remove_query(&id);
        }

        let buffer = Arc::clone(&self.buffer);
        let query_id = id.clone();
        let listener = Box::new(move |update: SubscriptionUpdate| {
            buffer.push(&query_id, update.changes, update.timestamp);
        });

        match db.subscribe(params, listener) {
            Ok(subscription) => {
                tracing::debug!(conn_id = %self.conn_id, query_id = %id, subscription, "Query connected");
                self.queries.insert(id, subscription);
            }
            Err(cause) => {
                drop(db);
                let error = Error::QuerySync {
                    query_id: id.clone(),
                    cause: Box::new(cause),
                };
                tracing::warn!(conn_id = %self.conn_id, query_id = %id, error = %error, "Query sync failed");
                self.send(ServerMessage::error(
                    Some("CONNECT_QUERY".into()),
                    &error,
                    Some(json!({ "queryKey": id })),
                ));
            }
        }
    }

    async fn disconnect_query(&mut self, id: &str) {
        let Some(subscription) = self.queries.remove(id) else {
            tracing::debug!(conn_id = %self.conn_id, query_id = %id, "Disconnect for unknown query");
            return;
        };
        if let Err(e) = self.db.lock().await.unsubscribe(subscription) {
            tracing::debug!(conn_id = %self.conn_id, query_id = %id, error = %e, "Unsubscribe failed");
        }
        self.buffer.remove_query(id);
        tracing::debug!(conn_id = %self.conn_id, query_id = %id, "Query disconnected");
    }

    async fn apply_changes(&mut self, changes: DBChanges) {
        let result = self.db.lock().await.apply_changes(&changes);
        match result {
            Ok(timestamp) => {
                tracing::debug!(conn_id = %self.conn_id, timestamp = %timestamp, "Changes applied");
                self.send(ServerMessage::ChangesAck { timestamp });
            }
            Err(error) => {
                let metadata = match &error {
                    Error::ChangesRejected {
                        tx_id, collections, ..
                    } => Some(json!({ "collections": collections, "txId": tx_id })),
                    _ => None,
                };
                tracing::warn!(conn_id = %self.conn_id, error = %error, "Changes rejected");
                self.send(ServerMessage::error(
                    Some("CHANGES".into()),
                    &error,
                    metadata,
                ));
            }
        }
    }
}

impl Drop for SyncConnection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed && !self.queries.is_empty() {
            tracing::warn!(
                conn_id = %self.conn_id,
                queries = self.queries.len(),
                "Sync connection dropped without close"
            );
        }
    }
}
