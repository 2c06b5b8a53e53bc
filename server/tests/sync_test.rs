//! Integration tests for sync connections.
//!
//! Connections are driven directly through their message channel; no
//! sockets are involved.

use serde_json::json;
use tokio::sync::mpsc;
use weft_engine::{
    AttributePath, Clock, CollectionQuery, CollectionSchema, DBChanges, Database, FieldDef,
    FieldType, FilterOp, MemoryClock, MemoryStorage, Schema, Value,
};
use weft_server::db::{shared, SharedDatabase};
use weft_server::sync::{ConnectionParams, ConnectionState, SyncConnection};
use weft_server::websocket::{CloseReason, ConnectionManager, ServerMessage};

fn todo_schema() -> Schema {
    Schema::new(1).with_collection(CollectionSchema::new(
        "todos",
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("done", FieldType::Boolean),
        ],
    ))
}

fn database(schema: Option<Schema>) -> SharedDatabase {
    let clock: Box<dyn Clock> = Box::new(MemoryClock::new("server"));
    let mut db = Database::new(MemoryStorage::new(), clock);
    if let Some(schema) = schema {
        db = db.with_schema(schema);
    }
    shared(db)
}

fn todo_changes(id: &str, document: serde_json::Value) -> DBChanges {
    let mut changes = DBChanges::new();
    changes.set("todos", id, Value::from(document));
    changes
}

struct TestClient {
    conn: SyncConnection,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl TestClient {
    async fn connect(
        manager: &ConnectionManager,
        db: &SharedDatabase,
        schema_hash: Option<String>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let params = ConnectionParams {
            client_id: "client".into(),
            schema_hash,
        };
        let (conn_id, buffer) = manager.register(params.client_id.clone(), tx.clone());
        let mut conn = SyncConnection::new(conn_id, params, db.clone(), tx, buffer);
        conn.start().await;
        Self { conn, rx }
    }

    /// A schemaless client that has already seen READY.
    async fn ready(manager: &ConnectionManager, db: &SharedDatabase) -> Self {
        let mut client = Self::connect(manager, db, None).await;
        assert_eq!(client.recv(), ServerMessage::Ready {});
        client
    }

    async fn send(&mut self, message: serde_json::Value) {
        self.conn.handle_text(&message.to_string()).await;
    }

    fn recv(&mut self) -> ServerMessage {
        self.rx.try_recv().expect("expected a server message")
    }

    fn assert_quiet(&mut self) {
        if let Ok(message) = self.rx.try_recv() {
            panic!("unexpected message: {:?}", message);
        }
    }
}

fn changes_message(changes: &DBChanges) -> serde_json::Value {
    json!({"type": "CHANGES", "payload": {"changes": changes}})
}

fn connect_query(id: &str, collection: &str) -> serde_json::Value {
    json!({
        "type": "CONNECT_QUERY",
        "payload": {"id": id, "params": {"collectionName": collection}}
    })
}

#[cfg(test)]
mod negotiation_tests {
    use super::*;

    #[tokio::test]
    async fn test_schemaless_client_is_ready() {
        let manager = ConnectionManager::new();
        let db = database(Some(todo_schema()));
        let mut client = TestClient::connect(&manager, &db, None).await;

        assert_eq!(client.recv(), ServerMessage::Ready {});
        assert_eq!(client.conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_schemaful_client_on_schemaless_server_is_closed() {
        let manager = ConnectionManager::new();
        let db = database(None);
        let mut client = TestClient::connect(&manager, &db, Some("abc".into())).await;

        match client.recv() {
            ServerMessage::Close { reason, retry, .. } => {
                assert_eq!(reason, CloseReason::SchemaMismatch);
                assert!(!retry);
            }
            other => panic!("Expected Close, got {:?}", other),
        }
        assert_eq!(client.conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_matching_hash_is_ready() {
        let manager = ConnectionManager::new();
        let db = database(Some(todo_schema()));
        let mut client =
            TestClient::connect(&manager, &db, Some(todo_schema().hash().unwrap())).await;

        assert_eq!(client.recv(), ServerMessage::Ready {});
    }

    #[tokio::test]
    async fn test_compatible_schema_is_cached() {
        let manager = ConnectionManager::new();
        let db = database(Some(todo_schema()));
        let client_schema = todo_schema().with_collection(CollectionSchema::new(
            "tags",
            vec![FieldDef::required("name", FieldType::String)],
        ));
        let hash = client_schema.hash().unwrap();

        let mut client = TestClient::connect(&manager, &db, Some(hash.clone())).await;
        assert_eq!(client.recv(), ServerMessage::SchemaRequest {});
        assert_eq!(client.conn.state(), ConnectionState::AwaitingSchemaResponse);

        client
            .send(json!({"type": "SCHEMA_RESPONSE", "payload": {"schema": client_schema}}))
            .await;
        assert_eq!(client.recv(), ServerMessage::Ready {});
        assert!(db.lock().await.is_schema_compatible(&hash).unwrap());

        // A second connection with the same hash skips the request.
        let mut second = TestClient::connect(&manager, &db, Some(hash)).await;
        assert_eq!(second.recv(), ServerMessage::Ready {});
    }

    #[tokio::test]
    async fn test_incompatible_schema_is_closed() {
        let manager = ConnectionManager::new();
        let db = database(Some(todo_schema()));
        let client_schema = Schema::new(1).with_collection(CollectionSchema::new(
            "todos",
            vec![FieldDef::required("title", FieldType::String)],
        ));

        let mut client =
            TestClient::connect(&manager, &db, Some(client_schema.hash().unwrap())).await;
        assert_eq!(client.recv(), ServerMessage::SchemaRequest {});

        client
            .send(json!({"type": "SCHEMA_RESPONSE", "payload": {"schema": client_schema}}))
            .await;
        match client.recv() {
            ServerMessage::Close { reason, retry, .. } => {
                assert_eq!(reason, CloseReason::SchemaMismatch);
                assert!(!retry);
            }
            other => panic!("Expected Close, got {:?}", other),
        }
        assert_eq!(client.conn.state(), ConnectionState::Closed);
        assert!(!db
            .lock()
            .await
            .is_schema_compatible(&client_schema.hash().unwrap())
            .unwrap());
    }

    #[tokio::test]
    async fn test_schema_response_without_schema_is_ready() {
        let manager = ConnectionManager::new();
        let db = database(Some(todo_schema()));
        let mut client = TestClient::connect(&manager, &db, Some("stale".into())).await;
        assert_eq!(client.recv(), ServerMessage::SchemaRequest {});

        client
            .send(json!({"type": "SCHEMA_RESPONSE", "payload": {}}))
            .await;
        assert_eq!(client.recv(), ServerMessage::Ready {});
    }

    #[tokio::test]
    async fn test_messages_before_ready_are_answered_with_errors() {
        let manager = ConnectionManager::new();
        let db = database(Some(todo_schema()));
        let mut client = TestClient::connect(&manager, &db, Some("unknown".into())).await;
        assert_eq!(client.recv(), ServerMessage::SchemaRequest {});

        client.send(connect_query("q1", "todos")).await;
        match client.recv() {
            ServerMessage::Error {
                message_type,
                error,
                ..
            } => {
                assert_eq!(message_type.as_deref(), Some("CONNECT_QUERY"));
                assert_eq!(error.name, "ConnectionNotReadyError");
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        assert_eq!(client.conn.state(), ConnectionState::AwaitingSchemaResponse);
        assert_eq!(db.lock().await.subscription_count(), 0);

        client.send(json!({"type": "PING"})).await;
        assert_eq!(client.recv(), ServerMessage::Pong);
    }
}

#[cfg(test)]
mod changes_tests {
    use super::*;

    #[tokio::test]
    async fn test_changes_are_acknowledged() {
        let manager = ConnectionManager::new();
        let db = database(Some(todo_schema()));
        let mut client = TestClient::ready(&manager, &db).await;

        let changes = todo_changes("1", json!({"title": "write tests"}));
        client.send(changes_message(&changes)).await;

        match client.recv() {
            ServerMessage::ChangesAck { timestamp } => {
                assert_eq!(timestamp.replica_id, "server")
            }
            other => panic!("Expected ChangesAck, got {:?}", other),
        }
        assert_eq!(
            db.lock().await.fetch_by_id("todos", "1").unwrap(),
            Some(Value::from(json!({"id": "1", "title": "write tests"})))
        );
    }

    #[tokio::test]
    async fn test_rejected_changes_report_collections_and_tx_id() {
        let manager = ConnectionManager::new();
        let db = database(Some(todo_schema()));
        let mut client = TestClient::ready(&manager, &db).await;

        let changes = todo_changes("1", json!({"done": true}));
        client.send(changes_message(&changes)).await;

        match client.recv() {
            ServerMessage::Error {
                message_type,
                error,
                metadata,
            } => {
                assert_eq!(message_type.as_deref(), Some("CHANGES"));
                assert_eq!(error.name, "ChangesRejectedError");
                let metadata = metadata.unwrap();
                assert_eq!(metadata["collections"], json!(["todos"]));
                assert_eq!(metadata["txId"]["replicaId"], "server");
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        assert_eq!(client.conn.state(), ConnectionState::Ready);
        assert_eq!(db.lock().await.fetch_by_id("todos", "1").unwrap(), None);

        // The connection keeps working after a rejection.
        let changes = todo_changes("1", json!({"title": "ok"}));
        client.send(changes_message(&changes)).await;
        assert!(matches!(client.recv(), ServerMessage::ChangesAck { .. }));
    }

    #[tokio::test]
    async fn test_chunks_reassemble_out_of_order() {
        let manager = ConnectionManager::new();
        let db = database(None);
        let mut client = TestClient::ready(&manager, &db).await;

        let text = changes_message(&todo_changes("1", json!({"title": "chunked"}))).to_string();
        let third = text.len() / 3;
        let parts = [
            &text[..third],
            &text[third..2 * third],
            &text[2 * third..],
        ];

        for index in [1usize, 0] {
            client
                .send(json!({
                    "type": "CHUNK",
                    "payload": {"data": parts[index], "total": 3, "index": index, "id": "m1"}
                }))
                .await;
            client.assert_quiet();
        }
        client
            .send(json!({
                "type": "CHUNK",
                "payload": {"data": parts[2], "total": 3, "index": 2, "id": "m1"}
            }))
            .await;

        assert!(matches!(client.recv(), ServerMessage::ChangesAck { .. }));
        assert!(db
            .lock()
            .await
            .fetch_by_id("todos", "1")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_close_the_connection() {
        let manager = ConnectionManager::new();
        let db = database(None);
        let mut client = TestClient::ready(&manager, &db).await;

        client.conn.handle_text("{not json").await;
        match client.recv() {
            ServerMessage::Error {
                message_type,
                error,
                ..
            } => {
                assert_eq!(message_type, None);
                assert_eq!(error.name, "MalformedMessagePayloadError");
            }
            other => panic!("Expected Error, got {:?}", other),
        }

        client
            .send(json!({"type": "SUBSCRIBE", "payload": {}}))
            .await;
        match client.recv() {
            ServerMessage::Error { error, .. } => {
                assert_eq!(error.name, "UnrecognizedMessageTypeError")
            }
            other => panic!("Expected Error, got {:?}", other),
        }

        assert_eq!(client.conn.state(), ConnectionState::Ready);
        client.send(json!({"type": "PING"})).await;
        assert_eq!(client.recv(), ServerMessage::Pong);
    }
}

#[cfg(test)]
mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_results_wait_for_flush() {
        let manager = ConnectionManager::new();
        let db = database(None);
        db.lock()
            .await
            .insert("todos", Value::from(json!({"id": "1", "title": "a"})))
            .unwrap();
        let mut client = TestClient::ready(&manager, &db).await;

        client.send(connect_query("q1", "todos")).await;
        client.assert_quiet();
        assert_eq!(client.conn.query_ids(), vec!["q1"]);

        assert_eq!(manager.flush_all(), 1);
        match client.recv() {
            ServerMessage::EntityData {
                changes,
                timestamp,
                for_queries,
            } => {
                assert_eq!(for_queries, vec!["q1"]);
                assert_eq!(timestamp, None);
                assert_eq!(
                    changes.collection("todos").unwrap().sets["1"],
                    Value::from(json!({"id": "1", "title": "a"}))
                );
            }
            other => panic!("Expected EntityData, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_writes_from_another_connection_are_buffered() {
        let manager = ConnectionManager::new();
        let db = database(None);
        let mut reader = TestClient::ready(&manager, &db).await;
        let mut writer = TestClient::ready(&manager, &db).await;

        reader.send(connect_query("q1", "todos")).await;
        manager.flush_all();
        assert!(matches!(reader.recv(), ServerMessage::EntityData { .. }));

        writer
            .send(changes_message(&todo_changes("7", json!({"title": "from writer"}))))
            .await;
        let ServerMessage::ChangesAck { timestamp: acked } = writer.recv() else {
            panic!("Expected ChangesAck");
        };
        let second = todo_changes("8", json!({"title": "another"}));
        writer.send(changes_message(&second)).await;
        let ServerMessage::ChangesAck { timestamp: latest } = writer.recv() else {
            panic!("Expected ChangesAck");
        };
        assert!(latest > acked);

        // Both writes leave in one message.
        assert_eq!(manager.flush_all(), 1);
        match reader.recv() {
            ServerMessage::EntityData {
                changes,
                timestamp,
                for_queries,
            } => {
                assert_eq!(for_queries, vec!["q1"]);
                assert_eq!(timestamp, Some(latest));
                let todos = changes.collection("todos").unwrap();
                assert_eq!(todos.sets.len(), 2);
                assert_eq!(
                    todos.sets["7"],
                    Value::from(json!({"id": "7", "title": "from writer"}))
                );
            }
            other => panic!("Expected EntityData, got {:?}", other),
        }
        reader.assert_quiet();
        writer.assert_quiet();
    }

    #[tokio::test]
    async fn test_deletes_are_buffered() {
        let manager = ConnectionManager::new();
        let db = database(None);
        db.lock()
            .await
            .insert("todos", Value::from(json!({"id": "1", "title": "a"})))
            .unwrap();
        let mut client = TestClient::ready(&manager, &db).await;
        client.send(connect_query("q1", "todos")).await;
        manager.flush_all();
        client.recv();

        let mut changes = DBChanges::new();
        changes.delete("todos", "1");
        client.send(changes_message(&changes)).await;
        assert!(matches!(client.recv(), ServerMessage::ChangesAck { .. }));

        manager.flush_all();
        match client.recv() {
            ServerMessage::EntityData { changes, .. } => {
                assert!(changes.collection("todos").unwrap().deletes.contains("1"))
            }
            other => panic!("Expected EntityData, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_entity_leaving_one_of_two_queries_is_not_deleted() {
        let open = CollectionQuery::new("todos").filter(
            AttributePath::of(["done"]),
            FilterOp::Eq,
            Value::from(false),
        );
        for (all_id, open_id) in [("all", "open"), ("open", "all"), ("q1", "q2"), ("q2", "q1")] {
            let manager = ConnectionManager::new();
            let db = database(None);
            db.lock()
                .await
                .insert("todos", Value::from(json!({"id": "a", "title": "a", "done": false})))
                .unwrap();
            let mut client = TestClient::ready(&manager, &db).await;

            client.send(connect_query(all_id, "todos")).await;
            client
                .send(json!({
                    "type": "CONNECT_QUERY",
                    "payload": {"id": open_id, "params": open}
                }))
                .await;
            manager.flush_all();
            assert!(matches!(client.recv(), ServerMessage::EntityData { .. }));

            client
                .send(changes_message(&todo_changes(
                    "a",
                    json!({"id": "a", "title": "a", "done": true}),
                )))
                .await;
            assert!(matches!(client.recv(), ServerMessage::ChangesAck { .. }));

            assert_eq!(manager.flush_all(), 1);
            match client.recv() {
                ServerMessage::EntityData { changes, .. } => {
                    let todos = changes.collection("todos").unwrap();
                    assert!(todos.deletes.is_empty(), "{} / {}: {:?}", all_id, open_id, todos);
                    assert_eq!(
                        todos.sets["a"].get_path(AttributePath::of(["done"]).segments()),
                        Some(&Value::from(true))
                    );
                }
                other => panic!("Expected EntityData, got {:?}", other),
            }

            // Once the entity is gone from every query the delete goes out.
            let mut removal = DBChanges::new();
            removal.delete("todos", "a");
            client.send(changes_message(&removal)).await;
            assert!(matches!(client.recv(), ServerMessage::ChangesAck { .. }));
            manager.flush_all();
            match client.recv() {
                ServerMessage::EntityData { changes, .. } => {
                    assert!(changes.collection("todos").unwrap().deletes.contains("a"))
                }
                other => panic!("Expected EntityData, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_query_stops_updates() {
        let manager = ConnectionManager::new();
        let db = database(None);
        let mut client = TestClient::ready(&manager, &db).await;

        client.send(connect_query("q1", "todos")).await;
        client
            .send(json!({"type": "DISCONNECT_QUERY", "payload": {"id": "q1"}}))
            .await;
        assert!(client.conn.query_ids().is_empty());
        assert_eq!(db.lock().await.subscription_count(), 0);

        client
            .send(changes_message(&todo_changes("1", json!({"title": "a"}))))
            .await;
        assert!(matches!(client.recv(), ServerMessage::ChangesAck { .. }));
        assert_eq!(manager.flush_all(), 0);

        // Disconnecting an unknown query is a no-op.
        client
            .send(json!({"type": "DISCONNECT_QUERY", "payload": {"id": "nope"}}))
            .await;
        client.assert_quiet();
    }

    #[tokio::test]
    async fn test_reconnecting_a_query_id_replaces_its_subscription() {
        let manager = ConnectionManager::new();
        let db = database(None);
        let mut client = TestClient::ready(&manager, &db).await;

        client.send(connect_query("q1", "todos")).await;
        client.send(connect_query("q1", "notes")).await;
        client.assert_quiet();
        assert_eq!(client.conn.query_ids(), vec!["q1"]);
        assert_eq!(db.lock().await.subscription_count(), 1);

        client
            .send(changes_message(&todo_changes("1", json!({"title": "a"}))))
            .await;
        assert!(matches!(client.recv(), ServerMessage::ChangesAck { .. }));
        manager.flush_all();
        match client.recv() {
            ServerMessage::EntityData { changes, for_queries, .. } => {
                assert_eq!(for_queries, vec!["q1"]);
                assert!(changes.collection("todos").map_or(true, |c| c.is_empty()));
            }
            other => panic!("Expected EntityData, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_query_reports_query_key() {
        let manager = ConnectionManager::new();
        let db = database(Some(todo_schema()));
        let mut client = TestClient::ready(&manager, &db).await;

        client.send(connect_query("q1", "missing")).await;
        match client.recv() {
            ServerMessage::Error {
                message_type,
                error,
                metadata,
            } => {
                assert_eq!(message_type.as_deref(), Some("CONNECT_QUERY"));
                assert_eq!(error.name, "QuerySyncError");
                assert_eq!(error.status, 404);
                assert_eq!(metadata, Some(json!({"queryKey": "q1"})));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        assert!(client.conn.query_ids().is_empty());
        assert_eq!(client.conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = ConnectionManager::new();
        let db = database(None);
        let mut client = TestClient::ready(&manager, &db).await;
        client.send(connect_query("q1", "todos")).await;
        client.send(connect_query("q2", "notes")).await;
        assert_eq!(db.lock().await.subscription_count(), 2);

        client.conn.close().await;
        client.conn.close().await;

        assert_eq!(client.conn.state(), ConnectionState::Closed);
        assert!(client.conn.query_ids().is_empty());
        assert_eq!(db.lock().await.subscription_count(), 0);
        assert_eq!(manager.flush_all(), 0);

        client.send(json!({"type": "PING"})).await;
        client.assert_quiet();
    }
}
