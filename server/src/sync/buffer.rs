//! Per-connection buffer of live-query deltas awaiting the next flush.

use std::collections::BTreeSet;

use dashmap::DashMap;
use weft_engine::{diff::merge_db_changes, DBChanges, Timestamp};

use crate::websocket::ServerMessage;

#[derive(Debug, Default)]
struct Pending {
    changes: DBChanges,
    timestamp: Option<Timestamp>,
}

/// Deltas keyed by the query that produced them.
///
/// A delete in a query delta only means the entity left that query's
/// results. The buffer remembers which queries currently hold each entity
/// and forwards a delete only once no query of the connection holds it.
///
/// Subscription listeners push into it while holding the database lock; the
/// flush task drains it without touching the database.
#[derive(Debug, Default)]
pub struct EntityBuffer {
    pending: DashMap<String, Pending>,
    /// `(collection, id)` to the queries whose results contain it
    held: DashMap<(String, String), BTreeSet<String>>,
}

impl EntityBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delta for `query_id`. Empty deltas are kept so a query with
    /// no initial results is still reported.
    pub fn push(&self, query_id: &str, changes: DBChanges, timestamp: Option<Timestamp>) {
        for (collection, delta) in changes.iter() {
            for id in delta.sets.keys() {
                self.held
                    .entry((collection.to_string(), id.clone()))
                    .or_default()
                    .insert(query_id.to_string());
            }
            for id in &delta.deletes {
                let key = (collection.to_string(), id.clone());
                if let Some(mut holders) = self.held.get_mut(&key) {
                    holders.remove(query_id);
                }
                self.held.remove_if(&key, |_, holders| holders.is_empty());
            }
        }

        let mut entry = self.pending.entry(query_id.to_string()).or_default();
        merge_db_changes(&mut entry.changes, changes);
        if timestamp > entry.timestamp {
            entry.timestamp = timestamp;
        }
    }

    /// Forget a query's pending deltas and the entities it held.
    pub fn remove_query(&self, query_id: &str) {
        self.pending.remove(query_id);
        self.held.retain(|_, holders| {
            holders.remove(query_id);
            !holders.is_empty()
        });
    }

    pub fn clear(&self) {
        self.pending.clear();
        self.held.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether some live query of this connection has `id` in its results.
    pub fn is_held(&self, collection: &str, id: &str) -> bool {
        self.held
            .contains_key(&(collection.to_string(), id.to_string()))
    }

    /// Drain everything into one `ENTITY_DATA` message.
    ///
    /// A set from any query beats a removal from another, and a removal is
    /// dropped while another query still holds the entity.
    pub fn take(&self) -> Option<ServerMessage> {
        let mut keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        keys.sort();

        let mut changes = DBChanges::new();
        let mut removed = Vec::new();
        let mut timestamp = None;
        let mut for_queries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((query_id, pending)) = self.pending.remove(&key) else {
                continue;
            };
            for (collection, delta) in pending.changes {
                let target = changes.collection_mut(&collection);
                for (id, value) in delta.sets {
                    target.set(id, value);
                }
                removed.extend(delta.deletes.into_iter().map(|id| (collection.clone(), id)));
            }
            if pending.timestamp > timestamp {
                timestamp = pending.timestamp;
            }
            for_queries.push(query_id);
        }

        for (collection, id) in removed {
            if self.is_held(&collection, &id) {
                continue;
            }
            let target = changes.collection_mut(&collection);
            if !target.sets.contains_key(&id) {
                target.delete(id);
            }
        }

        if for_queries.is_empty() {
            return None;
        }
        Some(ServerMessage::EntityData {
            changes,
            timestamp,
            for_queries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_engine::Value;

    fn set(collection: &str, id: &str, title: &str) -> DBChanges {
        let mut changes = DBChanges::new();
        changes.set(
            collection,
            id,
            Value::from(serde_json::json!({"id": id, "title": title})),
        );
        changes
    }

    #[test]
    fn take_merges_queries() {
        let buffer = EntityBuffer::new();
        assert!(buffer.take().is_none());

        buffer.push("q2", set("todos", "1", "a"), Some(Timestamp::new(1, "server")));
        buffer.push("q1", set("todos", "2", "b"), None);
        buffer.push("q2", set("todos", "1", "c"), Some(Timestamp::new(3, "server")));

        let Some(ServerMessage::EntityData {
            changes,
            timestamp,
            for_queries,
        }) = buffer.take()
        else {
            panic!("Expected EntityData");
        };
        assert_eq!(for_queries, vec!["q1", "q2"]);
        assert_eq!(timestamp, Some(Timestamp::new(3, "server")));
        let todos = changes.collection("todos").unwrap();
        assert_eq!(todos.sets.len(), 2);
        assert_eq!(
            todos.sets["1"],
            Value::from(serde_json::json!({"id": "1", "title": "c"}))
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_delta_is_reported() {
        let buffer = EntityBuffer::new();
        buffer.push("q1", DBChanges::new(), None);
        match buffer.take() {
            Some(ServerMessage::EntityData { for_queries, .. }) => {
                assert_eq!(for_queries, vec!["q1"])
            }
            other => panic!("Expected EntityData, got {:?}", other),
        }
    }

    fn delete(collection: &str, id: &str) -> DBChanges {
        let mut changes = DBChanges::new();
        changes.delete(collection, id);
        changes
    }

    fn flushed(buffer: &EntityBuffer) -> DBChanges {
        match buffer.take() {
            Some(ServerMessage::EntityData { changes, .. }) => changes,
            other => panic!("Expected EntityData, got {:?}", other),
        }
    }

    #[test]
    fn entity_leaving_one_query_survives_in_another() {
        // Query ids in both orders so the outcome cannot hinge on iteration order.
        for (holder, leaver) in [("all", "open"), ("open", "all")] {
            let buffer = EntityBuffer::new();
            buffer.push(holder, set("todos", "a", "x"), None);
            buffer.push(leaver, set("todos", "a", "x"), None);
            flushed(&buffer);

            buffer.push(leaver, delete("todos", "a"), None);
            let todos = flushed(&buffer).collection("todos").cloned().unwrap_or_default();
            assert!(todos.deletes.is_empty(), "{} -> {:?}", leaver, todos);
            assert!(buffer.is_held("todos", "a"));

            buffer.push(holder, set("todos", "a", "y"), None);
            buffer.push(leaver, delete("todos", "a"), None);
            let todos = flushed(&buffer).collection("todos").cloned().unwrap();
            assert!(todos.deletes.is_empty());
            assert_eq!(todos.sets["a"], Value::from(serde_json::json!({"id": "a", "title": "y"})));
        }
    }

    #[test]
    fn entity_leaving_every_query_is_deleted() {
        let buffer = EntityBuffer::new();
        buffer.push("q1", set("todos", "a", "x"), None);
        buffer.push("q2", set("todos", "a", "x"), None);
        flushed(&buffer);

        buffer.push("q1", delete("todos", "a"), None);
        buffer.push("q2", delete("todos", "a"), None);
        let todos = flushed(&buffer).collection("todos").cloned().unwrap();
        assert!(todos.deletes.contains("a"));
        assert!(!buffer.is_held("todos", "a"));
    }

    #[test]
    fn later_delete_in_same_query_wins() {
        let buffer = EntityBuffer::new();
        buffer.push("q1", set("todos", "a", "x"), None);
        buffer.push("q1", delete("todos", "a"), None);
        let todos = flushed(&buffer).collection("todos").cloned().unwrap();
        assert!(todos.sets.is_empty());
        assert!(todos.deletes.contains("a"));
    }

    #[test]
    fn removed_query_is_not_flushed() {
        let buffer = EntityBuffer::new();
        buffer.push("q1", set("todos", "1", "a"), None);
        buffer.remove_query("q1");
        assert!(buffer.take().is_none());
        assert!(!buffer.is_held("todos", "1"));

        buffer.push("q2", set("todos", "1", "a"), None);
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
