//! Multi-replica convergence tests for weft-engine
//!
//! Each test writes on independent replicas, exchanges facts between them
//! and checks that every replica materializes the same documents.

use serde_json::json;
use weft_engine::{
    AttributePath, CollectionQuery, Database, MemoryClock, MemoryStorage, Timestamp, TripleReader,
    TripleRow, Value,
};

type Replica = Database<MemoryStorage, MemoryClock>;

fn replica(id: &str) -> Replica {
    Database::new(MemoryStorage::new(), MemoryClock::new(id))
}

fn all_facts(db: &Replica) -> Vec<TripleRow> {
    db.store().find_all_triples().unwrap()
}

/// Send every fact of `from` to `to`.
fn sync(from: &Replica, to: &mut Replica) {
    to.insert_remote_triples(all_facts(from)).unwrap();
}

fn doc(value: serde_json::Value) -> Value {
    Value::from(value)
}

// ============================================================================
// Nested Objects
// ============================================================================

#[test]
fn sibling_leaves_written_on_different_replicas_merge() {
    let mut a = replica("A");
    let mut b = replica("B");

    a.insert("users", doc(json!({"id": "1", "address": {}}))).unwrap();
    sync(&a, &mut b);

    a.update("users", "1", |t| t.set(AttributePath::of(["address", "city"]), "Paris"))
        .unwrap();
    b.update("users", "1", |t| t.set(AttributePath::of(["address", "zip"]), "75001"))
        .unwrap();

    sync(&a, &mut b);
    sync(&b, &mut a);

    let expected = doc(json!({"id": "1", "address": {"city": "Paris", "zip": "75001"}}));
    assert_eq!(a.fetch_by_id("users", "1").unwrap(), Some(expected.clone()));
    assert_eq!(b.fetch_by_id("users", "1").unwrap(), Some(expected));
}

#[test]
fn object_assignment_shadows_concurrent_older_leaf() {
    let mut a = replica("A");
    let mut b = replica("B");

    a.insert("users", doc(json!({"id": "1", "address": {"city": "Paris"}})))
        .unwrap();
    sync(&a, &mut b);

    // B writes a leaf at sequence 2, A then replaces the whole object at a
    // later sequence.
    b.update("users", "1", |t| t.set(AttributePath::of(["address", "zip"]), "75001"))
        .unwrap();
    sync(&b, &mut a);
    a.update("users", "1", |t| {
        t.set(AttributePath::of(["address"]), doc(json!({"city": "Lyon"})))
    })
    .unwrap();
    sync(&a, &mut b);

    let expected = doc(json!({"id": "1", "address": {"city": "Lyon"}}));
    assert_eq!(a.fetch_by_id("users", "1").unwrap(), Some(expected.clone()));
    assert_eq!(b.fetch_by_id("users", "1").unwrap(), Some(expected));
}

// ============================================================================
// Conflicts
// ============================================================================

#[test]
fn tombstone_beats_older_writes_from_every_replica() {
    let mut server = replica("server");
    let row = |value: Option<&str>, seq: u64, replica: &str| {
        let attribute = AttributePath::of(["users", "name"]);
        let ts = Timestamp::new(seq, replica);
        match value {
            Some(v) => TripleRow::new("users#1", attribute, Value::from(v), ts),
            None => TripleRow::tombstone("users#1", attribute, ts),
        }
    };
    let mut facts = vec![
        TripleRow::new(
            "users#1",
            AttributePath::collection_marker(),
            Value::from("users"),
            Timestamp::new(0, "A"),
        ),
        TripleRow::new(
            "users#1",
            AttributePath::of(["users"]),
            Value::from("{}"),
            Timestamp::new(0, "A"),
        ),
        row(Some("bob"), 0, "A"),
        row(Some("bob2"), 1, "A"),
        row(None, 2, "A"),
        row(Some("alice"), 1, "other"),
    ];
    facts.reverse();
    server.insert_remote_triples(facts).unwrap();

    assert_eq!(server.fetch_by_id("users", "1").unwrap(), Some(doc(json!({}))));
}

#[test]
fn higher_replica_wins_at_equal_sequence() {
    let mut a = replica("A");
    let mut b = replica("B");
    a.insert("users", doc(json!({"id": "1", "name": "a"}))).unwrap();
    b.insert("users", doc(json!({"id": "1", "name": "b"}))).unwrap();

    sync(&a, &mut b);
    sync(&b, &mut a);

    let expected = doc(json!({"id": "1", "name": "b"}));
    assert_eq!(a.fetch_by_id("users", "1").unwrap(), Some(expected.clone()));
    assert_eq!(b.fetch_by_id("users", "1").unwrap(), Some(expected));
}

#[test]
fn delete_on_one_replica_and_edit_on_another() {
    let mut a = replica("A");
    let mut b = replica("B");
    a.insert("todos", doc(json!({"id": "t", "title": "x"}))).unwrap();
    sync(&a, &mut b);

    a.delete("todos", "t").unwrap();
    b.update("todos", "t", |t| t.set(AttributePath::of(["title"]), "y"))
        .unwrap();
    sync(&a, &mut b);
    sync(&b, &mut a);

    // Deletion tombstones membership; an edit does not resurrect it.
    assert_eq!(a.fetch_by_id("todos", "t").unwrap(), None);
    assert_eq!(b.fetch_by_id("todos", "t").unwrap(), None);
    assert!(a.fetch(&CollectionQuery::new("todos")).unwrap().is_empty());
}

#[test]
fn replicas_observe_remote_sequences() {
    let mut a = replica("A");
    let mut b = replica("B");
    for i in 0..5 {
        a.insert("items", doc(json!({"id": format!("{}", i)}))).unwrap();
    }
    sync(&a, &mut b);

    // B's next write orders after everything it has seen.
    let (_, ts) = b.insert("items", doc(json!({"id": "late"}))).unwrap();
    assert_eq!(ts, Timestamp::new(6, "B"));
    assert_eq!(
        b.store().find_max_client_timestamp("A").unwrap(),
        Some(Timestamp::new(5, "A"))
    );
}
