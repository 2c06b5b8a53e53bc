//! Database facade: documents over the triple store, plus live queries.
//!
//! Writes go through a single [`TripleStore`] transaction each. After every
//! commit the database re-evaluates the subscriptions whose queries read a
//! changed collection and hands each listener the delta of its results.

use crate::change_tracker::{Change, ChangeTracker};
use crate::clock::Clock;
use crate::diff::{diff_collection, CollectionView, DBChanges};
use crate::entity::{entities_from_triples, Entity};
use crate::ivm::HashedQuery;
use crate::query::{CollectionQuery, CollectionSource, QueryEvaluator};
use crate::schema::Schema;
use crate::snapshot::StoreSnapshot;
use crate::storage::{Direction, TupleStorage};
use crate::triple::{entity_id, entity_to_triples, split_entity_id, value_to_triples};
use crate::triple_store::{CommitSummary, TripleReader, TripleStore, TripleStoreTransaction};
use crate::{
    AttributePath, CollectionName, Error, Object, Result, Timestamp, TripleRow, Value,
};
use std::collections::{BTreeMap, BTreeSet};

/// Metadata namespace of schema hashes known to be compatible.
const SCHEMA_COMPATIBLE_KEY: [&str; 2] = ["schema", "compatible"];

pub type SubscriptionId = u64;

/// Receives the initial results of a subscription and every later delta.
pub type SubscriptionListener = Box<dyn FnMut(SubscriptionUpdate) + Send>;

/// A change to a subscription's results.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate {
    pub subscription_id: SubscriptionId,
    pub changes: DBChanges,
    /// Timestamp of the commit that caused the update, if any
    pub timestamp: Option<Timestamp>,
}

struct Subscription {
    query: CollectionQuery,
    /// Every collection the query tree reads
    collections: BTreeSet<CollectionName>,
    results: CollectionView,
    listener: SubscriptionListener,
}

impl<S: TupleStorage, C: Clock> CollectionSource for TripleStore<S, C> {
    fn documents(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let entities = entities_from_triples(self.find_by_collection(collection, Direction::Asc)?)?;
        Ok(entities
            .into_values()
            .filter(Entity::exists)
            .filter_map(|entity| {
                let id = entity.document_id()?.to_string();
                Some((id, entity.into_data()))
            })
            .collect())
    }
}

/// Documents, queries and subscriptions over one triple store.
pub struct Database<S: TupleStorage, C: Clock> {
    store: TripleStore<S, C>,
    schema: Option<Schema>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_subscription: SubscriptionId,
}

impl<S: TupleStorage, C: Clock> Database<S, C> {
    pub fn new(storage: S, clock: C) -> Self {
        Self::from_store(TripleStore::new(storage, clock))
    }

    pub fn from_store(store: TripleStore<S, C>) -> Self {
        Self {
            store,
            schema: None,
            subscriptions: BTreeMap::new(),
            next_subscription: 1,
        }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn replica_id(&self) -> &str {
        self.store.replica_id()
    }

    pub fn store(&self) -> &TripleStore<S, C> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TripleStore<S, C> {
        &mut self.store
    }

    /// Insert a new document. Its id is taken from the `id` field or
    /// generated.
    pub fn insert(&mut self, collection: &str, document: Value) -> Result<(String, Timestamp)> {
        let (id, document) = prepare_document(collection, document)?;
        if self.entity(collection, &id)?.exists() {
            return Err(Error::EntityAlreadyExists(entity_id(collection, &id)));
        }
        self.validate(collection, &document)?;

        let (timestamp, summary) = self.store.transact(|tx| {
            let timestamp = tx.timestamp()?;
            tx.insert_triples(entity_to_triples(
                &collection.to_string(),
                &id,
                &document,
                &timestamp,
            ))?;
            Ok(timestamp)
        })?;
        tracing::debug!(collection, id = %id, timestamp = %timestamp, "document inserted");
        self.notify(&summary);
        Ok((id, timestamp))
    }

    /// Edit a document through a [`ChangeTracker`]. Returns `None` if the
    /// callback made no changes.
    pub fn update<F>(&mut self, collection: &str, id: &str, edit: F) -> Result<Option<Timestamp>>
    where
        F: FnOnce(&mut ChangeTracker) -> Result<()>,
    {
        let entity = self.entity(collection, id)?;
        if !entity.exists() {
            return Err(Error::EntityNotFound(entity_id(collection, id)));
        }
        let mut tracker = ChangeTracker::new(entity.into_data());
        edit(&mut tracker)?;
        if tracker.is_empty() {
            return Ok(None);
        }
        self.validate(collection, tracker.document())?;

        let eid = entity_id(collection, id);
        let (timestamp, summary) = self.store.transact(|tx| {
            write_changes(tx, &eid, collection, tracker.changes())?;
            tx.timestamp()
        })?;
        self.notify(&summary);
        Ok(Some(timestamp))
    }

    /// Delete a document.
    pub fn delete(&mut self, collection: &str, id: &str) -> Result<Timestamp> {
        if !self.entity(collection, id)?.exists() {
            return Err(Error::EntityNotFound(entity_id(collection, id)));
        }
        let eid = entity_id(collection, id);
        let (timestamp, summary) = self.store.transact(|tx| {
            tx.expire_entity(eid.clone())?;
            tx.timestamp()
        })?;
        tracing::debug!(entity_id = %eid, timestamp = %timestamp, "document deleted");
        self.notify(&summary);
        Ok(timestamp)
    }

    /// Run a query and return matching documents in query order.
    pub fn fetch(&self, query: &CollectionQuery) -> Result<Vec<(String, Value)>> {
        if let Some(schema) = &self.schema {
            if schema.get_collection(&query.collection_name).is_none() {
                return Err(Error::CollectionNotFound(query.collection_name.clone()));
            }
        }
        QueryEvaluator::new(&self.store).execute(query)
    }

    pub fn fetch_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let entity = self.entity(collection, id)?;
        Ok(entity.exists().then(|| entity.into_data()))
    }

    fn entity(&self, collection: &str, id: &str) -> Result<Entity> {
        Entity::from_triples(self.store.find_by_entity(&entity_id(collection, id))?)
    }

    fn validate(&self, collection: &str, document: &Value) -> Result<()> {
        match &self.schema {
            Some(schema) => schema.validate_document(collection, document),
            None => Ok(()),
        }
    }

    /// Apply a change set at one fresh timestamp. Sets create missing
    /// documents and merge into existing ones; deletes remove documents.
    /// When any collection fails, nothing is written and the error names
    /// the failing collections and the timestamp assigned to the attempt.
    pub fn apply_changes(&mut self, changes: &DBChanges) -> Result<Timestamp> {
        let schema = self.schema.clone();
        let mut tx = self.store.transaction();
        let timestamp = tx.timestamp()?;
        let mut failed = Vec::new();
        let mut first_error = None;
        for (collection, collection_changes) in changes.iter() {
            let result = (|| -> Result<()> {
                for (id, value) in &collection_changes.sets {
                    apply_set(&mut tx, schema.as_ref(), collection, id, value, &timestamp)?;
                }
                for id in &collection_changes.deletes {
                    tx.expire_entity(entity_id(collection, id))?;
                }
                Ok(())
            })();
            if let Err(e) = result {
                failed.push(collection.to_string());
                first_error.get_or_insert(e);
            }
        }

        if let Some(cause) = first_error {
            tx.cancel();
            tracing::warn!(timestamp = %timestamp, collections = ?failed, error = %cause, "changes rejected");
            return Err(Error::ChangesRejected {
                tx_id: timestamp,
                collections: failed,
                cause: Box::new(cause),
            });
        }
        let summary = tx.commit()?;
        self.notify(&summary);
        Ok(timestamp)
    }

    /// Merge facts written by another replica.
    pub fn insert_remote_triples(&mut self, rows: Vec<TripleRow>) -> Result<CommitSummary> {
        let summary = self.store.insert_triples(rows)?;
        self.notify(&summary);
        Ok(summary)
    }

    pub fn is_schema_compatible(&self, hash: &str) -> Result<bool> {
        let mut key: Vec<Value> = SCHEMA_COMPATIBLE_KEY.iter().map(|k| Value::from(*k)).collect();
        key.push(hash.into());
        Ok(!self.store.read_metadata_tuples(key)?.is_empty())
    }

    pub fn mark_schema_compatible(&mut self, hash: &str) -> Result<()> {
        let mut key: Vec<Value> = SCHEMA_COMPATIBLE_KEY.iter().map(|k| Value::from(*k)).collect();
        key.push(hash.into());
        self.store.update_metadata_tuples(vec![(key, Value::Bool(true))])
    }

    /// Start a live query. The listener is called with the initial results
    /// before this returns, then after each commit that changes them.
    pub fn subscribe(
        &mut self,
        query: CollectionQuery,
        mut listener: SubscriptionListener,
    ) -> Result<SubscriptionId> {
        let results: CollectionView = self.fetch(&query)?.into_iter().collect();
        let tree = HashedQuery::new(&query)?;
        let collections = tree
            .collections_by_node()
            .remove(&tree.hash)
            .unwrap_or_default();
        let id = self.next_subscription;
        self.next_subscription += 1;
        let mut initial = DBChanges::new();
        *initial.collection_mut(&query.collection_name) =
            diff_collection(&CollectionView::new(), &results);
        listener(SubscriptionUpdate {
            subscription_id: id,
            changes: initial,
            timestamp: None,
        });

        tracing::debug!(subscription_id = id, collection = %query.collection_name, "subscribed");
        self.subscriptions.insert(
            id,
            Subscription {
                query,
                collections,
                results,
                listener,
            },
        );
        Ok(id)
    }

    /// Stop a live query. No further updates are delivered for it.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Result<()> {
        self.subscriptions
            .remove(&id)
            .map(|_| tracing::debug!(subscription_id = id, "unsubscribed"))
            .ok_or(Error::SubscriptionNotFound(id))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn notify(&mut self, summary: &CommitSummary) {
        if self.subscriptions.is_empty() {
            return;
        }
        let changed: BTreeSet<&str> = summary
            .entity_ids()
            .into_iter()
            .filter_map(|eid| split_entity_id(eid).ok().map(|(collection, _)| collection))
            .collect();
        if changed.is_empty() {
            return;
        }

        let store = &self.store;
        for (id, subscription) in self.subscriptions.iter_mut() {
            if !subscription
                .collections
                .iter()
                .any(|c| changed.contains(c.as_str()))
            {
                continue;
            }
            let results: CollectionView =
                match QueryEvaluator::new(store).execute(&subscription.query) {
                    Ok(rows) => rows.into_iter().collect(),
                    Err(e) => {
                        tracing::warn!(subscription_id = id, error = %e, "subscription refresh failed");
                        continue;
                    }
                };
            let delta = diff_collection(&subscription.results, &results);
            subscription.results = results;
            if delta.is_empty() {
                continue;
            }
            let mut changes = DBChanges::new();
            *changes.collection_mut(&subscription.query.collection_name) = delta;
            (subscription.listener)(SubscriptionUpdate {
                subscription_id: *id,
                changes,
                timestamp: summary.timestamp.clone(),
            });
        }
    }

    /// Every fact and metadata entry, with the clock position.
    pub fn export_snapshot(&self) -> Result<StoreSnapshot> {
        let mut snapshot = StoreSnapshot::new(
            self.store.replica_id(),
            self.store.clock().current().sequence,
        );
        snapshot.add_triples(self.store.find_all_triples()?);
        snapshot.metadata = self.store.read_metadata_tuples(Vec::new())?;
        Ok(snapshot)
    }

    /// Load a snapshot into the store. Facts merge with existing ones.
    pub fn import_snapshot(&mut self, snapshot: StoreSnapshot) -> Result<()> {
        let replica = self.store.replica_id().to_string();
        let sequence = snapshot.sequence;
        let triple_count = snapshot.triples.len();
        let (_, summary) = self.store.transact(|tx| {
            tx.insert_triples(snapshot.triples)?;
            tx.update_metadata_tuples(snapshot.metadata)
        })?;
        self.store
            .clock_mut()
            .observe(&Timestamp::new(sequence, replica))?;
        tracing::info!(triples = triple_count, sequence, "snapshot imported");
        self.notify(&summary);
        Ok(())
    }
}

/// Split off or generate the document id and make sure it is stored in
/// the document.
fn prepare_document(collection: &str, document: Value) -> Result<(String, Value)> {
    let Value::Object(mut fields) = document else {
        return Err(Error::InvalidValue(format!(
            "{} document must be an object",
            collection
        )));
    };
    let id = match fields.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(other) => {
            return Err(Error::InvalidValue(format!(
                "document id must be a non-empty string, got {}",
                other.type_name()
            )))
        }
        None => uuid::Uuid::new_v4().to_string(),
    };
    fields.insert("id".into(), Value::String(id.clone()));
    Ok((id, Value::Object(fields)))
}

fn write_changes<S: TupleStorage, C: Clock>(
    tx: &mut TripleStoreTransaction<'_, S, C>,
    eid: &str,
    collection: &str,
    changes: &[(AttributePath, Change)],
) -> Result<()> {
    let root = AttributePath::of([collection]);
    let timestamp = tx.timestamp()?;
    for (path, change) in changes {
        let attribute = root.join(path.segments());
        match change {
            Change::Set(value) => {
                let eavs = value_to_triples(eid, &attribute, value, &timestamp)
                    .into_iter()
                    .map(|row| (row.entity_id, row.attribute, row.value))
                    .collect();
                tx.set_values(eavs)?;
            }
            Change::Delete => {
                tx.expire_entity_attributes(vec![(eid.to_string(), attribute)])?;
            }
        }
    }
    Ok(())
}

fn apply_set<S: TupleStorage, C: Clock>(
    tx: &mut TripleStoreTransaction<'_, S, C>,
    schema: Option<&Schema>,
    collection: &str,
    id: &str,
    value: &Value,
    timestamp: &Timestamp,
) -> Result<()> {
    let eid = entity_id(collection, id);
    let entity = Entity::from_triples(tx.find_by_entity(&eid)?)?;
    if !entity.exists() {
        let (_, document) = prepare_document(collection, with_id(value, id)?)?;
        if let Some(schema) = schema {
            schema.validate_document(collection, &document)?;
        }
        return tx.insert_triples(entity_to_triples(
            &collection.to_string(),
            id,
            &document,
            timestamp,
        ));
    }

    let mut tracker = ChangeTracker::new(entity.into_data());
    let mut leaves = Vec::new();
    flatten_leaves(AttributePath::default(), value, &mut leaves);
    for (path, leaf) in leaves {
        tracker.set(path, leaf)?;
    }
    if let Some(schema) = schema {
        schema.validate_document(collection, tracker.document())?;
    }
    write_changes(tx, &eid, collection, tracker.changes())
}

fn with_id(value: &Value, id: &str) -> Result<Value> {
    let mut fields: Object = value
        .as_object()
        .cloned()
        .ok_or_else(|| Error::InvalidValue(format!("change for {} must be an object", id)))?;
    fields.insert("id".into(), Value::from(id));
    Ok(Value::Object(fields))
}

/// Leaf writes of a partial document. Objects are merged key by key; an
/// empty object is written as such.
fn flatten_leaves(path: AttributePath, value: &Value, out: &mut Vec<(AttributePath, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, item) in map {
                flatten_leaves(path.child(key.as_str()), item, out);
            }
        }
        leaf if !path.is_empty() => out.push((path, leaf.clone())),
        _ => {}
    }
}
