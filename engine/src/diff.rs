//! Change sets between materialized views.
//!
//! [`DBChanges`] is the unit exchanged between replicas and handed to
//! subscribers. On the wire the per-collection maps and sets keep their
//! container type as `{"$map": [[id, value], ...]}` and `{"$set": [id, ...]}`,
//! and dates inside documents travel as `{"$date": "<RFC 3339>"}`.

use crate::{CollectionName, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Materialized documents of one collection by id.
pub type CollectionView = BTreeMap<String, Value>;

/// Materialized documents of several collections.
pub type DatabaseView = BTreeMap<CollectionName, CollectionView>;

/// Changes to one collection. An id is never both set and deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireCollectionChanges", into = "WireCollectionChanges")]
pub struct CollectionChanges {
    pub sets: BTreeMap<String, Value>,
    pub deletes: BTreeSet<String>,
}

impl CollectionChanges {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.deletes.is_empty()
    }

    pub fn set(&mut self, id: impl Into<String>, value: Value) {
        let id = id.into();
        self.deletes.remove(&id);
        self.sets.insert(id, value);
    }

    pub fn delete(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.sets.remove(&id);
        self.deletes.insert(id);
    }
}

#[derive(Serialize, Deserialize)]
struct WireMap {
    #[serde(rename = "$map")]
    entries: Vec<(String, Value)>,
}

#[derive(Serialize, Deserialize)]
struct WireSet {
    #[serde(rename = "$set")]
    items: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct WireCollectionChanges {
    sets: WireMap,
    deletes: WireSet,
}

impl From<WireCollectionChanges> for CollectionChanges {
    fn from(wire: WireCollectionChanges) -> Self {
        let mut changes = Self::default();
        for (id, value) in wire.sets.entries {
            changes.set(id, value);
        }
        for id in wire.deletes.items {
            changes.delete(id);
        }
        changes
    }
}

impl From<CollectionChanges> for WireCollectionChanges {
    fn from(changes: CollectionChanges) -> Self {
        Self {
            sets: WireMap {
                entries: changes.sets.into_iter().collect(),
            },
            deletes: WireSet {
                items: changes.deletes.into_iter().collect(),
            },
        }
    }
}

/// Changes across collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DBChanges(BTreeMap<CollectionName, CollectionChanges>);

impl DBChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no collection carries a change.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(CollectionChanges::is_empty)
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionChanges> {
        self.0.get(name)
    }

    pub fn collection_mut(&mut self, name: &str) -> &mut CollectionChanges {
        self.0.entry(name.to_string()).or_default()
    }

    /// Names of collections with at least one change.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, changes)| !changes.is_empty())
            .map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CollectionChanges)> {
        self.0.iter().map(|(name, changes)| (name.as_str(), changes))
    }

    pub fn set(&mut self, collection: &str, id: impl Into<String>, value: Value) {
        self.collection_mut(collection).set(id, value);
    }

    pub fn delete(&mut self, collection: &str, id: impl Into<String>) {
        self.collection_mut(collection).delete(id);
    }

    /// Number of set and deleted ids across collections.
    pub fn len(&self) -> usize {
        self.0
            .values()
            .map(|c| c.sets.len() + c.deletes.len())
            .sum()
    }
}

impl IntoIterator for DBChanges {
    type Item = (CollectionName, CollectionChanges);
    type IntoIter = std::collections::btree_map::IntoIter<CollectionName, CollectionChanges>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Minimal changes turning `old` into `new`.
pub fn diff_changes(old: &DatabaseView, new: &DatabaseView) -> DBChanges {
    let mut changes = DBChanges::new();
    let names: BTreeSet<&CollectionName> = old.keys().chain(new.keys()).collect();
    let empty = CollectionView::new();
    for name in names {
        let before = old.get(name).unwrap_or(&empty);
        let after = new.get(name).unwrap_or(&empty);
        let diff = diff_collection(before, after);
        if !diff.is_empty() {
            changes.0.insert(name.clone(), diff);
        }
    }
    changes
}

/// [`diff_changes`] for a single collection.
pub fn diff_collection(old: &CollectionView, new: &CollectionView) -> CollectionChanges {
    let mut changes = CollectionChanges::default();
    for id in old.keys() {
        if !new.contains_key(id) {
            changes.deletes.insert(id.clone());
        }
    }
    for (id, value) in new {
        if old.get(id) != Some(value) {
            changes.sets.insert(id.clone(), value.clone());
        }
    }
    changes
}

/// Fold `other` into `into`; changes in `other` win.
pub fn merge_db_changes(into: &mut DBChanges, other: DBChanges) {
    for (name, changes) in other {
        let target = into.collection_mut(&name);
        for (id, value) in changes.sets {
            target.set(id, value);
        }
        for id in changes.deletes {
            target.delete(id);
        }
    }
}

/// Apply changes to a view, replacing set documents wholesale.
pub fn apply_db_changes(view: &mut DatabaseView, changes: &DBChanges) {
    for (name, collection) in changes.iter() {
        let target = view.entry(name.to_string()).or_default();
        for id in &collection.deletes {
            target.remove(id);
        }
        for (id, value) in &collection.sets {
            target.insert(id.clone(), value.clone());
        }
    }
}
