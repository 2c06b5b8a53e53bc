//! Entity materialization.
//!
//! An [`Entity`] keeps the current winning fact per attribute of one entity
//! and derives its document from them. Slots are kept sorted by attribute
//! path, so the derived document depends only on the winning facts and not
//! on the order they were applied in.

use crate::triple::split_entity_id;
use crate::{AttributePath, CollectionName, EntityId, Error, Object, Result, Timestamp, TripleRow, Value};
use std::cell::OnceCell;
use std::collections::BTreeMap;

/// Materialized view of one entity.
#[derive(Debug, Clone, Default)]
pub struct Entity {
    id: Option<EntityId>,
    collection: Option<CollectionName>,
    /// Winning fact per attribute, sorted by attribute
    slots: Vec<TripleRow>,
    is_deleted: bool,
    data: OnceCell<Value>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an entity from facts, in any order.
    pub fn from_triples(rows: impl IntoIterator<Item = TripleRow>) -> Result<Self> {
        let mut entity = Self::new();
        for row in rows {
            entity.apply_triple(row)?;
        }
        Ok(entity)
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn collection_name(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// The id without its collection prefix.
    pub fn document_id(&self) -> Option<&str> {
        let id = self.id.as_deref()?;
        split_entity_id(id).ok().map(|(_, doc)| doc)
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    /// Whether the entity has a live collection membership fact.
    pub fn exists(&self) -> bool {
        !self.is_deleted && self.slot(&AttributePath::collection_marker()).is_some()
    }

    pub fn triples(&self) -> &[TripleRow] {
        &self.slots
    }

    /// Newest timestamp among the winning facts.
    pub fn last_updated(&self) -> Option<&Timestamp> {
        self.slots.iter().map(|row| &row.timestamp).max()
    }

    fn slot(&self, attribute: &AttributePath) -> Option<&TripleRow> {
        self.slots
            .binary_search_by(|row| row.attribute.cmp(attribute))
            .ok()
            .map(|i| &self.slots[i])
    }

    /// Apply one fact. Returns whether it replaced the current slot.
    ///
    /// A fact older than the current one for its attribute is discarded.
    /// A fact with an equal timestamp is applied, so on exact ties the last
    /// applied fact wins.
    pub fn apply_triple(&mut self, row: TripleRow) -> Result<bool> {
        match &self.id {
            None => {
                let (collection, _) = split_entity_id(&row.entity_id)?;
                self.collection = Some(collection.to_string());
                self.id = Some(row.entity_id.clone());
            }
            Some(id) if *id != row.entity_id => {
                return Err(Error::InvalidTripleApplication {
                    entity: id.clone(),
                    triple_entity: row.entity_id,
                });
            }
            Some(_) => {}
        }

        match self
            .slots
            .binary_search_by(|slot| slot.attribute.cmp(&row.attribute))
        {
            Ok(i) => {
                if self.slots[i].timestamp > row.timestamp {
                    return Ok(false);
                }
                if row.attribute.is_collection_marker() {
                    self.is_deleted = row.expired;
                }
                self.slots[i] = row;
            }
            Err(i) => {
                if row.attribute.is_collection_marker() {
                    self.is_deleted = row.expired;
                }
                self.slots.insert(i, row);
            }
        }
        self.data = OnceCell::new();
        Ok(true)
    }

    /// The materialized document, without the collection prefix. Deleted
    /// entities materialize to an empty object.
    pub fn data(&self) -> &Value {
        self.data.get_or_init(|| self.materialize())
    }

    pub fn into_data(mut self) -> Value {
        match self.data.take() {
            Some(value) => value,
            None => self.materialize(),
        }
    }

    fn materialize(&self) -> Value {
        let mut data = Value::Object(Object::new());
        if self.is_deleted {
            return data;
        }
        // Open object markers enclosing the current slot, outermost first.
        let mut open: Vec<&TripleRow> = Vec::new();
        for row in &self.slots {
            if row.attribute.is_collection_marker() {
                continue;
            }
            while let Some(top) = open.last() {
                if top.attribute.is_prefix_of(&row.attribute) {
                    break;
                }
                open.pop();
            }
            let gated = match open.last() {
                Some(parent) => {
                    row.attribute.is_direct_child_of(&parent.attribute)
                        && parent.timestamp <= row.timestamp
                }
                None => row.attribute.len() == 1,
            };
            if !gated {
                continue;
            }
            let path = &row.attribute.segments()[1..];
            if row.expired {
                if !path.is_empty() {
                    data.remove_path(path);
                }
            } else if row.is_object_marker() {
                if !path.is_empty() {
                    data.set_path(path, Value::Object(Object::new()));
                }
                open.push(row);
            } else if !path.is_empty() {
                data.set_path(path, row.value.clone());
            }
        }
        data
    }
}

/// Group facts into entities keyed by entity id.
pub fn entities_from_triples(
    rows: impl IntoIterator<Item = TripleRow>,
) -> Result<BTreeMap<EntityId, Entity>> {
    let mut entities: BTreeMap<EntityId, Entity> = BTreeMap::new();
    for row in rows {
        entities
            .entry(row.entity_id.clone())
            .or_default()
            .apply_triple(row)?;
    }
    Ok(entities)
}
