//! Explicit mutation tracking for entity updates.
//!
//! An update callback edits a plain document through a [`ChangeTracker`],
//! which records every edit as an attribute-level change. Arrays are stored
//! as single facts, so an edit inside an array is recorded as a write of the
//! whole array; likewise, writing below a missing or non-object value is
//! recorded as a write of the object created at the first such level.

use crate::path::PathSegment;
use crate::triple::value_to_triples;
use crate::{AttributePath, Error, Result, Timestamp, TripleRow, Value};

/// One recorded edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Set(Value),
    Delete,
}

/// Records edits made to a document.
#[derive(Debug, Clone)]
pub struct ChangeTracker {
    document: Value,
    changes: Vec<(AttributePath, Change)>,
}

impl ChangeTracker {
    pub fn new(document: Value) -> Self {
        Self {
            document,
            changes: Vec::new(),
        }
    }

    /// Current value at `path`, including edits made so far.
    pub fn get(&self, path: &AttributePath) -> Option<&Value> {
        self.document.get_path(path.segments())
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn set(&mut self, path: impl Into<AttributePath>, value: impl Into<Value>) -> Result<()> {
        let path = path.into();
        let value = value.into();
        if path.is_empty() {
            return Err(Error::InvalidValue("cannot replace the document root".into()));
        }
        if !value.is_storable() {
            return Err(Error::InvalidValue(format!("non-finite number at {}", path)));
        }
        let recorded = self.recording_point(&path);
        self.document.set_path(path.segments(), value);
        let written = self
            .document
            .get_path(&path.segments()[..recorded])
            .cloned()
            .unwrap_or_default();
        self.record(
            AttributePath::new(path.segments()[..recorded].to_vec()),
            Change::Set(written),
        );
        Ok(())
    }

    /// Remove the value at `path`. Deleting something that does not exist
    /// records nothing.
    pub fn delete(&mut self, path: impl Into<AttributePath>) -> Result<()> {
        let path = path.into();
        if path.is_empty() {
            return Err(Error::InvalidValue("cannot delete the document root".into()));
        }
        let recorded = self.recording_point(&path);
        if recorded == path.len() {
            if self.document.remove_path(path.segments()).is_some() {
                self.record(path, Change::Delete);
            }
            return Ok(());
        }
        let (head, rest) = path.segments().split_at(recorded);
        let Some(Value::Array(items)) = self.document.get_path(head) else {
            return Ok(());
        };
        let mut items = items.clone();
        let removed = match rest {
            [PathSegment::Index(i)] if (*i as usize) < items.len() => {
                items.remove(*i as usize);
                true
            }
            [PathSegment::Index(i), tail @ ..] => items
                .get_mut(*i as usize)
                .and_then(|item| item.remove_path(tail))
                .is_some(),
            _ => false,
        };
        if removed {
            let array = Value::Array(items);
            self.document.set_path(head, array.clone());
            self.record(AttributePath::new(head.to_vec()), Change::Set(array));
        }
        Ok(())
    }

    /// Length of the prefix of `path` at which an edit must be recorded:
    /// the first level that is not an existing object, or the whole path.
    fn recording_point(&self, path: &AttributePath) -> usize {
        let segments = path.segments();
        for depth in 1..segments.len() {
            match self.document.get_path(&segments[..depth]) {
                Some(Value::Object(_)) => continue,
                _ => return depth,
            }
        }
        segments.len()
    }

    fn record(&mut self, path: AttributePath, change: Change) {
        // A later edit of the same or an enclosing path supersedes earlier
        // ones beneath it.
        self.changes.retain(|(existing, _)| !path.is_prefix_of(existing));
        self.changes.push((path, change));
    }

    pub fn changes(&self) -> &[(AttributePath, Change)] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_parts(self) -> (Value, Vec<(AttributePath, Change)>) {
        (self.document, self.changes)
    }

    /// Facts for the recorded changes of entity `entity_id` in `collection`.
    pub fn to_triples(
        &self,
        entity_id: &str,
        collection: &str,
        timestamp: &Timestamp,
    ) -> Vec<TripleRow> {
        let root = AttributePath::of([collection]);
        self.changes
            .iter()
            .flat_map(|(path, change)| {
                let attribute = root.join(path.segments());
                match change {
                    Change::Set(value) => value_to_triples(entity_id, &attribute, value, timestamp),
                    Change::Delete => vec![TripleRow::tombstone(
                        entity_id,
                        attribute,
                        timestamp.clone(),
                    )],
                }
            })
            .collect()
    }
}
