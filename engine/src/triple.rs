//! Triples: the atomic timestamped facts everything else is derived from.

use crate::{AttributePath, CollectionName, EntityId, Error, Result, Timestamp, Value};
use serde::{Deserialize, Serialize};

/// Sentinel value of an object marker fact.
pub const OBJECT_MARKER: &str = "{}";

/// Separator between collection name and id inside an entity id.
pub const ENTITY_ID_SEPARATOR: char = '#';

/// One timestamped fact about an entity attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawTripleRow")]
pub struct TripleRow {
    /// `"<collection>#<id>"`
    pub entity_id: EntityId,
    /// Path from the collection root
    pub attribute: AttributePath,
    pub value: Value,
    pub timestamp: Timestamp,
    /// Tombstone flag
    pub expired: bool,
}

impl TripleRow {
    pub fn new(
        entity_id: impl Into<EntityId>,
        attribute: AttributePath,
        value: Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute,
            value,
            timestamp,
            expired: false,
        }
    }

    /// A tombstone for `attribute`.
    pub fn tombstone(
        entity_id: impl Into<EntityId>,
        attribute: AttributePath,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute,
            value: Value::Null,
            timestamp,
            expired: true,
        }
    }

    pub fn is_object_marker(&self) -> bool {
        !self.expired && matches!(&self.value, Value::String(s) if s == OBJECT_MARKER)
    }

    /// Reject values the store cannot index.
    pub fn validate(&self) -> Result<()> {
        split_entity_id(&self.entity_id)?;
        if !self.value.is_storable() {
            return Err(Error::InvalidValue(format!(
                "non-finite number in {} {}",
                self.entity_id, self.attribute
            )));
        }
        Ok(())
    }
}

/// Wire form of a triple; a missing value is the "undefined" sentinel.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTripleRow {
    entity_id: EntityId,
    attribute: AttributePath,
    #[serde(default, deserialize_with = "present")]
    value: Option<serde_json::Value>,
    timestamp: Timestamp,
    #[serde(default)]
    expired: bool,
}

/// Distinguishes an explicit `null` from an absent field.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawTripleRow> for TripleRow {
    type Error = Error;

    fn try_from(raw: RawTripleRow) -> Result<Self> {
        let value = raw.value.ok_or_else(|| {
            Error::InvalidValue(format!(
                "undefined value for {} {}",
                raw.entity_id, raw.attribute
            ))
        })?;
        Ok(Self {
            entity_id: raw.entity_id,
            attribute: raw.attribute,
            value: Value::from(value),
            timestamp: raw.timestamp,
            expired: raw.expired,
        })
    }
}

/// Compose an entity id.
pub fn entity_id(collection: &str, id: &str) -> EntityId {
    format!("{}{}{}", collection, ENTITY_ID_SEPARATOR, id)
}

/// Split an entity id into `(collection, id)`.
pub fn split_entity_id(entity_id: &str) -> Result<(&str, &str)> {
    match entity_id.split_once(ENTITY_ID_SEPARATOR) {
        Some((collection, id)) if !collection.is_empty() && !id.is_empty() => Ok((collection, id)),
        _ => Err(Error::InvalidEntityId(entity_id.to_string())),
    }
}

/// Facts for writing `value` at `path`. Objects become a marker plus facts
/// for each key; every other value is a single leaf.
pub fn value_to_triples(
    entity_id: &str,
    path: &AttributePath,
    value: &Value,
    timestamp: &Timestamp,
) -> Vec<TripleRow> {
    let mut rows = Vec::new();
    push_value_triples(entity_id, path, value, timestamp, &mut rows);
    rows
}

fn push_value_triples(
    entity_id: &str,
    path: &AttributePath,
    value: &Value,
    timestamp: &Timestamp,
    rows: &mut Vec<TripleRow>,
) {
    match value {
        Value::Object(map) => {
            rows.push(TripleRow::new(
                entity_id,
                path.clone(),
                Value::from(OBJECT_MARKER),
                timestamp.clone(),
            ));
            for (key, item) in map {
                push_value_triples(entity_id, &path.child(key.as_str()), item, timestamp, rows);
            }
        }
        leaf => rows.push(TripleRow::new(
            entity_id,
            path.clone(),
            leaf.clone(),
            timestamp.clone(),
        )),
    }
}

/// Facts for inserting a whole entity: collection membership, a root
/// object marker and every field.
pub fn entity_to_triples(
    collection: &CollectionName,
    id: &str,
    document: &Value,
    timestamp: &Timestamp,
) -> Vec<TripleRow> {
    let eid = entity_id(collection, id);
    let mut rows = vec![TripleRow::new(
        eid.clone(),
        AttributePath::collection_marker(),
        Value::String(collection.clone()),
        timestamp.clone(),
    )];
    let root = AttributePath::of([collection.as_str()]);
    match document {
        Value::Object(_) => push_value_triples(&eid, &root, document, timestamp, &mut rows),
        _ => rows.push(TripleRow::new(
            eid.clone(),
            root,
            Value::from(OBJECT_MARKER),
            timestamp.clone(),
        )),
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(seq: u64) -> Timestamp {
        Timestamp::new(seq, "A")
    }

    #[test]
    fn entity_id_roundtrip() {
        let eid = entity_id("todos", "1");
        assert_eq!(eid, "todos#1");
        assert_eq!(split_entity_id(&eid).unwrap(), ("todos", "1"));
        assert!(split_entity_id("todos").is_err());
        assert!(split_entity_id("#1").is_err());
    }

    #[test]
    fn objects_expand_to_marker_and_leaves() {
        let rows = value_to_triples(
            "users#1",
            &AttributePath::of(["users", "address"]),
            &Value::from(json!({"city": "Paris", "geo": {"lat": 1}})),
            &ts(3),
        );
        let attrs: Vec<String> = rows.iter().map(|r| r.attribute.to_string()).collect();
        assert_eq!(
            attrs,
            vec![
                "users/address",
                "users/address/city",
                "users/address/geo",
                "users/address/geo/lat"
            ]
        );
        assert!(rows[0].is_object_marker());
        assert!(rows[2].is_object_marker());
        assert!(!rows[1].is_object_marker());
    }

    #[test]
    fn arrays_are_single_leaves() {
        let rows = value_to_triples(
            "users#1",
            &AttributePath::of(["users", "tags"]),
            &Value::from(json!(["a", "b"])),
            &ts(1),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Value::from(json!(["a", "b"])));
    }

    #[test]
    fn entity_triples_include_collection_marker() {
        let rows = entity_to_triples(
            &"users".to_string(),
            "1",
            &Value::from(json!({"name": "bob"})),
            &ts(1),
        );
        assert!(rows[0].attribute.is_collection_marker());
        assert_eq!(rows[0].value, Value::from("users"));
        assert_eq!(rows[1].attribute, AttributePath::of(["users"]));
        assert!(rows[1].is_object_marker());
        assert_eq!(rows[2].attribute, AttributePath::of(["users", "name"]));
    }

    #[test]
    fn missing_value_is_rejected_on_deserialize() {
        let json = r#"{"entityId":"users#1","attribute":["users","name"],
                       "timestamp":{"sequence":1,"replicaId":"A"}}"#;
        let err = serde_json::from_str::<TripleRow>(json).unwrap_err();
        assert!(err.to_string().contains("invalid value"));

        let json = r#"{"entityId":"users#1","attribute":["users","name"],"value":null,
                       "timestamp":{"sequence":1,"replicaId":"A"},"expired":true}"#;
        let row: TripleRow = serde_json::from_str(json).unwrap();
        assert!(row.expired);
    }

    #[test]
    fn validate_rejects_non_finite() {
        let row = TripleRow::new(
            "users#1",
            AttributePath::of(["users", "n"]),
            Value::Number(f64::INFINITY),
            ts(1),
        );
        assert!(matches!(row.validate(), Err(Error::InvalidValue(_))));
    }
}
