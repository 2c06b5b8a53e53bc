//! The dynamically-typed value stored in every fact.
//!
//! Values carry a fixed total order across types, used by the index
//! encoding: `Null < Object < Array < Number < String < Bool < Date`.
//!
//! Dates serialize as `{"$date": "<RFC 3339>"}` so they survive the wire
//! without collapsing into strings.

use crate::path::PathSegment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Object representation. Keys are kept sorted so that comparison and
/// serialization are deterministic.
pub type Object = BTreeMap<String, Value>;

/// A JSON-like value with an explicit type tag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(#[serde(with = "date_wire")] DateTime<Utc>),
    Array(Vec<Value>),
    Object(Object),
}

mod date_wire {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) const TAG: &str = "$date";

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Tagged {
        #[serde(rename = "$date")]
        date: String,
    }

    pub(super) fn format(date: &DateTime<Utc>) -> String {
        date.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|date| date.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(TAG, &format(date))?;
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let tagged = Tagged::deserialize(deserializer)?;
        parse(&tagged.date).ok_or_else(|| D::Error::custom(format!("invalid date {:?}", tagged.date)))
    }
}

impl Value {
    /// Rank of the value's type in the cross-type order.
    pub fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Object(_) => 1,
            Value::Array(_) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Bool(_) => 5,
            Value::Date(_) => 6,
        }
    }

    /// Human-readable type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Array(_) => "Array",
            Value::Object(_) => "Object",
            Value::Date(_) => "Date",
        }
    }

    /// An empty object.
    pub fn object() -> Self {
        Value::Object(Object::new())
    }

    /// Total order over values. Agrees with the lexicographic order of
    /// [`crate::codec::encode_value`].
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => {
                a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b))
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => compare_sequences(a.iter(), b.iter()),
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    match ka.cmp(kb).then_with(|| va.compare(vb)) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Whether every number inside this value is finite.
    pub fn is_storable(&self) -> bool {
        match self {
            Value::Number(n) => n.is_finite(),
            Value::Array(items) => items.iter().all(Value::is_storable),
            Value::Object(map) => map.values().all(Value::is_storable),
            _ => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Date(date) => Some(date),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a direct child by key or index.
    pub fn get(&self, segment: &PathSegment) -> Option<&Value> {
        match (self, segment) {
            (Value::Object(map), seg) => map.get(seg.as_key().as_ref()),
            (Value::Array(items), PathSegment::Index(i)) => items.get(*i as usize),
            _ => None,
        }
    }

    /// Look up a nested value.
    pub fn get_path(&self, path: &[PathSegment]) -> Option<&Value> {
        path.iter().try_fold(self, |current, seg| current.get(seg))
    }

    /// Set a nested value, creating intermediate objects as needed. A
    /// non-object intermediate is replaced by an object.
    pub fn set_path(&mut self, path: &[PathSegment], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            *self = value;
            return;
        };
        let mut current = self;
        for seg in parents {
            current = current.child_object_entry(seg);
        }
        match (current, last) {
            (Value::Array(items), PathSegment::Index(i)) if (*i as usize) < items.len() => {
                items[*i as usize] = value;
            }
            (current, last) => {
                if !matches!(current, Value::Object(_)) {
                    *current = Value::object();
                }
                if let Value::Object(map) = current {
                    map.insert(last.as_key().into_owned(), value);
                }
            }
        }
    }

    /// Remove a nested value. Returns the removed value if it was present.
    pub fn remove_path(&mut self, path: &[PathSegment]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let mut current = self;
        for seg in parents {
            current = match current {
                Value::Object(map) => map.get_mut(seg.as_key().as_ref())?,
                Value::Array(items) => match seg {
                    PathSegment::Index(i) => items.get_mut(*i as usize)?,
                    PathSegment::Key(_) => return None,
                },
                _ => return None,
            };
        }
        match current {
            Value::Object(map) => map.remove(last.as_key().as_ref()),
            _ => None,
        }
    }

    fn child_object_entry(&mut self, seg: &PathSegment) -> &mut Value {
        let index = match (&*self, seg) {
            (Value::Array(items), PathSegment::Index(i)) if (*i as usize) < items.len() => {
                Some(*i as usize)
            }
            _ => None,
        };
        if index.is_none() && !matches!(self, Value::Object(_)) {
            *self = Value::object();
        }
        match (self, index) {
            (Value::Array(items), Some(i)) => &mut items[i],
            (Value::Object(map), _) => map
                .entry(seg.as_key().into_owned())
                .or_insert_with(Value::object),
            (this, _) => this,
        }
    }
}

fn compare_sequences<'a>(
    mut a: impl Iterator<Item = &'a Value>,
    mut b: impl Iterator<Item = &'a Value>,
) -> Ordering {
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.compare(y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => match tagged_date(&map) {
                Some(date) => Value::Date(date),
                None => Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
            },
        }
    }
}

/// A single-key `{"$date": "<RFC 3339>"}` object.
fn tagged_date(map: &serde_json::Map<String, serde_json::Value>) -> Option<DateTime<Utc>> {
    if map.len() != 1 {
        return None;
    }
    date_wire::parse(map.get(date_wire::TAG)?.as_str()?)
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(date) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    date_wire::TAG.to_string(),
                    serde_json::Value::String(date_wire::format(date)),
                );
                serde_json::Value::Object(map)
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        serde_json::Value::from(&value)
    }
}

/// Integral numbers become JSON integers so they print without a fraction.
fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Value::Date(date)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Object> for Value {
    fn from(map: Object) -> Self {
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    #[test]
    fn cross_type_order() {
        let ordered = [
            Value::Null,
            v(json!({"a": 1})),
            v(json!([1])),
            Value::Number(-4.0),
            Value::from("a"),
            Value::Bool(false),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(pair[0].compare(&pair[1]), Ordering::Less, "{:?}", pair);
        }
    }

    #[test]
    fn object_comparison_is_pairwise() {
        assert!(v(json!({"a": 1})) < v(json!({"a": 2})));
        assert!(v(json!({"a": 1})) < v(json!({"a": 1, "b": 0})));
        assert!(v(json!({"a": 9})) < v(json!({"b": 0})));
    }

    #[test]
    fn array_prefix_sorts_first() {
        assert!(v(json!([1, 2])) < v(json!([1, 2, 3])));
        assert!(v(json!([1, 3])) > v(json!([1, 2, 3])));
    }

    #[test]
    fn json_roundtrip() {
        let original = json!({"name": "Alice", "tags": ["a", "b"], "age": 30, "ok": true});
        let value = Value::from(original.clone());
        assert_eq!(serde_json::Value::from(&value), original);
    }

    #[test]
    fn serde_untagged() {
        let value: Value = serde_json::from_str(r#"{"a":[1,null,"x"],"b":false}"#).unwrap();
        assert_eq!(value, v(json!({"a": [1, null, "x"], "b": false})));
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");
    }

    #[test]
    fn nested_paths() {
        let mut doc = Value::object();
        let path = [PathSegment::from("address"), PathSegment::from("city")];
        doc.set_path(&path, Value::from("Paris"));
        assert_eq!(doc, v(json!({"address": {"city": "Paris"}})));
        assert_eq!(doc.get_path(&path), Some(&Value::from("Paris")));

        assert_eq!(doc.remove_path(&path), Some(Value::from("Paris")));
        assert_eq!(doc, v(json!({"address": {}})));
        assert_eq!(doc.remove_path(&path), None);
    }

    #[test]
    fn dates_keep_their_type_through_serde() {
        let date = DateTime::parse_from_rfc3339("2024-03-01T12:30:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let doc = v(json!({"due": {"$date": "2024-03-01T12:30:00.250Z"}, "label": "2024-03-01"}));
        assert_eq!(doc.get(&PathSegment::from("due")), Some(&Value::Date(date)));
        assert_eq!(doc.get(&PathSegment::from("label")), Some(&Value::from("2024-03-01")));

        let text = serde_json::to_string(&doc).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, doc);
        assert_eq!(Value::from(serde_json::Value::from(&doc)), doc);

        // Extra keys or a bad timestamp leave an ordinary object.
        let plain = v(json!({"$date": "yesterday"}));
        assert_eq!(plain.type_name(), "Object");
        let parsed: Value = serde_json::from_str(r#"{"$date":"2024-03-01T00:00:00Z","x":1}"#).unwrap();
        assert_eq!(parsed.type_name(), "Object");
    }

    #[test]
    fn dates_sort_after_other_types_and_by_instant() {
        let early = Value::from(DateTime::<Utc>::from_timestamp(1_000, 0).unwrap());
        let late = Value::from(DateTime::<Utc>::from_timestamp(1_000, 1).unwrap());
        assert!(early < late);
        assert!(Value::Bool(true) < early);
    }

    #[test]
    fn set_path_through_array_element() {
        let mut doc = v(json!({"items": [{"n": 1}, {"n": 2}]}));
        doc.set_path(
            &[PathSegment::from("items"), PathSegment::Index(1), PathSegment::from("n")],
            Value::from(5i64),
        );
        assert_eq!(doc, v(json!({"items": [{"n": 1}, {"n": 5}]})));

        doc.set_path(&[PathSegment::from("items"), PathSegment::Index(7), PathSegment::from("n")], Value::Null);
        assert_eq!(doc.get_path(&[PathSegment::from("items")]).map(Value::type_name), Some("Object"));
    }

    #[test]
    fn storable_rejects_non_finite() {
        assert!(v(json!({"a": [1.5]})).is_storable());
        let mut map = Object::new();
        map.insert("n".into(), Value::Number(f64::NAN));
        assert!(!Value::Object(map).is_storable());
    }
}
