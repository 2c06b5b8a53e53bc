//! Attribute paths.
//!
//! An attribute is a path from the collection root, e.g.
//! `["todos", "address", "city"]`. Paths order segment-wise, so every
//! descendant of a path sorts directly after it and before its next sibling.

use crate::{Error, Result, Value};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Attribute marking collection membership (and, when expired, deletion).
pub const COLLECTION_ATTRIBUTE: &str = "_collection";

/// One step of an attribute path.
///
/// Variant order matters: indices sort before keys, mirroring the value
/// order `Number < String`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(u64),
    Key(String),
}

impl PathSegment {
    /// The segment as an object key.
    pub fn as_key(&self) -> Cow<'_, str> {
        match self {
            PathSegment::Key(k) => Cow::Borrowed(k),
            PathSegment::Index(i) => Cow::Owned(i.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PathSegment::Key(k) => Value::String(k.clone()),
            PathSegment::Index(i) => Value::Number(*i as f64),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(PathSegment::Key(s.clone())),
            Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 => Ok(PathSegment::Index(*n as u64)),
            other => Err(Error::Encoding(format!(
                "attribute segment must be a string or index, got {}",
                other.type_name()
            ))),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        PathSegment::Key(s.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        PathSegment::Key(s)
    }
}

impl From<u64> for PathSegment {
    fn from(i: u64) -> Self {
        PathSegment::Index(i)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// An immutable attribute path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributePath(Vec<PathSegment>);

impl AttributePath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    /// Build a path of string keys.
    pub fn of<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PathSegment>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    /// The `["_collection"]` membership attribute.
    pub fn collection_marker() -> Self {
        Self::of([COLLECTION_ATTRIBUTE])
    }

    pub fn is_collection_marker(&self) -> bool {
        matches!(self.0.as_slice(), [PathSegment::Key(k)] if k == COLLECTION_ATTRIBUTE)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&PathSegment> {
        self.0.first()
    }

    /// A new path with `segment` appended.
    pub fn child(&self, segment: impl Into<PathSegment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// A new path extended by all of `tail`.
    pub fn join(&self, tail: &[PathSegment]) -> Self {
        let mut segments = self.0.clone();
        segments.extend_from_slice(tail);
        Self(segments)
    }

    pub fn parent(&self) -> Option<Self> {
        self.0
            .split_last()
            .map(|(_, parent)| Self(parent.to_vec()))
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &AttributePath) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Whether `self` is exactly one segment below `parent`.
    pub fn is_direct_child_of(&self, parent: &AttributePath) -> bool {
        self.0.len() == parent.0.len() + 1 && parent.is_prefix_of(self)
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.0.iter().map(PathSegment::to_value).collect())
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let items = value.as_array().ok_or_else(|| {
            Error::Encoding(format!(
                "attribute must be an array, got {}",
                value.type_name()
            ))
        })?;
        items
            .iter()
            .map(PathSegment::from_value)
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

impl From<Vec<PathSegment>> for AttributePath {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }
}
