//! Key-value storage contract over encoded tuple keys.
//!
//! The triple store only needs ordered range scans and atomic batches of
//! edits. [`MemoryStorage`] keeps everything in a `BTreeMap`; on-disk
//! backends implement the same trait.

use crate::codec::{Codec, MAX_CHAR};
use crate::{Result, Tuple, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// A range of encoded keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<String>,
    pub upper: Bound<String>,
}

impl KeyRange {
    /// Every key.
    pub fn full() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let above = match &self.lower {
            Bound::Included(lo) => key >= lo.as_str(),
            Bound::Excluded(lo) => key > lo.as_str(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(hi) => key <= hi.as_str(),
            Bound::Excluded(hi) => key < hi.as_str(),
            Bound::Unbounded => true,
        };
        above && below
    }

    /// Whether no key can fall inside the range. `BTreeMap::range` panics on
    /// inverted bounds, so callers check this first.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }

    fn as_ref_bounds(&self) -> (Bound<&str>, Bound<&str>) {
        (bound_ref(&self.lower), bound_ref(&self.upper))
    }
}

fn bound_ref(bound: &Bound<String>) -> Bound<&str> {
    match bound {
        Bound::Included(s) => Bound::Included(s.as_str()),
        Bound::Excluded(s) => Bound::Excluded(s.as_str()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Tuple-level description of a scan.
///
/// `gt`/`gte`/`lt`/`lte` are tuples relative to `prefix`. `gt X` skips every
/// tuple that extends `X`; `lte X` includes them. A scan capped by `limit`
/// resumes by passing the last returned suffix as `after`, which excludes
/// exactly that tuple but keeps its extensions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanArgs {
    pub prefix: Tuple,
    pub gt: Option<Tuple>,
    pub gte: Option<Tuple>,
    pub after: Option<Tuple>,
    pub lt: Option<Tuple>,
    pub lte: Option<Tuple>,
    pub limit: Option<usize>,
    pub direction: Direction,
}

impl ScanArgs {
    pub fn prefix(prefix: Tuple) -> Self {
        Self {
            prefix,
            ..Self::default()
        }
    }

    pub fn gt(mut self, bound: Tuple) -> Self {
        self.gt = Some(bound);
        self
    }

    pub fn gte(mut self, bound: Tuple) -> Self {
        self.gte = Some(bound);
        self
    }

    /// Resume strictly after the tuple `cursor`.
    pub fn after(mut self, cursor: Tuple) -> Self {
        self.after = Some(cursor);
        self
    }

    pub fn lt(mut self, bound: Tuple) -> Self {
        self.lt = Some(bound);
        self
    }

    pub fn lte(mut self, bound: Tuple) -> Self {
        self.lte = Some(bound);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Encoded key range for this scan.
    pub fn key_range(&self, codec: &Codec) -> Result<KeyRange> {
        let prefix = codec.encode_tuple(&self.prefix)?;
        let extend = |tuple: &Tuple| -> Result<String> {
            Ok(format!("{}{}", prefix, codec.encode_tuple(tuple)?))
        };

        let lower = if let Some(after) = &self.after {
            Bound::Excluded(extend(after)?)
        } else if let Some(gt) = &self.gt {
            Bound::Excluded(format!("{}{}", extend(gt)?, MAX_CHAR))
        } else if let Some(gte) = &self.gte {
            Bound::Included(extend(gte)?)
        } else {
            Bound::Included(prefix.clone())
        };

        let upper = if let Some(lt) = &self.lt {
            Bound::Excluded(extend(lt)?)
        } else if let Some(lte) = &self.lte {
            Bound::Included(format!("{}{}", extend(lte)?, MAX_CHAR))
        } else {
            Bound::Excluded(format!("{}{}", prefix, MAX_CHAR))
        };

        Ok(KeyRange { lower, upper })
    }
}

/// A set of edits applied atomically. `None` deletes the key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    edits: BTreeMap<String, Option<Value>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: String, value: Value) {
        self.edits.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: String) {
        self.edits.insert(key, None);
    }

    /// `Some(None)` when the batch deletes `key`.
    pub fn get(&self, key: &str) -> Option<Option<&Value>> {
        self.edits.get(key).map(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Value>)> {
        self.edits.iter()
    }

    /// Edits whose keys fall inside `range`, in key order.
    pub fn range<'a>(
        &'a self,
        range: &KeyRange,
    ) -> Box<dyn Iterator<Item = (&'a String, &'a Option<Value>)> + 'a> {
        if range.is_empty() {
            return Box::new(std::iter::empty());
        }
        Box::new(self.edits.range::<str, _>(range.as_ref_bounds()))
    }

    pub fn into_edits(self) -> impl Iterator<Item = (String, Option<Value>)> {
        self.edits.into_iter()
    }
}

/// Ordered key-value backend.
pub trait TupleStorage: Send {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Entries within `range` in `direction` order, at most `limit` of them.
    fn scan(
        &self,
        range: &KeyRange,
        direction: Direction,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>>;

    /// Apply every edit or none.
    fn apply_edits(&mut self, batch: WriteBatch) -> Result<()>;

    fn clear(&mut self) -> Result<()>;

    fn count(&self, range: &KeyRange) -> Result<usize> {
        Ok(self.scan(range, Direction::Asc, None)?.len())
    }

    fn set(&mut self, key: String, value: Value) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.set(key, value);
        self.apply_edits(batch)
    }

    fn delete(&mut self, key: String) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.apply_edits(batch)
    }
}

/// In-memory storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: BTreeMap<String, Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl TupleStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(
        &self,
        range: &KeyRange,
        direction: Direction,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.data.range::<str, _>(range.as_ref_bounds());
        let limit = limit.unwrap_or(usize::MAX);
        let collected = match direction {
            Direction::Asc => entries
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Direction::Desc => entries
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(collected)
    }

    fn apply_edits(&mut self, batch: WriteBatch) -> Result<()> {
        for (key, edit) in batch.into_edits() {
            match edit {
                Some(value) => {
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(items: &[&str]) -> Tuple {
        items.iter().map(|s| Value::from(*s)).collect()
    }

    fn populated() -> (MemoryStorage, Codec) {
        let codec = Codec::default();
        let mut storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        for key in [
            t(&["a", "1"]),
            t(&["a", "2"]),
            t(&["a", "2", "x"]),
            t(&["a", "3"]),
            t(&["b", "1"]),
        ] {
            batch.set(codec.encode_tuple(&key).unwrap(), Value::Null);
        }
        storage.apply_edits(batch).unwrap();
        (storage, codec)
    }

    fn scan(storage: &MemoryStorage, codec: &Codec, args: ScanArgs) -> Vec<Tuple> {
        let range = args.key_range(codec).unwrap();
        storage
            .scan(&range, args.direction, args.limit)
            .unwrap()
            .into_iter()
            .map(|(k, _)| crate::codec::decode_tuple(&k).unwrap())
            .collect()
    }

    #[test]
    fn prefix_scan() {
        let (storage, codec) = populated();
        let found = scan(&storage, &codec, ScanArgs::prefix(t(&["a"])));
        assert_eq!(
            found,
            vec![
                t(&["a", "1"]),
                t(&["a", "2"]),
                t(&["a", "2", "x"]),
                t(&["a", "3"])
            ]
        );
    }

    #[test]
    fn gt_skips_extensions_and_lte_includes_them() {
        let (storage, codec) = populated();
        let gt = scan(&storage, &codec, ScanArgs::prefix(t(&["a"])).gt(t(&["2"])));
        assert_eq!(gt, vec![t(&["a", "3"])]);

        let lte = scan(&storage, &codec, ScanArgs::prefix(t(&["a"])).lte(t(&["2"])));
        assert_eq!(lte, vec![t(&["a", "1"]), t(&["a", "2"]), t(&["a", "2", "x"])]);

        let lt = scan(&storage, &codec, ScanArgs::prefix(t(&["a"])).lt(t(&["2"])));
        assert_eq!(lt, vec![t(&["a", "1"])]);
    }

    #[test]
    fn descending_with_limit_and_resume() {
        let (storage, codec) = populated();
        let page = scan(
            &storage,
            &codec,
            ScanArgs::prefix(t(&["a"])).limit(2),
        );
        assert_eq!(page, vec![t(&["a", "1"]), t(&["a", "2"])]);
        let next = scan(
            &storage,
            &codec,
            ScanArgs::prefix(t(&["a"])).after(t(&["2"])).limit(2),
        );
        assert_eq!(next, vec![t(&["a", "2", "x"]), t(&["a", "3"])]);

        let desc = scan(
            &storage,
            &codec,
            ScanArgs::prefix(t(&["a"]))
                .direction(Direction::Desc)
                .limit(1),
        );
        assert_eq!(desc, vec![t(&["a", "3"])]);
    }

    #[test]
    fn inverted_range_is_empty() {
        let (storage, codec) = populated();
        let found = scan(
            &storage,
            &codec,
            ScanArgs::prefix(t(&["a"])).gte(t(&["3"])).lt(t(&["1"])),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn batch_deletes_and_count() {
        let (mut storage, codec) = populated();
        let key = codec.encode_tuple(&t(&["b", "1"])).unwrap();
        storage.delete(key.clone()).unwrap();
        assert_eq!(storage.get(&key).unwrap(), None);
        assert_eq!(storage.count(&KeyRange::full()).unwrap(), 4);
        storage.clear().unwrap();
        assert!(storage.is_empty());
    }
}
