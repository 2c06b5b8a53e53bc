//! Triple store - transactional fact storage with secondary indexes.
//!
//! Every fact is written to three key spaces over the same storage:
//!
//! - `EAT`: `(entity, attribute, timestamp) -> [value, expired]`
//! - `AVE`: `(attribute, value, entity, timestamp) -> expired`
//! - `clientTimestamp`: `(replica, timestamp, entity, attribute, value) -> expired`
//!
//! A side `metadata` key space holds bookkeeping tuples that are not entity
//! facts. All writes go through a [`TripleStoreTransaction`], which borrows
//! the store mutably; the borrow checker thereby enforces a single writer.

use crate::clock::Clock;
use crate::codec::{decode_tuple, Codec};
use crate::storage::{Direction, ScanArgs, TupleStorage, WriteBatch};
use crate::{
    error::Result, AttributePath, EntityId, Error, Timestamp, TripleRow, Tuple, Value,
};
use serde::{Deserialize, Serialize};

pub const EAT_INDEX: &str = "EAT";
pub const AVE_INDEX: &str = "AVE";
pub const CLIENT_TIMESTAMP_INDEX: &str = "clientTimestamp";
pub const METADATA_INDEX: &str = "metadata";

/// Hook run on rows about to be inserted. May append rows or veto.
pub type BeforeInsertHook = Box<dyn Fn(&mut Vec<TripleRow>) -> Result<()> + Send + Sync>;
/// Hook run inside the commit boundary with every row the transaction wrote.
pub type BeforeCommitHook = Box<dyn Fn(&[TripleRow]) -> Result<()> + Send + Sync>;
pub type CommitListener = Box<dyn Fn(&CommitSummary) + Send + Sync>;
pub type MetadataListener = Box<dyn Fn(&[MetadataChange]) + Send + Sync>;

/// Comparison used by [`TripleReader::find_by_client_timestamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampScan {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

/// Value bounds for [`TripleReader::find_values_in_range`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueRange {
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
}

/// A change to the metadata key space.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataChange {
    Updated { key: Tuple, value: Value },
    Deleted { key: Tuple },
}

/// What a committed transaction wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitSummary {
    /// Assigned timestamp, if the transaction asked for one
    pub timestamp: Option<Timestamp>,
    pub inserted: Vec<TripleRow>,
    pub deleted: Vec<TripleRow>,
    pub metadata: Vec<MetadataChange>,
}

impl CommitSummary {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.metadata.is_empty()
    }

    /// Entity ids touched by this commit, deduplicated.
    pub fn entity_ids(&self) -> std::collections::BTreeSet<&str> {
        self.inserted
            .iter()
            .chain(self.deleted.iter())
            .map(|row| row.entity_id.as_str())
            .collect()
    }
}

#[derive(Default)]
struct Hooks {
    before_insert: Vec<BeforeInsertHook>,
    before_commit: Vec<BeforeCommitHook>,
    after_commit: Vec<CommitListener>,
    metadata: Vec<MetadataListener>,
}

/// Read access shared by the store and its transactions.
pub trait TripleReader {
    /// Raw scan over any key space. Keys are returned as full tuples.
    fn scan_index(&self, args: &ScanArgs) -> Result<Vec<(Tuple, Value)>>;

    fn find_by_entity(&self, entity_id: &str) -> Result<Vec<TripleRow>> {
        let args = ScanArgs::prefix(vec![EAT_INDEX.into(), entity_id.into()]);
        decode_entries(self.scan_index(&args)?)
    }

    fn find_by_entity_attribute(
        &self,
        entity_id: &str,
        attribute: &AttributePath,
    ) -> Result<Vec<TripleRow>> {
        let args = ScanArgs::prefix(vec![
            EAT_INDEX.into(),
            entity_id.into(),
            attribute.to_value(),
        ]);
        decode_entries(self.scan_index(&args)?)
    }

    fn find_by_attribute(
        &self,
        attribute: &AttributePath,
        direction: Direction,
    ) -> Result<Vec<TripleRow>> {
        let args = ScanArgs::prefix(vec![AVE_INDEX.into(), attribute.to_value()])
            .direction(direction);
        decode_entries(self.scan_index(&args)?)
    }

    /// Every fact of every entity whose id belongs to `collection`, grouped
    /// by entity.
    fn find_by_collection(&self, collection: &str, direction: Direction) -> Result<Vec<TripleRow>> {
        let lower = format!("{}#", collection);
        let upper = format!("{}$", collection);
        let args = ScanArgs::prefix(vec![EAT_INDEX.into()])
            .gte(vec![Value::String(lower)])
            .lt(vec![Value::String(upper)])
            .direction(direction);
        decode_entries(self.scan_index(&args)?)
    }

    fn find_values_in_range(
        &self,
        attribute: &AttributePath,
        range: &ValueRange,
        direction: Direction,
    ) -> Result<Vec<TripleRow>> {
        let mut args = ScanArgs::prefix(vec![AVE_INDEX.into(), attribute.to_value()])
            .direction(direction);
        args.gt = range.gt.clone().map(|v| vec![v]);
        args.gte = range.gte.clone().map(|v| vec![v]);
        args.lt = range.lt.clone().map(|v| vec![v]);
        args.lte = range.lte.clone().map(|v| vec![v]);
        decode_entries(self.scan_index(&args)?)
    }

    /// Facts written by `replica` relative to `timestamp`. A missing
    /// timestamp is only meaningful for `Gt`/`Gte`, where it selects all.
    fn find_by_client_timestamp(
        &self,
        replica_id: &str,
        scan: TimestampScan,
        timestamp: Option<&Timestamp>,
    ) -> Result<Vec<TripleRow>> {
        let prefix = vec![CLIENT_TIMESTAMP_INDEX.into(), replica_id.into()];
        let args = match (scan, timestamp) {
            (TimestampScan::Gt | TimestampScan::Gte, None) => ScanArgs::prefix(prefix),
            (TimestampScan::Gt, Some(ts)) => ScanArgs::prefix(prefix).gt(vec![ts.to_value()]),
            (TimestampScan::Gte, Some(ts)) => ScanArgs::prefix(prefix).gte(vec![ts.to_value()]),
            (TimestampScan::Lt, Some(ts)) => ScanArgs::prefix(prefix).lt(vec![ts.to_value()]),
            (TimestampScan::Lte, Some(ts)) => ScanArgs::prefix(prefix).lte(vec![ts.to_value()]),
            (TimestampScan::Eq, Some(ts)) => {
                let mut exact = prefix;
                exact.push(ts.to_value());
                ScanArgs::prefix(exact)
            }
            (scan, None) => {
                return Err(Error::InvalidTimestampIndexScan(format!(
                    "{:?} scan requires a timestamp",
                    scan
                )))
            }
        };
        decode_entries(self.scan_index(&args)?)
    }

    /// The newest timestamp this store holds from `replica_id`.
    fn find_max_client_timestamp(&self, replica_id: &str) -> Result<Option<Timestamp>> {
        let args = ScanArgs::prefix(vec![CLIENT_TIMESTAMP_INDEX.into(), replica_id.into()])
            .direction(Direction::Desc)
            .limit(1);
        Ok(decode_entries(self.scan_index(&args)?)?
            .into_iter()
            .next()
            .map(|row| row.timestamp))
    }

    fn find_all_triples(&self) -> Result<Vec<TripleRow>> {
        decode_entries(self.scan_index(&ScanArgs::prefix(vec![EAT_INDEX.into()]))?)
    }

    /// Metadata entries under `prefix`; returned keys exclude the namespace.
    fn read_metadata_tuples(&self, prefix: Tuple) -> Result<Vec<(Tuple, Value)>> {
        let mut full = vec![Value::from(METADATA_INDEX)];
        full.extend(prefix);
        Ok(self
            .scan_index(&ScanArgs::prefix(full))?
            .into_iter()
            .map(|(mut key, value)| {
                key.remove(0);
                (key, value)
            })
            .collect())
    }
}

/// The triple store.
pub struct TripleStore<S: TupleStorage, C: Clock> {
    storage: S,
    clock: C,
    codec: Codec,
    hooks: Hooks,
}

impl<S: TupleStorage, C: Clock> TripleStore<S, C> {
    pub fn new(storage: S, clock: C) -> Self {
        Self {
            storage,
            clock,
            codec: Codec::default(),
            hooks: Hooks::default(),
        }
    }

    /// Use a codec with restricted string contents.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn replica_id(&self) -> &str {
        self.clock.replica_id()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn before_insert(&mut self, hook: BeforeInsertHook) {
        self.hooks.before_insert.push(hook);
    }

    pub fn before_commit(&mut self, hook: BeforeCommitHook) {
        self.hooks.before_commit.push(hook);
    }

    pub fn on_commit(&mut self, listener: CommitListener) {
        self.hooks.after_commit.push(listener);
    }

    pub fn on_metadata_change(&mut self, listener: MetadataListener) {
        self.hooks.metadata.push(listener);
    }

    /// Open a transaction. It holds the store until committed or cancelled.
    pub fn transaction(&mut self) -> TripleStoreTransaction<'_, S, C> {
        TripleStoreTransaction {
            store: self,
            batch: WriteBatch::new(),
            timestamp: None,
            inserted: Vec::new(),
            deleted: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// Run `f` in a transaction, committing on `Ok` and cancelling on `Err`.
    pub fn transact<T, F>(&mut self, f: F) -> Result<(T, CommitSummary)>
    where
        F: FnOnce(&mut TripleStoreTransaction<'_, S, C>) -> Result<T>,
    {
        let mut tx = self.transaction();
        match f(&mut tx) {
            Ok(output) => {
                let summary = tx.commit()?;
                Ok((output, summary))
            }
            Err(e) => {
                tx.cancel();
                Err(e)
            }
        }
    }

    pub fn insert_triples(&mut self, rows: Vec<TripleRow>) -> Result<CommitSummary> {
        self.transact(|tx| tx.insert_triples(rows)).map(|(_, s)| s)
    }

    pub fn delete_triples(&mut self, rows: &[TripleRow]) -> Result<CommitSummary> {
        self.transact(|tx| tx.delete_triples(rows)).map(|(_, s)| s)
    }

    pub fn update_metadata_tuples(&mut self, entries: Vec<(Tuple, Value)>) -> Result<()> {
        self.transact(|tx| tx.update_metadata_tuples(entries))
            .map(|_| ())
    }

    pub fn delete_metadata_tuples(&mut self, keys: Vec<Tuple>) -> Result<()> {
        self.transact(|tx| tx.delete_metadata_tuples(keys)).map(|_| ())
    }

    /// Remove every fact and metadata entry.
    pub fn clear(&mut self) -> Result<()> {
        self.storage.clear()
    }

    fn index_entries(&self, row: &TripleRow) -> Result<[(String, Value); 3]> {
        let attribute = row.attribute.to_value();
        let timestamp = row.timestamp.to_value();
        let entity: Value = row.entity_id.as_str().into();
        let eat = self.codec.encode_tuple(&[
            EAT_INDEX.into(),
            entity.clone(),
            attribute.clone(),
            timestamp.clone(),
        ])?;
        let ave = self.codec.encode_tuple(&[
            AVE_INDEX.into(),
            attribute.clone(),
            row.value.clone(),
            entity.clone(),
            timestamp.clone(),
        ])?;
        let client = self.codec.encode_tuple(&[
            CLIENT_TIMESTAMP_INDEX.into(),
            row.timestamp.replica_id.as_str().into(),
            timestamp,
            entity,
            attribute,
            row.value.clone(),
        ])?;
        Ok([
            (
                eat,
                Value::Array(vec![row.value.clone(), Value::Bool(row.expired)]),
            ),
            (ave, Value::Bool(row.expired)),
            (client, Value::Bool(row.expired)),
        ])
    }

    fn scan_with(&self, args: &ScanArgs, overlay: &WriteBatch) -> Result<Vec<(Tuple, Value)>> {
        let range = args.key_range(&self.codec)?;
        let pending: Vec<_> = overlay.range(&range).collect();
        let fetch_limit = args.limit.map(|l| l + pending.len());
        let mut merged: std::collections::BTreeMap<String, Value> = self
            .storage
            .scan(&range, args.direction, fetch_limit)?
            .into_iter()
            .collect();
        for (key, edit) in pending {
            match edit {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        let limit = args.limit.unwrap_or(usize::MAX);
        let ordered: Box<dyn Iterator<Item = (String, Value)>> = match args.direction {
            Direction::Asc => Box::new(merged.into_iter()),
            Direction::Desc => Box::new(merged.into_iter().rev()),
        };
        ordered
            .take(limit)
            .map(|(key, value)| Ok((decode_tuple(&key)?, value)))
            .collect()
    }
}

impl<S: TupleStorage, C: Clock> TripleReader for TripleStore<S, C> {
    fn scan_index(&self, args: &ScanArgs) -> Result<Vec<(Tuple, Value)>> {
        self.scan_with(args, &WriteBatch::new())
    }
}

/// A pending set of writes against a [`TripleStore`].
///
/// The transaction owns at most one timestamp, assigned on first use.
/// Reads observe the transaction's own uncommitted writes.
pub struct TripleStoreTransaction<'a, S: TupleStorage, C: Clock> {
    store: &'a mut TripleStore<S, C>,
    batch: WriteBatch,
    timestamp: Option<Timestamp>,
    inserted: Vec<TripleRow>,
    deleted: Vec<TripleRow>,
    metadata: Vec<MetadataChange>,
}

impl<'a, S: TupleStorage, C: Clock> TripleStoreTransaction<'a, S, C> {
    /// The transaction's timestamp, issuing it from the clock if needed.
    pub fn timestamp(&mut self) -> Result<Timestamp> {
        if let Some(ts) = &self.timestamp {
            return Ok(ts.clone());
        }
        let ts = self.store.clock.next_timestamp()?;
        self.timestamp = Some(ts.clone());
        Ok(ts)
    }

    /// The timestamp if one was already assigned.
    pub fn assigned_timestamp(&self) -> Option<&Timestamp> {
        self.timestamp.as_ref()
    }

    pub fn replica_id(&self) -> &str {
        self.store.replica_id()
    }

    pub fn insert_triples(&mut self, rows: Vec<TripleRow>) -> Result<()> {
        let mut rows = rows;
        for hook in &self.store.hooks.before_insert {
            hook(&mut rows)?;
        }
        for row in &rows {
            row.validate()?;
        }
        if let Some(newest) = rows.iter().map(|r| &r.timestamp).max() {
            self.store.clock.observe(newest)?;
        }
        for row in rows {
            self.write_row(row)?;
        }
        Ok(())
    }

    pub fn insert_triple(&mut self, row: TripleRow) -> Result<()> {
        self.insert_triples(vec![row])
    }

    fn write_row(&mut self, row: TripleRow) -> Result<()> {
        let entries = self.store.index_entries(&row)?;
        // Same (entity, attribute, timestamp) replaces the previous fact,
        // including its value-bearing index keys.
        if let Some(previous) = self.get_entry(&entries[0].0)? {
            let old = eat_row(&row, &previous)?;
            if old.value != row.value {
                for (key, _) in self.store.index_entries(&old)? {
                    self.batch.delete(key);
                }
            }
        }
        for (key, value) in entries {
            self.batch.set(key, value);
        }
        self.inserted.push(row);
        Ok(())
    }

    fn get_entry(&self, key: &str) -> Result<Option<Value>> {
        match self.batch.get(key) {
            Some(edit) => Ok(edit.cloned()),
            None => self.store.storage.get(key),
        }
    }

    pub fn delete_triples(&mut self, rows: &[TripleRow]) -> Result<()> {
        for row in rows {
            for (key, _) in self.store.index_entries(row)? {
                self.batch.delete(key);
            }
            self.deleted.push(row.clone());
        }
        Ok(())
    }

    /// Write each `(entity, attribute, value)` at the transaction timestamp,
    /// unless a strictly newer fact for that attribute already exists. Older
    /// facts for the attribute are removed.
    pub fn set_values(&mut self, eavs: Vec<(EntityId, AttributePath, Value)>) -> Result<()> {
        let timestamp = self.timestamp()?;
        for (entity_id, attribute, value) in eavs {
            self.write_if_newest(TripleRow::new(entity_id, attribute, value, timestamp.clone()))?;
        }
        Ok(())
    }

    pub fn set_value(
        &mut self,
        entity_id: impl Into<EntityId>,
        attribute: AttributePath,
        value: Value,
    ) -> Result<()> {
        self.set_values(vec![(entity_id.into(), attribute, value)])
    }

    /// Tombstone each `(entity, attribute)` at the transaction timestamp.
    pub fn expire_entity_attributes(&mut self, list: Vec<(EntityId, AttributePath)>) -> Result<()> {
        let timestamp = self.timestamp()?;
        for (entity_id, attribute) in list {
            self.write_if_newest(TripleRow::tombstone(entity_id, attribute, timestamp.clone()))?;
        }
        Ok(())
    }

    /// Delete a whole entity by tombstoning its `_collection` attribute.
    pub fn expire_entity(&mut self, entity_id: impl Into<EntityId>) -> Result<()> {
        self.expire_entity_attributes(vec![(
            entity_id.into(),
            AttributePath::collection_marker(),
        )])
    }

    fn write_if_newest(&mut self, row: TripleRow) -> Result<()> {
        let existing = self.find_by_entity_attribute(&row.entity_id, &row.attribute)?;
        if existing.iter().any(|t| t.timestamp > row.timestamp) {
            tracing::trace!(
                entity_id = %row.entity_id,
                attribute = %row.attribute,
                timestamp = %row.timestamp,
                "skipping write shadowed by a newer fact"
            );
            return Ok(());
        }
        let older: Vec<TripleRow> = existing
            .into_iter()
            .filter(|t| t.timestamp < row.timestamp)
            .collect();
        self.delete_triples(&older)?;
        self.insert_triple(row)
    }

    pub fn update_metadata_tuples(&mut self, entries: Vec<(Tuple, Value)>) -> Result<()> {
        for (key, value) in entries {
            let encoded = self.metadata_key(&key)?;
            self.batch.set(encoded, value.clone());
            self.metadata.push(MetadataChange::Updated { key, value });
        }
        Ok(())
    }

    pub fn delete_metadata_tuples(&mut self, keys: Vec<Tuple>) -> Result<()> {
        for key in keys {
            // Deleting a prefix removes everything beneath it.
            let existing = self.read_metadata_tuples(key.clone())?;
            for (full, _) in existing {
                let encoded = self.metadata_key(&full)?;
                self.batch.delete(encoded);
                self.metadata.push(MetadataChange::Deleted { key: full });
            }
        }
        Ok(())
    }

    fn metadata_key(&self, key: &Tuple) -> Result<String> {
        let mut full = vec![Value::from(METADATA_INDEX)];
        full.extend(key.iter().cloned());
        self.store.codec.encode_tuple(&full)
    }

    /// Apply every write atomically.
    pub fn commit(self) -> Result<CommitSummary> {
        let store = self.store;
        for hook in &store.hooks.before_commit {
            hook(&self.inserted)?;
        }
        let summary = CommitSummary {
            timestamp: self.timestamp,
            inserted: self.inserted,
            deleted: self.deleted,
            metadata: self.metadata,
        };
        if !self.batch.is_empty() {
            store.storage.apply_edits(self.batch)?;
        }
        tracing::debug!(
            timestamp = ?summary.timestamp,
            inserted = summary.inserted.len(),
            deleted = summary.deleted.len(),
            "triple store transaction committed"
        );
        if !summary.metadata.is_empty() {
            for listener in &store.hooks.metadata {
                listener(&summary.metadata);
            }
        }
        for listener in &store.hooks.after_commit {
            listener(&summary);
        }
        Ok(summary)
    }

    /// Discard every write.
    pub fn cancel(self) {
        tracing::trace!(pending = self.batch.len(), "triple store transaction cancelled");
    }
}

impl<S: TupleStorage, C: Clock> TripleReader for TripleStoreTransaction<'_, S, C> {
    fn scan_index(&self, args: &ScanArgs) -> Result<Vec<(Tuple, Value)>> {
        self.store.scan_with(args, &self.batch)
    }
}

fn decode_entries(entries: Vec<(Tuple, Value)>) -> Result<Vec<TripleRow>> {
    entries
        .iter()
        .map(|(key, stored)| decode_index_entry(key, stored))
        .collect()
}

/// Rebuild a fact from any of the three index entries.
pub fn decode_index_entry(key: &[Value], stored: &Value) -> Result<TripleRow> {
    let malformed = || Error::IndexNotFound(format!("malformed index key {:?}", key));
    let index = key.first().and_then(Value::as_str).ok_or_else(malformed)?;
    match index {
        EAT_INDEX => match (key, stored.as_array().map(Vec::as_slice)) {
            (
                [_, Value::String(entity_id), attribute, timestamp],
                Some([value, Value::Bool(expired)]),
            ) => Ok(TripleRow {
                entity_id: entity_id.clone(),
                attribute: AttributePath::from_value(attribute)?,
                value: value.clone(),
                timestamp: Timestamp::from_value(timestamp)?,
                expired: *expired,
            }),
            _ => Err(malformed()),
        },
        AVE_INDEX => match (key, stored) {
            ([_, attribute, value, Value::String(entity_id), timestamp], Value::Bool(expired)) => {
                Ok(TripleRow {
                    entity_id: entity_id.clone(),
                    attribute: AttributePath::from_value(attribute)?,
                    value: value.clone(),
                    timestamp: Timestamp::from_value(timestamp)?,
                    expired: *expired,
                })
            }
            _ => Err(malformed()),
        },
        CLIENT_TIMESTAMP_INDEX => match (key, stored) {
            (
                [_, Value::String(_), timestamp, Value::String(entity_id), attribute, value],
                Value::Bool(expired),
            ) => Ok(TripleRow {
                entity_id: entity_id.clone(),
                attribute: AttributePath::from_value(attribute)?,
                value: value.clone(),
                timestamp: Timestamp::from_value(timestamp)?,
                expired: *expired,
            }),
            _ => Err(malformed()),
        },
        other => Err(Error::IndexNotFound(other.to_string())),
    }
}

fn eat_row(row: &TripleRow, stored: &Value) -> Result<TripleRow> {
    match stored.as_array().map(Vec::as_slice) {
        Some([value, Value::Bool(expired)]) => Ok(TripleRow {
            entity_id: row.entity_id.clone(),
            attribute: row.attribute.clone(),
            value: value.clone(),
            timestamp: row.timestamp.clone(),
            expired: *expired,
        }),
        _ => Err(Error::IndexNotFound(format!(
            "malformed EAT entry for {} {}",
            row.entity_id, row.attribute
        ))),
    }
}
