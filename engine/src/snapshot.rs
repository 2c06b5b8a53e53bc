//! Snapshot types for persisting and restoring store state.
//!
//! A snapshot carries every fact and metadata entry of a store together with
//! the replica's clock position. Facts are sorted so that two stores holding
//! the same facts serialize identically.

use crate::{error::Result, Error, ReplicaId, Timestamp, TripleRow, Tuple, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the store state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Replica the snapshot was taken on
    pub replica_id: ReplicaId,
    /// Last clock sequence issued by the replica
    pub sequence: u64,
    /// All facts, sorted by entity, attribute and timestamp
    pub triples: Vec<TripleRow>,
    /// Metadata entries
    pub metadata: Vec<(Tuple, Value)>,
}

impl StoreSnapshot {
    pub fn new(replica_id: impl Into<ReplicaId>, sequence: u64) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            replica_id: replica_id.into(),
            sequence,
            triples: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// Add facts, keeping the canonical order.
    pub fn add_triples(&mut self, rows: impl IntoIterator<Item = TripleRow>) {
        self.triples.extend(rows);
        self.triples.sort_by(|a, b| {
            a.entity_id
                .cmp(&b.entity_id)
                .then_with(|| a.attribute.cmp(&b.attribute))
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
    }

    pub fn triple_count(&self) -> usize {
        self.triples.len()
    }

    /// Number of distinct entities with facts in the snapshot.
    pub fn entity_count(&self) -> usize {
        self.triples
            .iter()
            .map(|row| row.entity_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Newest timestamp among the facts.
    pub fn max_timestamp(&self) -> Option<&Timestamp> {
        self.triples.iter().map(|row| &row.timestamp).max()
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub replica_id: ReplicaId,
    pub sequence: u64,
    pub triple_count: usize,
    pub entity_count: usize,
}

impl From<&StoreSnapshot> for SnapshotMetadata {
    fn from(snapshot: &StoreSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            replica_id: snapshot.replica_id.clone(),
            sequence: snapshot.sequence,
            triple_count: snapshot.triple_count(),
            entity_count: snapshot.entity_count(),
        }
    }
}
