//! File-backed persistence for the clock sequence and store snapshots.
//!
//! Both files are written to a temporary sibling first and renamed into
//! place, so a crash mid-write leaves the previous version intact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use weft_engine::{clock::SequencePersistence, Error, StoreSnapshot};

use crate::error::AppError;

pub const SEQUENCE_FILE: &str = "sequence";
pub const SNAPSHOT_FILE: &str = "snapshot.json";

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Clock sequence stored as a decimal number in a file.
#[derive(Debug, Clone)]
pub struct FileSequence {
    path: PathBuf,
}

impl FileSequence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The sequence file inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SEQUENCE_FILE))
    }
}

impl SequencePersistence for FileSequence {
    fn load(&mut self) -> weft_engine::Result<u64> {
        match fs::read_to_string(&self.path) {
            Ok(text) => text.trim().parse().map_err(|e| {
                Error::Storage(format!("corrupt sequence file {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::Storage(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn save(&mut self, sequence: u64) -> weft_engine::Result<()> {
        write_atomic(&self.path, &sequence.to_string())
            .map_err(|e| Error::Storage(format!("cannot write {}: {}", self.path.display(), e)))
    }
}

/// Whole-store snapshot kept as JSON.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file means a fresh store.
    pub fn load(&self) -> Result<Option<StoreSnapshot>, AppError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(StoreSnapshot::from_json(&text)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<(), AppError> {
        write_atomic(&self.path, &snapshot.to_json()?)?;
        tracing::info!(
            path = %self.path.display(),
            triples = snapshot.triple_count(),
            "Snapshot saved"
        );
        Ok(())
    }
}
