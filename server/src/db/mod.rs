//! The server's database: the engine facade over in-memory storage, with
//! an optional durable clock and snapshot file.

mod persistence;

pub use persistence::*;

use std::sync::Arc;

use tokio::sync::Mutex;
use weft_engine::{Clock, Database, DurableClock, MemoryClock, MemoryStorage, Schema};

use crate::config::Config;
use crate::error::AppError;

/// Database type used by the server.
pub type ServerDatabase = Database<MemoryStorage, Box<dyn Clock>>;

/// The database shared by every connection. Holding the lock is the
/// single-writer discipline for the triple store.
pub type SharedDatabase = Arc<Mutex<ServerDatabase>>;

/// Open the database described by `config`, restoring the last snapshot
/// when a data directory is configured.
pub fn open_database(config: &Config, schema: Option<Schema>) -> Result<ServerDatabase, AppError> {
    let clock: Box<dyn Clock> = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Box::new(DurableClock::open(
                config.replica_id.clone(),
                FileSequence::in_dir(dir),
            )?)
        }
        None => Box::new(MemoryClock::new(config.replica_id.clone())),
    };

    let mut db = Database::new(MemoryStorage::new(), clock);
    if let Some(schema) = schema {
        let hash = schema.hash()?;
        tracing::info!(
            version = schema.version,
            collections = schema.collections.len(),
            hash = %hash,
            "Loaded schema"
        );
        db = db.with_schema(schema);
    }

    if let Some(dir) = &config.data_dir {
        if let Some(snapshot) = SnapshotFile::in_dir(dir).load()? {
            tracing::info!(
                triples = snapshot.triple_count(),
                sequence = snapshot.sequence,
                "Restoring snapshot"
            );
            db.import_snapshot(snapshot)?;
        }
    }

    Ok(db)
}

pub fn shared(db: ServerDatabase) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

/// Write the current store to the snapshot file, if persistence is on.
pub async fn persist(db: &SharedDatabase, config: &Config) -> Result<(), AppError> {
    let Some(dir) = &config.data_dir else {
        return Ok(());
    };
    let snapshot = db.lock().await.export_snapshot()?;
    SnapshotFile::in_dir(dir).save(&snapshot)
}
