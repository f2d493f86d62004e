//! Embedded recovery store (§4.L): one record per managed VM, keyed by its
//! UUID, persisted across agent restarts so the composition root can
//! re-synchronize driver state on startup (§6 "Persisted state").

mod record;

pub use record::RecoveryRecord;

use std::path::Path;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecoveryStoreError {
    #[error("failed to open recovery store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sled::Error,
    },
    #[error("recovery store I/O error: {0}")]
    Io(#[from] sled::Error),
    #[error("failed to encode recovery record: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, RecoveryStoreError>;

/// Thin wrapper around a `sled::Tree` that speaks `RecoveryRecord`.
pub struct RecoveryStore {
    db: sled::Db,
}

impl RecoveryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|source| RecoveryStoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { db })
    }

    /// Called whenever a VM's status changes (§4.L).
    pub fn put(&self, vm_id: Uuid, record: &RecoveryRecord) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        self.db.insert(vm_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Called once a VM reaches `Down` and the transition is acknowledged.
    pub fn remove(&self, vm_id: Uuid) -> Result<()> {
        self.db.remove(vm_id.as_bytes())?;
        Ok(())
    }

    /// Called once at startup. Unreadable records are logged and skipped,
    /// never abort recovery.
    pub fn load_all(&self) -> Result<Vec<RecoveryRecord>> {
        let mut records = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            match bincode::deserialize::<RecoveryRecord>(&value) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(
                        key = %hex_encode(&key),
                        error = %err,
                        "skipping unreadable recovery record"
                    );
                }
            }
        }
        Ok(records)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
