//! LMDB-backed durable store.
//!
//! Uses heed (Rust bindings for LMDB) for a memory-mapped key-value file.
//! Values are stored as `[fetched_at millis: 8 bytes LE][json payload]` so
//! the fetch time can be read without parsing the payload.

use crate::persist::{DurableStore, PersistError, PersistedBlob};
use chrono::DateTime;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use std::path::Path;

/// Error type for LMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for PersistError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::Io(io) => PersistError::Io(io),
            other => PersistError::Backend(other.to_string()),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// Durable cache snapshots in a single LMDB database.
pub struct LmdbDurableStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for LmdbDurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbDurableStore")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbDurableStore {
    /// Open or create the environment at `path` with a `max_size_mb` map.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self { env, db })
    }

    fn encode(blob: &PersistedBlob) -> Result<Vec<u8>, PersistError> {
        let payload = serde_json::to_vec(&blob.payload)?;
        let mut bytes = Vec::with_capacity(8 + payload.len());
        bytes.extend_from_slice(&blob.fetched_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<PersistedBlob, LmdbStoreError> {
        let corrupt = |reason: &str| LmdbStoreError::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if bytes.len() < 8 {
            return Err(corrupt("record shorter than timestamp header"));
        }
        let (header, payload) = bytes.split_at(8);
        let millis = i64::from_le_bytes(
            header
                .try_into()
                .map_err(|_| corrupt("invalid timestamp header"))?,
        );
        let fetched_at =
            DateTime::from_timestamp_millis(millis).ok_or_else(|| corrupt("timestamp out of range"))?;
        let payload = serde_json::from_slice(payload).map_err(|e| corrupt(&e.to_string()))?;
        Ok(PersistedBlob::new(fetched_at, payload))
    }
}

impl DurableStore for LmdbDurableStore {
    fn read(&self, key: &str) -> Result<Option<PersistedBlob>, PersistError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.db.get(&rtxn, key.as_bytes()).map_err(txn_err)? {
            Some(bytes) => Ok(Some(Self::decode(key, bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, blob: &PersistedBlob) -> Result<(), PersistError> {
        let bytes = Self::encode(blob)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, PersistError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut keys = Vec::new();
        for item in self.db.iter(&rtxn).map_err(txn_err)? {
            let (key, _) = item.map_err(txn_err)?;
            match std::str::from_utf8(key) {
                Ok(key) => keys.push(key.to_string()),
                Err(_) => continue,
            }
        }
        Ok(keys)
    }
}
