//! StateStore: redb-backed ledger for provisioned resources and
//! discovery records.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.open_table(PARAMETERS).map_err(map_err!(Table))?;
        txn.open_table(RETIRED_VERSIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Resources ──────────────────────────────────────────────────

    /// Insert or update a resource record.
    pub fn put_resource(&self, record: &ResourceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %record.id, "resource stored");
        Ok(())
    }

    pub fn get_resource(&self, id: &str) -> StateResult<Option<ResourceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ResourceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all resources ordered by creation sequence.
    pub fn list_resources(&self) -> StateResult<Vec<ResourceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ResourceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        results.sort_by_key(|r| r.sequence);
        Ok(results)
    }

    /// Delete a resource by id. Returns true if it existed.
    pub fn delete_resource(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, existed, "resource deleted");
        Ok(existed)
    }

    /// Next creation sequence number (one past the highest in the ledger).
    pub fn next_sequence(&self) -> StateResult<u64> {
        Ok(self
            .list_resources()?
            .last()
            .map(|r| r.sequence + 1)
            .unwrap_or(1))
    }

    // ── Parameters ─────────────────────────────────────────────────

    /// Write `value` under `key` in a single write transaction.
    ///
    /// A changed value bumps the version; an identical value leaves the
    /// record untouched and returns it.
    pub fn put_parameter(&self, key: &str, value: &str) -> StateResult<DiscoveryRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record;
        {
            let mut table = txn.open_table(PARAMETERS).map_err(map_err!(Table))?;
            let existing: Option<DiscoveryRecord> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            if let Some(current) = existing.as_ref().filter(|r| r.value == value) {
                return Ok(current.clone());
            }

            let mut retired = txn.open_table(RETIRED_VERSIONS).map_err(map_err!(Table))?;
            let previous = match &existing {
                Some(current) => current.version,
                None => retired
                    .remove(key)
                    .map_err(map_err!(Write))?
                    .map(|guard| guard.value())
                    .unwrap_or(0),
            };

            record = DiscoveryRecord {
                key: key.to_string(),
                value: value.to_string(),
                version: previous + 1,
                updated_at: epoch_secs(),
            };
            let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version = record.version, "parameter published");
        Ok(record)
    }

    pub fn get_parameter(&self, key: &str) -> StateResult<Option<DiscoveryRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PARAMETERS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: DiscoveryRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn delete_parameter(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PARAMETERS).map_err(map_err!(Table))?;
            let removed: Option<DiscoveryRecord> = match table.remove(key).map_err(map_err!(Write))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            existed = removed.is_some();
            if let Some(record) = removed {
                let mut retired = txn.open_table(RETIRED_VERSIONS).map_err(map_err!(Table))?;
                retired
                    .insert(key, record.version)
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "parameter retracted");
        Ok(existed)
    }
}
