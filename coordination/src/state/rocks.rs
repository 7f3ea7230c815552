//! RocksDB-backed state store.
//!
//! Each [`EntityKind`] lives in its own column family. Documents are stored
//! as JSON bytes so arbitrary payload bodies round-trip unchanged.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde_json::Value;

use super::schema::{EntityKind, ALL_CFS};
use super::store::{SharedStateStore, StateStore, StoreError, StoreResult};

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// RocksDB-backed persistent state store
pub struct RocksStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl RocksStore {
    /// Open or create a state store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl StateStore for RocksStore {
    fn put(&self, kind: EntityKind, id: &str, value: &Value) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf_name = kind.column_family();
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        db.put_cf(&cf, kind.key(id).as_bytes(), bytes)?;
        Ok(())
    }

    fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf_name = kind.column_family();
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        match db.get_cf(&cf, kind.key(id).as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf_name = kind.column_family();
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        db.delete_cf(&cf, kind.key(id).as_bytes())?;
        Ok(())
    }

    fn list(&self, kind: EntityKind) -> StoreResult<Vec<String>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf_name = kind.column_family();
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut ids = Vec::new();
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some(id) = kind.id_from_key(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
