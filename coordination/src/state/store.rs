//! Persistence contract for coordination state.
//!
//! Backends store JSON documents keyed by [`EntityKind`] and entity id.
//! Typed access goes through [`save`], [`load`] and [`load_all`] for any
//! type implementing [`Persist`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use super::schema::EntityKind;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a state store
pub type SharedStateStore = Arc<dyn StateStore>;

/// Key/value document store for coordination entities.
pub trait StateStore: Send + Sync {
    /// Insert or replace a document.
    fn put(&self, kind: EntityKind, id: &str, value: &Value) -> StoreResult<()>;

    /// Fetch a document.
    fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>>;

    /// Remove a document. Missing ids are not an error.
    fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<()>;

    /// Ids stored for a kind, in key order.
    fn list(&self, kind: EntityKind) -> StoreResult<Vec<String>>;
}

/// An entity that can be written to a [`StateStore`].
pub trait Persist: Serialize + DeserializeOwned {
    /// Entity kind the value is stored under.
    const KIND: EntityKind;

    /// Id the value is stored under.
    fn storage_id(&self) -> String;
}

/// Serialize and store a typed entity.
pub fn save<T: Persist>(store: &dyn StateStore, value: &T) -> StoreResult<()> {
    let doc = serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let id = value.storage_id();
    store.put(T::KIND, &id, &doc)?;
    debug!(kind = %T::KIND, id = %id, "entity saved");
    Ok(())
}

/// Load a typed entity by id.
pub fn load<T: Persist>(store: &dyn StateStore, id: &str) -> StoreResult<Option<T>> {
    match store.get(T::KIND, id)? {
        Some(doc) => serde_json::from_value(doc)
            .map(Some)
            .map_err(|e| StoreError::Deserialization(e.to_string())),
        None => Ok(None),
    }
}

/// Load every stored entity of a kind.
pub fn load_all<T: Persist>(store: &dyn StateStore) -> StoreResult<Vec<T>> {
    let mut out = Vec::new();
    for id in store.list(T::KIND)? {
        if let Some(value) = load::<T>(store, &id)? {
            out.push(value);
        }
    }
    Ok(out)
}

// =========================================================================
// In-memory backend
// =========================================================================

/// Volatile store, used by tests and hosts that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<EntityKind, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    /// Number of documents stored for a kind.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.docs
            .read()
            .map(|docs| docs.get(&kind).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

impl StateStore for MemoryStore {
    fn put(&self, kind: EntityKind, id: &str, value: &Value) -> StoreResult<()> {
        let mut docs = self.docs.write().map_err(|_| StoreError::LockPoisoned)?;
        docs.entry(kind)
            .or_default()
            .insert(id.to_string(), value.clone());
        Ok(())
    }

    fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>> {
        let docs = self.docs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(docs.get(&kind).and_then(|m| m.get(id)).cloned())
    }

    fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<()> {
        let mut docs = self.docs.write().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(m) = docs.get_mut(&kind) {
            m.remove(id);
        }
        Ok(())
    }

    fn list(&self, kind: EntityKind) -> StoreResult<Vec<String>> {
        let docs = self.docs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(docs
            .get(&kind)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// =========================================================================
// JSON file backend
// =========================================================================

/// One pretty-printed JSON file per entity under `<root>/<column family>/`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for kind in EntityKind::all() {
            std::fs::create_dir_all(root.join(kind.column_family()))?;
        }
        Ok(Self { root })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, kind: EntityKind, id: &str) -> PathBuf {
        self.root
            .join(kind.column_family())
            .join(format!("{}.json", encode_file_stem(&kind.key(id))))
    }
}

impl StateStore for JsonFileStore {
    fn put(&self, kind: EntityKind, id: &str, value: &Value) -> StoreResult<()> {
        let path = self.path_for(kind, id);
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>> {
        let path = self.path_for(kind, id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Deserialization(format!("{}: {}", path.display(), e)))
    }

    fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<()> {
        match std::fs::remove_file(self.path_for(kind, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, kind: EntityKind) -> StoreResult<Vec<String>> {
        let dir = self.root.join(kind.column_family());
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(id) = decode_file_stem(stem).and_then(|key| kind.id_from_key(&key)) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Escape a key into a portable file stem.
fn encode_file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_file_stem(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Persist for Note {
        const KIND: EntityKind = EntityKind::Event;

        fn storage_id(&self) -> String {
            self.id.clone()
        }
    }

    fn note(id: &str) -> Note {
        Note {
            id: id.to_string(),
            body: format!("body of {id}"),
        }
    }

    #[test]
    fn test_memory_store_typed_save_load() {
        let store = MemoryStore::new();
        save(&store, &note("n1")).unwrap();
        let loaded: Option<Note> = load(&store, "n1").unwrap();
        assert_eq!(loaded, Some(note("n1")));
        assert_eq!(store.count(EntityKind::Event), 1);
        assert_eq!(store.count(EntityKind::Agent), 0);
    }

    #[test]
    fn test_memory_store_delete_missing_ok() {
        let store = MemoryStore::new();
        store.delete(EntityKind::Agent, "nobody").unwrap();
        assert!(store.get(EntityKind::Agent, "nobody").unwrap().is_none());
    }

    #[test]
    fn test_file_store_round_trip_and_list() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        save(&store, &note("a:1")).unwrap();
        save(&store, &note("b/2")).unwrap();

        assert_eq!(
            store.list(EntityKind::Event).unwrap(),
            vec!["a:1".to_string(), "b/2".to_string()]
        );
        let all: Vec<Note> = load_all(&store).unwrap();
        assert_eq!(all.len(), 2);

        store.delete(EntityKind::Event, "a:1").unwrap();
        assert!(load::<Note>(&store, "a:1").unwrap().is_none());
    }

    #[test]
    fn test_file_store_reports_corrupt_document() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let path = store.path_for(EntityKind::Agent, "bad");
        std::fs::write(&path, "{ not json").unwrap();
        let err = store.get(EntityKind::Agent, "bad").unwrap_err();
        assert!(matches!(err, StoreError::Deserialization(_)));
    }

    #[test]
    fn test_file_stem_escaping() {
        let key = "agent:w 1/α";
        let stem = encode_file_stem(key);
        assert!(!stem.contains('/'));
        assert_eq!(decode_file_stem(&stem).as_deref(), Some(key));
    }
}
