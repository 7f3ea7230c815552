//! Keyed table of independently lockable entries.
//!
//! The outer `RwLock` guards only membership; each entry carries its own
//! `Mutex`, so two different sessions (or records) can be mutated at the
//! same time without contending. Closed entries move to a bounded archive
//! that stays queryable and is drained separately for persistence.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use super::{lock, read, write};

/// Default number of closed entries kept queryable.
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 256;

/// Concurrent table of open entries plus an archive of closed ones.
#[derive(Debug)]
pub struct SessionTable<T> {
    open: RwLock<HashMap<String, Arc<Mutex<T>>>>,
    closed: Mutex<VecDeque<(String, T)>>,
    unpersisted: Mutex<Vec<T>>,
    archive_capacity: usize,
}

impl<T: Clone> SessionTable<T> {
    /// Empty table with the default archive capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ARCHIVE_CAPACITY)
    }

    /// Empty table keeping at most `archive_capacity` closed entries.
    pub fn with_capacity(archive_capacity: usize) -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: Mutex::new(VecDeque::new()),
            unpersisted: Mutex::new(Vec::new()),
            archive_capacity: archive_capacity.max(1),
        }
    }

    /// Insert an open entry, returning its handle.
    pub fn insert(&self, id: impl Into<String>, value: T) -> Arc<Mutex<T>> {
        let handle = Arc::new(Mutex::new(value));
        write(&self.open).insert(id.into(), Arc::clone(&handle));
        handle
    }

    /// Handle to an open entry.
    pub fn get(&self, id: &str) -> Option<Arc<Mutex<T>>> {
        read(&self.open).get(id).cloned()
    }

    /// Whether an open entry exists.
    pub fn contains(&self, id: &str) -> bool {
        read(&self.open).contains_key(id)
    }

    /// Run `f` against an open entry under its own lock.
    pub fn with<R>(&self, id: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let handle = self.get(id)?;
        let mut guard = lock(&handle);
        Some(f(&mut guard))
    }

    /// Snapshot of an open or archived entry.
    pub fn lookup(&self, id: &str) -> Option<T> {
        if let Some(handle) = self.get(id) {
            return Some(lock(&handle).clone());
        }
        lock(&self.closed)
            .iter()
            .rev()
            .find(|(closed_id, _)| closed_id == id)
            .map(|(_, value)| value.clone())
    }

    /// Ids of open entries, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.open).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of every open entry, ordered by id.
    pub fn snapshot(&self) -> Vec<T> {
        let handles: Vec<(String, Arc<Mutex<T>>)> = {
            let open = read(&self.open);
            let mut entries: Vec<_> = open
                .iter()
                .map(|(id, h)| (id.clone(), Arc::clone(h)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };
        handles.iter().map(|(_, h)| lock(h).clone()).collect()
    }

    /// Number of open entries.
    pub fn len(&self) -> usize {
        read(&self.open).len()
    }

    /// Whether no entries are open.
    pub fn is_empty(&self) -> bool {
        read(&self.open).is_empty()
    }

    /// Move an open entry into the archive.
    ///
    /// Returns the archived snapshot, or `None` if the id is not open.
    pub fn archive(&self, id: &str) -> Option<T> {
        let handle = write(&self.open).remove(id)?;
        let value = lock(&handle).clone();

        let mut closed = lock(&self.closed);
        closed.push_back((id.to_string(), value.clone()));
        while closed.len() > self.archive_capacity {
            closed.pop_front();
        }
        drop(closed);

        lock(&self.unpersisted).push(value.clone());
        Some(value)
    }

    /// Archived entries, oldest first.
    pub fn archived(&self) -> Vec<T> {
        lock(&self.closed).iter().map(|(_, v)| v.clone()).collect()
    }

    /// Drain entries archived since the last drain.
    pub fn drain_unpersisted(&self) -> Vec<T> {
        std::mem::take(&mut *lock(&self.unpersisted))
    }

    /// Hand back archived entries whose write failed.
    pub fn requeue_unpersisted(&self, values: Vec<T>) {
        lock(&self.unpersisted).extend(values);
    }
}

impl<T: Clone> Default for SessionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
