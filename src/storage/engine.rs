//! In-memory storage engine: KV map, per-key lock table, pause flag.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-node storage state.
///
/// The KV map is sharded and safe for concurrent single-key access. The
/// lock table sits behind its own mutex because a batched write must
/// acquire every lock atomically: either all keys in the batch are
/// locked, or none are. The pause flag is an admission-control bit
/// toggled only by manager RPCs.
pub struct KvEngine {
    store: DashMap<String, String>,
    locks: Mutex<HashMap<String, String>>,
    paused: AtomicBool,
}

impl KvEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            store: DashMap::new(),
            locks: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
        }
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key).map(|v| v.clone())
    }

    /// Insert or overwrite a key.
    pub fn put(&self, key: &str, value: &str) {
        self.store.insert(key.to_string(), value.to_string());
    }

    /// Remove a key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.store.remove(key).is_some()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Snapshot of every stored key.
    pub fn keys_snapshot(&self) -> Vec<String> {
        self.store.iter().map(|e| e.key().clone()).collect()
    }

    /// Atomically acquire write locks on every key in the batch.
    ///
    /// On conflict, nothing is acquired and the already-locked key is
    /// returned.
    pub fn try_lock_all(&self, keys: &[String], holder: &str) -> Result<(), String> {
        let mut locks = self.locks.lock();
        if let Some(conflict) = keys.iter().find(|k| locks.contains_key(*k)) {
            return Err(conflict.clone());
        }
        for key in keys {
            locks.insert(key.clone(), holder.to_string());
        }
        Ok(())
    }

    /// Release the locks acquired by [`try_lock_all`](Self::try_lock_all).
    pub fn unlock_all(&self, keys: &[String]) {
        let mut locks = self.locks.lock();
        for key in keys {
            locks.remove(key);
        }
    }

    /// Whether no primary write is in flight.
    pub fn is_quiescent(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Reject client-facing traffic until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Accept client-facing traffic again.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether the node is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl Default for KvEngine {
    fn default() -> Self {
        Self::new()
    }
}
