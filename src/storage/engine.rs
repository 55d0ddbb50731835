//! Sharded TTL Store
//!
//! A partitioned in-memory map guarded by one read-write lock per shard.
//! Keys route to a shard by a 64-bit non-cryptographic hash, so unrelated
//! keys rarely contend on the same lock.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                       Store                         │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐              │
//! │  │ Shard 0 │  │ Shard 1 │  │ Shard N │   xxh3 % N   │
//! │  │ RwLock  │  │ RwLock  │  │ RwLock  │              │
//! │  │ HashMap │  │ HashMap │  │ HashMap │              │
//! │  └─────────┘  └─────────┘  └─────────┘              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Value opacity
//!
//! Stored values are the raw encoded payload of the original request, never
//! re-decoded. `get` hands back a [`Bytes`] handle to that immutable payload,
//! so callers cannot touch shard-owned memory and the hot path stays
//! allocation-light.
//!
//! ## Expiry
//!
//! Every entry carries an absolute deadline (`None` meaning never). Expiry is
//! observed in two ways: lazily on read, where an expired entry reports
//! not-found and its key is queued for a best-effort background remove, and
//! actively by the periodic sweeper (see [`super::sweeper`]). The queued
//! remove re-checks the deadline under the write lock, so a concurrent `set`
//! that recreated the key is never erased.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// Shard count used when the caller passes zero.
pub const DEFAULT_SHARD_COUNT: usize = 3;

/// Depth of the lazy-remove queue. Once full, further lazy removes are
/// dropped; the periodic sweep catches whatever the queue missed.
const PURGE_QUEUE_DEPTH: usize = 1024;

/// Errors surfaced by store operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The key is absent, or present but past its deadline.
    #[error("not found")]
    NotFound,

    /// The requested store kind has no implementation.
    #[error("invalid store kind")]
    InvalidKind,
}

/// One cached item: the raw encoded payload and its expiry deadline.
#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    deadline: Option<Instant>,
}

impl Entry {
    fn new(value: Bytes, ttl: Duration) -> Self {
        let deadline = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        Self { value, deadline }
    }

    #[inline]
    fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() > d).unwrap_or(false)
    }
}

/// One partition of the key space.
#[derive(Debug)]
struct Shard {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

/// The sharded in-memory TTL store.
///
/// Designed to be wrapped in an `Arc` and shared across all connection
/// tasks; every operation is thread-safe.
#[derive(Debug)]
pub struct Store {
    shards: Vec<Shard>,
    purge_tx: mpsc::Sender<String>,
    purge_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Store {
    /// Creates a store with `shard_count` shards (zero selects the default).
    pub fn new(shard_count: usize) -> Self {
        let shard_count = if shard_count == 0 {
            DEFAULT_SHARD_COUNT
        } else {
            shard_count
        };
        let (purge_tx, purge_rx) = mpsc::channel(PURGE_QUEUE_DEPTH);

        Self {
            shards: (0..shard_count).map(|_| Shard::new()).collect(),
            purge_tx,
            purge_rx: Mutex::new(Some(purge_rx)),
        }
    }

    /// Number of shards the key space is partitioned into.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// A key routes to the same shard for the lifetime of the store.
    #[inline]
    fn shard(&self, key: &str) -> &Shard {
        let idx = xxh3_64(key.as_bytes()) % self.shards.len() as u64;
        &self.shards[idx as usize]
    }

    /// Looks up the raw payload stored under `key`.
    ///
    /// An entry past its deadline reports [`StoreError::NotFound`] and is
    /// queued for a background remove; the read lock is released before the
    /// queueing happens.
    pub fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let shard = self.shard(key);
        {
            let entries = shard.entries.read().unwrap();
            match entries.get(key) {
                None => return Err(StoreError::NotFound),
                Some(e) if !e.is_expired() => return Ok(e.value.clone()),
                Some(_) => {}
            }
        }

        // Expired. Hand the key to the sweeper; dropping it on a full queue
        // is fine since the periodic sweep will get there eventually.
        if self.purge_tx.try_send(key.to_owned()).is_err() {
            debug!(key, "purge queue full, leaving expired entry to the sweep");
        }
        Err(StoreError::NotFound)
    }

    /// Stores `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        let shard = self.shard(key);
        let mut entries = shard.entries.write().unwrap();
        entries.insert(key.to_owned(), Entry::new(value, ttl));
    }

    /// Replaces the value and deadline of an existing entry.
    ///
    /// An absent key is not created; an entry that already passed its
    /// deadline counts as absent and is dropped on the spot.
    pub fn update(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let shard = self.shard(key);
        let mut entries = shard.entries.write().unwrap();
        match entries.get_mut(key) {
            Some(e) if !e.is_expired() => {
                *e = Entry::new(value, ttl);
                Ok(())
            }
            Some(_) => {
                entries.remove(key);
                Err(StoreError::NotFound)
            }
            None => Err(StoreError::NotFound),
        }
    }

    /// Removes the entry under `key`.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let shard = self.shard(key);
        let mut entries = shard.entries.write().unwrap();
        entries.remove(key).map(|_| ()).ok_or(StoreError::NotFound)
    }

    /// All keys currently known, shard by shard.
    ///
    /// Keys whose entries have expired but were not yet swept may still
    /// appear; there is no cross-shard snapshot.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            let entries = shard.entries.read().unwrap();
            keys.extend(entries.keys().cloned());
        }
        keys
    }

    /// Number of entries across all shards, expired ones included.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.entries.read().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes `key` only if its entry is (still) expired.
    ///
    /// The deadline is re-checked under the write lock, so an entry that was
    /// recreated after the lazy-expiry observation survives.
    pub(crate) fn remove_if_expired(&self, key: &str) -> bool {
        let shard = self.shard(key);
        let mut entries = shard.entries.write().unwrap();
        match entries.get(key) {
            Some(e) if e.is_expired() => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Deletes every expired entry, one shard write lock at a time.
    ///
    /// Returns how many entries were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut entries = shard.entries.write().unwrap();
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired());
            removed += before - entries.len();
        }
        removed
    }

    /// Hands the lazy-remove queue to the sweeper. Only the first caller
    /// gets it.
    pub(crate) fn take_purge_queue(&self) -> Option<mpsc::Receiver<String>> {
        self.purge_rx.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn payload(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn set_and_get() {
        let store = Store::new(0);
        store.set("key", payload("$\"value\""), Duration::ZERO);
        assert_eq!(store.get("key").unwrap(), payload("$\"value\""));
    }

    #[test]
    fn get_missing() {
        let store = Store::new(4);
        assert_eq!(store.get("nope"), Err(StoreError::NotFound));
    }

    #[test]
    fn set_replaces() {
        let store = Store::new(4);
        store.set("key", payload("$\"a\""), Duration::ZERO);
        store.set("key", payload("$\"b\""), Duration::ZERO);
        assert_eq!(store.get("key").unwrap(), payload("$\"b\""));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_twice() {
        let store = Store::new(4);
        store.set("key", payload("*"), Duration::ZERO);
        assert!(store.remove("key").is_ok());
        assert_eq!(store.get("key"), Err(StoreError::NotFound));
        assert_eq!(store.remove("key"), Err(StoreError::NotFound));
    }

    #[test]
    fn update_semantics() {
        let store = Store::new(4);

        // Absent key is not created.
        assert_eq!(
            store.update("key", payload("$\"v\""), Duration::ZERO),
            Err(StoreError::NotFound)
        );
        assert_eq!(store.get("key"), Err(StoreError::NotFound));

        store.set("key", payload("$\"old\""), Duration::ZERO);
        store
            .update("key", payload("$\"new\""), Duration::ZERO)
            .unwrap();
        assert_eq!(store.get("key").unwrap(), payload("$\"new\""));
    }

    #[test]
    fn update_on_expired_entry_is_not_found() {
        let store = Store::new(4);
        store.set("key", payload("$\"v\""), Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(
            store.update("key", payload("$\"w\""), Duration::ZERO),
            Err(StoreError::NotFound)
        );
        // The expired entry was dropped under the same lock.
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn zero_ttl_never_expires() {
        let store = Store::new(4);
        store.set("key", payload("$\"v\""), Duration::ZERO);
        thread::sleep(Duration::from_millis(30));
        assert!(store.get("key").is_ok());
    }

    #[test]
    fn expired_entry_reports_not_found() {
        let store = Store::new(4);
        store.set("key", payload("$\"v\""), Duration::from_millis(10));
        assert!(store.get("key").is_ok());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(store.get("key"), Err(StoreError::NotFound));
    }

    #[test]
    fn lazy_expiry_queues_the_key() {
        let store = Store::new(4);
        store.set("key", payload("$\"v\""), Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("key"), Err(StoreError::NotFound));

        let mut rx = store.take_purge_queue().unwrap();
        assert_eq!(rx.try_recv().unwrap(), "key");
    }

    #[test]
    fn queued_remove_spares_a_recreated_key() {
        let store = Store::new(4);
        store.set("key", payload("$\"old\""), Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("key"), Err(StoreError::NotFound));

        // A writer recreates the key before the queued remove runs.
        store.set("key", payload("$\"fresh\""), Duration::ZERO);
        assert!(!store.remove_if_expired("key"));
        assert_eq!(store.get("key").unwrap(), payload("$\"fresh\""));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = Store::new(4);
        store.set("a", payload("$\"1\""), Duration::from_millis(5));
        store.set("b", payload("$\"2\""), Duration::from_millis(5));
        store.set("c", payload("$\"3\""), Duration::ZERO);
        thread::sleep(Duration::from_millis(20));

        assert_eq!(store.sweep(), 2);
        assert_eq!(store.len(), 1);
        assert!(!store.is_empty());
        assert!(store.get("c").is_ok());
    }

    #[test]
    fn keys_lists_all_shards() {
        let store = Store::new(4);
        store.set("a", payload("*"), Duration::ZERO);
        store.set("b", payload("*"), Duration::ZERO);
        store.set("c", payload("*"), Duration::ZERO);

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn routing_is_stable() {
        let store = Store::new(32);
        for i in 0..100 {
            let key = format!("key-{}", i);
            store.set(&key, payload("*"), Duration::ZERO);
            assert!(store.get(&key).is_ok());
        }
        assert_eq!(store.len(), 100);
    }

    #[test]
    fn concurrent_writers_land_every_key() {
        let store = Arc::new(Store::new(8));
        let mut handles = vec![];

        for w in 0..10 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("key-{}-{}", w, i);
                    store.set(&key, payload(&format!("$\"{}\"", i)), Duration::ZERO);
                    assert!(store.get(&key).is_ok());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.keys().len(), 1000);
    }

    #[test]
    fn contended_key_reads_are_never_torn() {
        let store = Arc::new(Store::new(1));
        store.set("k", payload("$\"aaaa\""), Duration::ZERO);

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..1000 {
                    store.set("k", payload("$\"bbbb\""), Duration::ZERO);
                }
            })
        };

        for _ in 0..1000 {
            let v = store.get("k").unwrap();
            assert!(v == payload("$\"aaaa\"") || v == payload("$\"bbbb\""));
        }
        writer.join().unwrap();
    }

    #[test]
    fn purge_queue_taken_once() {
        let store = Store::new(4);
        assert!(store.take_purge_queue().is_some());
        assert!(store.take_purge_queue().is_none());
    }
}
