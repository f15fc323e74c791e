//! Sharded Key-Value Store
//!
//! The keyspace is split into a fixed number of partitions, each a plain
//! `HashMap` behind its own exclusive lock. A key always maps to the same
//! partition, so one partition lock is enough to make single-key operations
//! linearizable. There are no multi-key transactions: multi-key commands are
//! a sequence of independent single-key operations.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ShardedStore                        │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐       ┌─────────┐   │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │  ...  │ Shard 9 │   │
//! │  │ Mutex   │ │ Mutex   │ │ Mutex   │       │ Mutex   │   │
//! │  │ HashMap │ │ HashMap │ │ HashMap │       │ HashMap │   │
//! │  └─────────┘ └─────────┘ └─────────┘       └─────────┘   │
//! └──────────────────────────────────────────────────────────┘
//!          shard_index(key) = hash(key) % shard_count
//! ```
//!
//! Shard locks sit at [`LockLevel::Shard`], the bottom of the hierarchy, and
//! no method ever holds two of them at once.

use crate::sync::{LockLevel, OrderedMutex};
use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of partitions.
pub const DEFAULT_SHARDS: usize = 10;

#[derive(Debug)]
struct Shard {
    data: OrderedMutex<HashMap<Bytes, Bytes>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            data: OrderedMutex::new(LockLevel::Shard, HashMap::new()),
        }
    }
}

/// Operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
}

/// The in-memory key-value store shared by every Parse-and-Run job.
///
/// # Example
///
/// ```
/// use pipekv::storage::ShardedStore;
/// use bytes::Bytes;
///
/// let store = ShardedStore::new();
/// store.set(Bytes::from("foo"), Bytes::from("bar"));
/// assert_eq!(store.get(b"foo"), Some(Bytes::from("bar")));
/// assert!(store.del(b"foo"));
/// assert!(!store.del(b"foo"));
/// ```
pub struct ShardedStore {
    shards: Box<[Shard]>,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("shards", &self.shards.len())
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .field("del_count", &self.del_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ShardedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedStore {
    /// Creates a store with [`DEFAULT_SHARDS`] partitions.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Creates a store with `count` partitions.
    ///
    /// # Panics
    ///
    /// If `count` is zero.
    pub fn with_shards(count: usize) -> Self {
        assert!(count > 0, "a store needs at least one shard");

        Self {
            shards: (0..count).map(|_| Shard::new()).collect(),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the partition that owns `key`.
    ///
    /// `DefaultHasher::new()` uses fixed keys, so the mapping never changes
    /// for the lifetime of the process.
    #[inline]
    pub fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Looks up `key`. `None` is the not-found marker.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let data = self.shard(key).data.lock();
        data.get(key).cloned()
    }

    /// Inserts or overwrites `key`.
    ///
    /// Returns `true` if the key did not exist before.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shard(&key).data.lock();
        data.insert(key, value).is_none()
    }

    /// Removes `key`, reporting whether it was present.
    pub fn del(&self, key: &[u8]) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shard(key).data.lock();
        data.remove(key).is_some()
    }

    /// Removes each key in turn and returns how many were present.
    ///
    /// Each removal takes only its own shard lock; the batch is not atomic.
    pub fn delete_many(&self, keys: &[Bytes]) -> u64 {
        keys.iter().filter(|key| self.del(key)).count() as u64
    }

    /// Number of keys in one partition.
    pub fn shard_len(&self, index: usize) -> usize {
        self.shards[index].data.lock().len()
    }

    /// Total number of keys, summed one shard at a time.
    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|i| self.shard_len(i)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.len() as u64,
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_and_get() {
        let store = ShardedStore::new();
        assert!(store.set(Bytes::from("foo"), Bytes::from("bar")));
        assert_eq!(store.get(b"foo"), Some(Bytes::from("bar")));

        // Overwrite
        assert!(!store.set(Bytes::from("foo"), Bytes::from("baz")));
        assert_eq!(store.get(b"foo"), Some(Bytes::from("baz")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let store = ShardedStore::new();
        assert_eq!(store.get(b"nope"), None);
    }

    #[test]
    fn test_del_is_idempotent() {
        let store = ShardedStore::new();
        store.set(Bytes::from("foo"), Bytes::from("bar"));
        store.set(Bytes::from("other"), Bytes::from("x"));

        assert!(!store.del(b"absent"));
        assert_eq!(store.len(), 2);

        assert!(store.del(b"foo"));
        assert!(!store.del(b"foo"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_many() {
        let store = ShardedStore::new();
        store.set(Bytes::from("k1"), Bytes::from("v1"));
        store.set(Bytes::from("k2"), Bytes::from("v2"));

        let keys = [Bytes::from("k1"), Bytes::from("k2"), Bytes::from("k3")];
        assert_eq!(store.delete_many(&keys), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_shard_index_is_stable_and_in_range() {
        let store = ShardedStore::with_shards(7);
        for i in 0..1000 {
            let key = format!("key:{}", i);
            let index = store.shard_index(key.as_bytes());
            assert!(index < 7);
            assert_eq!(index, store.shard_index(key.as_bytes()));
        }
    }

    #[test]
    fn test_keys_spread_over_shards() {
        let store = ShardedStore::new();
        for i in 0..1000 {
            store.set(Bytes::from(format!("key:{}", i)), Bytes::from("v"));
        }

        assert_eq!(store.len(), 1000);
        for shard in 0..store.shard_count() {
            assert!(store.shard_len(shard) > 0, "shard {} is empty", shard);
        }
    }

    #[test]
    fn test_same_shard_program_order() {
        let store = ShardedStore::with_shards(2);
        let first = b"alpha".to_vec();
        let target = store.shard_index(&first);
        let second = (0..)
            .map(|i| format!("beta:{}", i).into_bytes())
            .find(|k| store.shard_index(k) == target)
            .unwrap();

        store.set(Bytes::from(first.clone()), Bytes::from("1"));
        store.set(Bytes::from(second.clone()), Bytes::from("2"));
        assert!(store.del(&first));
        assert_eq!(store.get(&second), Some(Bytes::from("2")));
        assert_eq!(store.get(&first), None);
    }

    #[test]
    fn test_concurrent_access() {
        let store = Arc::new(ShardedStore::new());
        let mut handles = vec![];

        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    let key = Bytes::from(format!("key-{}-{}", i, j));
                    store.set(key.clone(), Bytes::from("value"));
                    assert_eq!(store.get(&key), Some(Bytes::from("value")));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 1000);
        let stats = store.stats();
        assert_eq!(stats.set_ops, 1000);
        assert_eq!(stats.get_ops, 1000);
    }

    #[test]
    fn test_concurrent_writers_same_key() {
        let store = Arc::new(ShardedStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..200 {
                        store.set(Bytes::from("shared"), Bytes::from(format!("w{}", i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let value = store.get(b"shared").unwrap();
        assert!(value.starts_with(b"w"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    #[should_panic(expected = "at least one shard")]
    fn test_zero_shards_rejected() {
        let _ = ShardedStore::with_shards(0);
    }
}
