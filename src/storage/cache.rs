// Bounded, thread-safe LRU cache
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Detached copy of one cache entry, as produced by [`RecencyCache::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair<K, V> {
    pub key: K,
    pub value: V,
}

/// LRU cache with a fixed capacity, safe to share between threads.
///
/// Entries are kept in recency order: the front is the most recently used
/// entry and the back is the next eviction candidate. `get` and `add`
/// promote, `contains`, `keys` and `snapshot` never do.
pub struct RecencyCache<K, V> {
    inner: RwLock<Inner<K, V>>,
}

struct Inner<K, V> {
    capacity: usize,
    // Unbounded on purpose; `capacity` is enforced here so a restored
    // capacity never preallocates.
    entries: LruCache<K, V>,
}

impl<K: Hash + Eq, V> Inner<K, V> {
    fn enforce_capacity(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            if self.entries.pop_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }
}

impl<K: Hash + Eq, V> RecencyCache<K, V> {
    /// Create an empty cache. A cache with one slot is useless, so
    /// `capacity` must be at least 2.
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity <= 1 {
            return Err(CacheError::InvalidCapacity(capacity));
        }

        Ok(Self {
            inner: RwLock::new(Inner {
                capacity,
                entries: LruCache::unbounded(),
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<K, V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K, V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or update `key` and make it the most recently used entry.
    ///
    /// Returns `true` when inserting a new key pushed the least recently
    /// used entry out. Updating an existing key never evicts.
    pub fn add(&self, key: K, value: V) -> bool {
        let mut inner = self.write();

        if let Some(slot) = inner.entries.get_mut(&key) {
            *slot = value;
            return false;
        }

        inner.entries.put(key, value);
        inner.enforce_capacity() > 0
    }

    /// Remove `key`. Other entries keep their relative order.
    pub fn remove(&self, key: &K) -> bool {
        self.write().entries.pop(key).is_some()
    }

    /// Membership test without touching recency.
    pub fn contains(&self, key: &K) -> bool {
        self.read().entries.contains(key)
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.read().entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.read().capacity
    }

    /// Drop every entry; the capacity is kept.
    pub fn purge(&self) {
        self.write().entries.clear();
    }

    /// Point-in-time copy of the capacity and all entries, most recently
    /// used first. The copy is taken under the shared lock and owns its data.
    pub fn snapshot(&self) -> (usize, Vec<Pair<K, V>>)
    where
        K: Clone,
        V: Clone,
    {
        let inner = self.read();
        let pairs = inner
            .entries
            .iter()
            .map(|(k, v)| Pair {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        (inner.capacity, pairs)
    }

    /// Swap in a new capacity and entry set in one step.
    ///
    /// `pairs` are most recently used first. The set is built before the
    /// lock is taken and trimmed from the tail if it exceeds `capacity`.
    /// Returns how many entries were trimmed.
    pub(crate) fn replace(&self, capacity: usize, pairs: Vec<Pair<K, V>>) -> usize {
        let mut rebuilt = Inner {
            capacity,
            entries: LruCache::unbounded(),
        };
        // Insert least recent first so the head of `pairs` ends up in front.
        for pair in pairs.into_iter().rev() {
            rebuilt.entries.put(pair.key, pair.value);
        }
        let trimmed = rebuilt.enforce_capacity();

        *self.write() = rebuilt;
        trimmed
    }
}

impl<K: Hash + Eq, V: Clone> RecencyCache<K, V> {
    /// Look up `key` and promote it to most recently used on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        self.write().entries.get(key).cloned()
    }
}

impl<K, V> std::fmt::Debug for RecencyCache<K, V>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("RecencyCache")
            .field("capacity", &inner.capacity)
            .field("len", &inner.entries.len())
            .finish()
    }
}
