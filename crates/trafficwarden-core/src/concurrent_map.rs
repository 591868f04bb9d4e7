//! Lock-sharded hash map behind the in-process key/value store and the
//! metric buckets.
//!
//! Cache reads, rate-limit increments and latency updates arrive on every
//! request. Splitting the table into independently locked shards keeps two
//! requests for different keys off each other's lock, while every
//! read-modify-write on one key ([`ShardedMap::upsert`]) is still serialized
//! by its shard's write lock.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, RandomState};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const SHARDS: usize = 64;

/// Padded so neighbouring shard locks never share a cache line.
#[repr(align(128))]
#[derive(Default)]
struct Shard<K, V>(RwLock<HashMap<K, V>>);

/// Concurrent map split across [`SHARDS`] independently locked tables.
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    hasher: RandomState,
}

impl<K, V> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl<K, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Shard(RwLock::default())).collect(),
            hasher: RandomState::new(),
        }
    }
}

impl<K: Hash + Eq + Clone, V> ShardedMap<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn index<Q: Hash + ?Sized>(&self, key: &Q) -> usize {
        (self.hasher.hash_one(key) as usize) % self.shards.len()
    }

    fn read<Q: Hash + ?Sized>(&self, key: &Q) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.shards[self.index(key)]
            .0
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn write<Q: Hash + ?Sized>(&self, key: &Q) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.shards[self.index(key)]
            .0
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Every shard in turn, under its write lock.
    fn each_mut(&self) -> impl Iterator<Item = RwLockWriteGuard<'_, HashMap<K, V>>> {
        self.shards
            .iter()
            .map(|s| s.0.write().unwrap_or_else(|e| e.into_inner()))
    }

    /// Every shard in turn, under its read lock.
    fn each(&self) -> impl Iterator<Item = RwLockReadGuard<'_, HashMap<K, V>>> {
        self.shards
            .iter()
            .map(|s| s.0.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Returns the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.write(&key).insert(key, value)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.read(key).get(key).cloned()
    }

    /// Inspect a value without cloning it.
    pub fn read_with<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.read(key).get(key).map(f)
    }

    /// Read-modify-write of one slot under the shard's write lock.
    ///
    /// `f` sees the current value (or `None`); whatever it leaves in the slot
    /// is stored, and leaving `None` removes the key.
    pub fn upsert<R>(&self, key: K, f: impl FnOnce(&mut Option<V>) -> R) -> R {
        let mut shard = self.write(&key);
        let mut slot = shard.remove(&key);
        let result = f(&mut slot);
        if let Some(value) = slot {
            shard.insert(key, value);
        }
        result
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.write(key).remove(key)
    }

    pub fn len(&self) -> usize {
        self.each().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.each().all(|s| s.is_empty())
    }

    /// Snapshot of the keys whose entries match `f`.
    pub fn keys_where(&self, mut f: impl FnMut(&K, &V) -> bool) -> Vec<K> {
        self.each()
            .flat_map(|s| {
                s.iter()
                    .filter(|(k, v)| f(k, v))
                    .map(|(k, _)| k.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Snapshot of every value.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.each()
            .flat_map(|s| s.values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Keep entries matching `f`; returns how many were dropped.
    pub fn retain(&self, mut f: impl FnMut(&K, &V) -> bool) -> usize {
        self.each_mut()
            .map(|mut s| {
                let before = s.len();
                s.retain(|k, v| f(k, v));
                before - s.len()
            })
            .sum()
    }

    pub fn clear(&self) {
        for mut shard in self.each_mut() {
            shard.clear();
        }
    }
}
