//! Sharded concurrent hash maps backing the catalog and the agent registry.
//!
//! Each shard is a `RwLock<HashMap<K, V>>` padded to 128 bytes so adjacent
//! shards never share a cache line. Key hashing picks the shard, so
//! operations on unrelated metric keys or agent serials never touch the same
//! lock. The shard write lock is the per-key critical section used for
//! check-then-create interning.
//!
//! [`ShardedMap`] takes arbitrary hashable keys (metric keys, agent keys).
//! [`IdMap`] is specialised for the `i64` ids and serials the core hands out
//! sequentially, using a splitmix64 finalizer for an even spread.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

/// Default number of shards. Power of 2 for fast modulo.
pub const DEFAULT_SHARDS: usize = 64;

// ---------------------------------------------------------------------------
// Shard key hashing
// ---------------------------------------------------------------------------

/// splitmix64 finalizer; sequential ids land in different shards.
#[inline]
fn mix_id(id: i64) -> usize {
    let mut h = id as u64;
    h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^= h >> 31;
    h as usize
}

#[inline]
fn hash_key<K: Hash>(key: &K, shard_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

// ---------------------------------------------------------------------------
// Padded shard
// ---------------------------------------------------------------------------

#[repr(align(128))]
struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<K, V>> {
        self.map.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<K, V>> {
        self.map.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn build_shards<K, V>(n: usize) -> Box<[Shard<K, V>]> {
    let n = n.clamp(1, 256);
    (0..n).map(|_| Shard::new()).collect::<Vec<_>>().into_boxed_slice()
}

// ---------------------------------------------------------------------------
// ShardedMap
// ---------------------------------------------------------------------------

/// A sharded concurrent hash map.
///
/// Thread-safe without external locking. Operations on keys in different
/// shards are fully concurrent.
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
}

impl<K, V> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shard_count", &self.shards.len())
            .finish()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a new sharded map with the default shard count (64).
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create with a specific shard count, clamped to `[1, 256]`.
    #[must_use]
    pub fn with_shards(n: usize) -> Self {
        Self {
            shards: build_shards(n),
        }
    }

    #[inline]
    fn shard(&self, key: &K) -> &Shard<K, V> {
        &self.shards[hash_key(key, self.shards.len())]
    }

    /// Insert or update a key-value pair. Returns the old value if any.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    /// Get a clone of the value for a key.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard(key).read().get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    /// Apply a function to a value under the shard read lock.
    pub fn read_with<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        self.shard(key).read().get(key).map(f)
    }

    /// Apply a mutating function to a value under the shard write lock.
    pub fn write_with<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        self.shard(key).write().get_mut(key).map(f)
    }

    /// Double-checked get-or-create.
    ///
    /// A read-locked lookup runs first. On a miss the shard write lock is
    /// taken, the lookup is repeated, and only if the key is still absent is
    /// `create` called and its value installed. Concurrent callers for the
    /// same key therefore observe exactly one created value. If `create`
    /// fails nothing is installed.
    ///
    /// Returns the value and whether this call created it.
    pub fn try_get_or_insert_with<F, E>(&self, key: &K, create: F) -> Result<(V, bool), E>
    where
        V: Clone,
        F: FnOnce() -> Result<V, E>,
    {
        let shard = self.shard(key);
        if let Some(existing) = shard.read().get(key) {
            return Ok((existing.clone(), false));
        }
        let mut guard = shard.write();
        if let Some(existing) = guard.get(key) {
            return Ok((existing.clone(), false));
        }
        let value = create()?;
        guard.insert(key.clone(), value.clone());
        Ok((value, true))
    }

    /// Infallible variant of [`Self::try_get_or_insert_with`].
    pub fn get_or_insert_with<F>(&self, key: &K, create: F) -> (V, bool)
    where
        V: Clone,
        F: FnOnce() -> V,
    {
        match self.try_get_or_insert_with::<_, std::convert::Infallible>(key, || Ok(create())) {
            Ok(pair) => pair,
            Err(never) => match never {},
        }
    }

    /// Create the entry if needed, then mutate it, all under one shard
    /// write lock.
    pub fn upsert_with<C, F, R>(&self, key: &K, create: C, update: F) -> R
    where
        C: FnOnce() -> V,
        F: FnOnce(&mut V) -> R,
    {
        let mut guard = self.shard(key).write();
        let value = guard.entry(key.clone()).or_insert_with(create);
        update(value)
    }

    /// Total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Collect all values (snapshot, shard by shard).
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let mut result = Vec::new();
        for shard in &*self.shards {
            result.extend(shard.read().values().cloned());
        }
        result
    }

    /// Retain only entries satisfying a predicate.
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for shard in &*self.shards {
            shard.write().retain(|k, v| f(k, v));
        }
    }
}

impl<K: Hash + Eq + Clone, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// IdMap: i64-keyed variant for metric ids and agent serials
// ---------------------------------------------------------------------------

/// A sharded map keyed by sequentially assigned `i64` ids.
pub struct IdMap<V> {
    shards: Box<[Shard<i64, V>]>,
}

impl<V> std::fmt::Debug for IdMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdMap")
            .field("shard_count", &self.shards.len())
            .finish()
    }
}

impl<V> IdMap<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    #[must_use]
    pub fn with_shards(n: usize) -> Self {
        Self {
            shards: build_shards(n),
        }
    }

    #[inline]
    fn shard(&self, id: i64) -> &Shard<i64, V> {
        &self.shards[mix_id(id) % self.shards.len()]
    }

    pub fn insert(&self, id: i64, value: V) -> Option<V> {
        self.shard(id).write().insert(id, value)
    }

    pub fn get(&self, id: i64) -> Option<V>
    where
        V: Clone,
    {
        self.shard(id).read().get(&id).cloned()
    }

    pub fn remove(&self, id: i64) -> Option<V> {
        self.shard(id).write().remove(&id)
    }

    pub fn read_with<F, R>(&self, id: i64, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        self.shard(id).read().get(&id).map(f)
    }

    pub fn write_with<F, R>(&self, id: i64, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        self.shard(id).write().get_mut(&id).map(f)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// All ids currently present.
    pub fn ids(&self) -> Vec<i64> {
        let mut result = Vec::new();
        for shard in &*self.shards {
            result.extend(shard.read().keys());
        }
        result
    }

}

impl<V> Default for IdMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
