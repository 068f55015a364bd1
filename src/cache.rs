//! The sharded block cache façade.
//!
//! ## Architecture
//!
//! ```text
//!   ┌─────────────────────────────────────────────────────────────────────┐
//!   │                          BlockCache<V>                              │
//!   │                                                                     │
//!   │   request(key, hash) ── shard = hash & (2^S − 1) ──┐                │
//!   │                                                    ▼                │
//!   │   ┌──────────┬──────────┬──────────┬──────────┬─────────┐           │
//!   │   │ Shard 0  │ Shard 1  │ Shard 2  │   ...    │ Shard N │  aligned  │
//!   │   │ mutex    │ mutex    │ mutex    │          │ mutex   │  64-byte  │
//!   │   │ hot idx  │ hot idx  │ hot idx  │          │ hot idx │  slots    │
//!   │   └──────────┴──────────┴──────────┴──────────┴─────────┘           │
//!   │        │                                                            │
//!   │        └── shared: thread registry, hitrate board, secondary tier   │
//!   └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every public operation is a thin dispatch on the low bits of the caller
//! supplied 32-bit hash; shards are fully independent (no cross-shard
//! ordering). Each shard holds `ceil(capacity / 2^S)` bytes.
//!
//! ## Key Components
//!
//! | Component        | Description                                        |
//! |------------------|----------------------------------------------------|
//! | `BlockCache<V>`  | Sharded façade holding the per-shard sub-caches    |
//! | `EntryHandle`    | Pinned entry reference, released explicitly        |
//! | `InsertStatus`   | Whether an insert displaced a prior entry          |
//! | `hash_key`       | Helper deriving the 32-bit routing hash            |
//!
//! ## Handle discipline
//!
//! `lookup`/`insert_pinned` pin an entry and hand back an [`EntryHandle`];
//! the value stays readable until the handle is passed to [`release`]
//! (`release` runs the value's drop outside all shard locks once the last
//! reference is gone). Handles borrow the cache, so they cannot outlive it,
//! and they are not `Clone` — additional pins go through [`add_ref`].
//!
//! [`release`]: BlockCache::release
//! [`add_ref`]: BlockCache::add_ref

use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHasher;

use crate::entry::{EntryHandle, Priority};
use crate::error::{CacheFull, ConfigError};
use crate::metrics::CacheMetricsSnapshot;
use crate::secondary::{SecondaryCache, SecondaryResult};
use crate::shard::CacheShard;
use crate::tid::ThreadRegistry;

/// Outcome of a successful insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// The key was not cached before.
    Inserted,
    /// A prior entry at the same key was displaced.
    Overwritten,
}

/// Derives the 32-bit hash the cache routes and indexes by.
///
/// Any hash with uniform high and low bits works; the cache never rehashes
/// a key itself, so callers that already carry a block hash can pass it
/// directly.
pub fn hash_key(key: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// Sharded in-memory block cache with an adaptive per-shard hot index.
///
/// Construct through [`CacheBuilder`](crate::builder::CacheBuilder).
pub struct BlockCache<V> {
    shards: Box<[CacheShard<V>]>,
    shard_mask: u32,
    capacity: AtomicUsize,
    registry: Arc<ThreadRegistry>,
    secondary: Option<Arc<dyn SecondaryCache<V>>>,
}

impl<V> BlockCache<V> {
    pub(crate) fn from_parts(
        shards: Box<[CacheShard<V>]>,
        capacity: usize,
        registry: Arc<ThreadRegistry>,
        secondary: Option<Arc<dyn SecondaryCache<V>>>,
    ) -> Self {
        let shard_mask = shards.len() as u32 - 1;
        BlockCache {
            shards,
            shard_mask,
            capacity: AtomicUsize::new(capacity),
            registry,
            secondary,
        }
    }

    #[inline]
    fn shard(&self, hash: u32) -> &CacheShard<V> {
        &self.shards[(hash & self.shard_mask) as usize]
    }

    /// Inserts `value` under `(key, hash)` with [`Priority::Low`].
    pub fn insert(
        &self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
    ) -> Result<InsertStatus, CacheFull> {
        self.insert_with(key, hash, value, charge, Priority::Low)
    }

    /// Inserts `value` under `(key, hash)`.
    ///
    /// Displacing an existing entry reports [`InsertStatus::Overwritten`];
    /// the displaced value is dropped once its last reference is gone.
    /// Without the strict capacity limit this never fails: if eviction
    /// cannot make room, the new entry is dropped as if evicted
    /// immediately.
    pub fn insert_with(
        &self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
        priority: Priority,
    ) -> Result<InsertStatus, CacheFull> {
        self.shard(hash).insert(key, hash, value, charge, priority)
    }

    /// Inserts and immediately pins the new entry.
    pub fn insert_pinned(
        &self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
        priority: Priority,
    ) -> Result<(InsertStatus, EntryHandle<'_, V>), CacheFull> {
        self.shard(hash)
            .insert_pinned(key, hash, value, charge, priority)
    }

    /// Looks up `(key, hash)`, pinning the entry on a hit.
    ///
    /// Misses consult the secondary tier (blocking until the fetch
    /// resolves) when one is configured.
    pub fn lookup(&self, key: &[u8], hash: u32) -> Option<EntryHandle<'_, V>> {
        self.lookup_with(key, hash, Priority::Low, true)
    }

    /// [`lookup`](Self::lookup) with control over the priority of a
    /// secondary-tier promotion and whether to wait for it.
    ///
    /// With `wait` false a secondary hit returns a pending handle
    /// (`is_ready() == false`); resolve it with [`wait_all`](Self::wait_all).
    pub fn lookup_with(
        &self,
        key: &[u8],
        hash: u32,
        priority: Priority,
        wait: bool,
    ) -> Option<EntryHandle<'_, V>> {
        self.shard(hash).lookup(key, hash, priority, wait)
    }

    /// Takes an additional pin on the entry behind `handle`.
    ///
    /// The returned handle must itself be released.
    pub fn add_ref<'c>(&'c self, handle: &EntryHandle<'c, V>) -> EntryHandle<'c, V> {
        let ptr = handle.entry_ptr();
        self.shard(handle.hash()).add_ref(ptr);
        EntryHandle::new(ptr)
    }

    /// Gives back a pin. Returns true iff this call freed the entry.
    pub fn release(&self, handle: EntryHandle<'_, V>) -> bool {
        self.release_with(handle, false)
    }

    /// [`release`](Self::release), optionally erasing the entry instead of
    /// recycling it through the LRU list when this was the last pin.
    pub fn release_with(&self, handle: EntryHandle<'_, V>, force_erase: bool) -> bool {
        let hash = handle.hash();
        self.shard(hash).release(handle.entry_ptr(), force_erase)
    }

    /// Drops `(key, hash)` from the cache. Pinned entries are detached now
    /// and freed when their last pin is released.
    pub fn erase(&self, key: &[u8], hash: u32) {
        self.shard(hash).erase(key, hash);
    }

    /// Evicts every unreferenced entry from every shard.
    pub fn erase_unreferenced(&self) {
        for shard in self.shards.iter() {
            shard.erase_unreferenced();
        }
    }

    /// Resolves a batch of pending secondary-tier handles, then promotes
    /// their values shard by shard. Ready handles are left untouched.
    ///
    /// The batch must not contain two handles pinning the same pending
    /// entry.
    pub fn wait_all(&self, handles: &mut [EntryHandle<'_, V>]) {
        let Some(secondary) = &self.secondary else {
            return;
        };
        let mut pending: Vec<&mut dyn SecondaryResult<V>> = Vec::new();
        for handle in handles.iter() {
            if handle.is_ready() {
                continue;
            }
            // SAFETY: a pending entry is unpublished and pinned only by this
            // handle (caller guarantees no duplicates in the batch), so we
            // have exclusive access to its result.
            let entry = unsafe { &mut *handle.entry_ptr().as_ptr() };
            if let Some(result) = entry.pending.as_mut() {
                pending.push(result.as_mut());
            }
        }
        if pending.is_empty() {
            return;
        }
        secondary.wait_all(&mut pending);
        drop(pending);

        for handle in handles.iter() {
            if handle.is_ready() {
                continue;
            }
            let hash = handle.hash();
            self.shard(hash).promote(handle.entry_ptr());
        }
    }

    /// Registers the calling thread with the hot index's reference tally;
    /// see [`ThreadRegistry::register_current`].
    pub fn register_thread(&self) -> usize {
        self.registry.register_current()
    }

    /// Total configured capacity in charge units.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Re-splits `capacity` across the shards, evicting as needed.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        let per_shard = capacity.div_ceil(self.shards.len());
        for shard in self.shards.iter() {
            shard.set_capacity(per_shard);
        }
    }

    /// Toggles refusal of over-capacity inserts.
    pub fn set_strict_capacity_limit(&self, strict: bool) {
        for shard in self.shards.iter() {
            shard.set_strict_capacity_limit(strict);
        }
    }

    /// Re-balances the high-priority pool split.
    pub fn set_high_pri_pool_ratio(&self, ratio: f64) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::new(format!(
                "high_pri_pool_ratio must be in [0.0, 1.0], got {ratio}"
            )));
        }
        for shard in self.shards.iter() {
            shard.set_high_pri_pool_ratio(ratio);
        }
        Ok(())
    }

    /// Currently configured high-priority pool ratio.
    pub fn high_pri_pool_ratio(&self) -> f64 {
        self.shards[0].high_pri_pool_ratio()
    }

    /// Sum of charges of all cached entries (may transiently exceed the
    /// capacity after a non-strict over-capacity insert).
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|shard| shard.usage()).sum()
    }

    /// Usage attributable to entries that are pinned or hot-indexed (i.e.
    /// not reachable by eviction).
    pub fn pinned_usage(&self) -> usize {
        self.shards.iter().map(|shard| shard.pinned_usage()).sum()
    }

    /// Number of cached entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    /// True when no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries currently on LRU lists across all shards.
    pub fn lru_len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lru_len()).sum()
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Whether the fast path of shard `index` currently consults its hot
    /// index.
    pub fn hot_index_enabled(&self, index: usize) -> bool {
        self.shards[index].hot_enabled()
    }

    /// Folds every shard's counters and gauges into one snapshot.
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        let mut snap = CacheMetricsSnapshot {
            capacity: self.capacity(),
            ..Default::default()
        };
        for shard in self.shards.iter() {
            shard.counters.accumulate(&mut snap);
            snap.usage += shard.usage();
            snap.pinned_usage += shard.pinned_usage();
            snap.lru_len += shard.lru_len();
            snap.hot_len += shard.hot_len();
        }
        snap
    }

    /// Visits `(key, value, charge)` of every cached entry, one shard at a
    /// time under that shard's mutex. `f` must not call back into the
    /// cache.
    pub fn for_each_entry(&self, mut f: impl FnMut(&[u8], &V, usize)) {
        for shard in self.shards.iter() {
            shard.for_each(&mut f);
        }
    }
}

impl<V> std::fmt::Debug for BlockCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("shards", &self.shards.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CacheBuilder;

    #[test]
    fn hash_key_is_deterministic() {
        let a = hash_key(b"block-17");
        let b = hash_key(b"block-17");
        assert_eq!(a, b);
        assert_ne!(hash_key(b"block-17"), hash_key(b"block-18"));
    }

    #[test]
    fn routing_uses_low_bits() {
        let cache = CacheBuilder::new(4096).shard_bits(2).try_build::<u64>().unwrap();
        assert_eq!(cache.shard_count(), 4);
        // Hashes differing only above the shard mask land in one shard and
        // displace one another only by full key match.
        cache.insert(b"a", 0x0000_0001, 1, 8).unwrap();
        cache.insert(b"b", 0x0000_0005, 2, 8).unwrap();
        assert_eq!(cache.usage(), 16);
    }

    #[test]
    fn debug_format_is_compact() {
        let cache = CacheBuilder::new(1024).shard_bits(0).try_build::<u64>().unwrap();
        let s = format!("{cache:?}");
        assert!(s.contains("BlockCache"));
    }
}
