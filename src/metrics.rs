//! Cache metrics counters and snapshots.
//!
//! Counters are per-shard relaxed atomics, cheap enough to update on the hot
//! path; [`BlockCache::metrics`](crate::cache::BlockCache::metrics) folds
//! them into a [`CacheMetricsSnapshot`] together with point-in-time gauges.
//! Metrics are observational and never affect cache behavior.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of cache activity, aggregated across shards.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    /// Fast-path hits served from the hot index under the shared lock.
    pub hot_hits: u64,
    /// Fast-path probes that missed the hot index.
    pub hot_misses: u64,
    /// Entries admitted into the hot index.
    pub hot_insertions: u64,
    /// Hot-index admissions refused because the index was full.
    pub hot_admission_refusals: u64,
    /// Entries evicted from the hot index by FIFO admission pressure.
    pub hot_evictions: u64,
    /// Entries force-removed from the hot index by erase/overwrite/eviction.
    pub hot_invalidations: u64,
    /// Adaptive decisions that flushed the hot index back to the LRU.
    pub full_flushes: u64,
    /// Entries evicted from the LRU list by capacity pressure.
    pub lru_evictions: u64,
    /// Lookups answered by the secondary cache.
    pub secondary_hits: u64,

    // Gauges captured at snapshot time.
    pub usage: usize,
    pub pinned_usage: usize,
    pub lru_len: usize,
    pub hot_len: usize,
    pub capacity: usize,
}

/// Per-shard counters. All increments use relaxed ordering.
#[derive(Debug, Default)]
pub(crate) struct ShardCounters {
    hot_hits: AtomicU64,
    hot_misses: AtomicU64,
    hot_insertions: AtomicU64,
    hot_admission_refusals: AtomicU64,
    hot_evictions: AtomicU64,
    hot_invalidations: AtomicU64,
    full_flushes: AtomicU64,
    lru_evictions: AtomicU64,
    secondary_hits: AtomicU64,
}

impl ShardCounters {
    #[inline]
    pub fn inc_hot_hit(&self) {
        self.hot_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_hot_miss(&self) {
        self.hot_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_hot_insertion(&self) {
        self.hot_insertions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_hot_admission_refusal(&self) {
        self.hot_admission_refusals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_hot_eviction(&self) {
        self.hot_evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_hot_invalidation(&self) {
        self.hot_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_full_flush(&self) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_lru_eviction(&self) {
        self.lru_evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_secondary_hit(&self) {
        self.secondary_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds this shard's counters into `snap`.
    pub fn accumulate(&self, snap: &mut CacheMetricsSnapshot) {
        snap.hot_hits += self.hot_hits.load(Ordering::Relaxed);
        snap.hot_misses += self.hot_misses.load(Ordering::Relaxed);
        snap.hot_insertions += self.hot_insertions.load(Ordering::Relaxed);
        snap.hot_admission_refusals += self.hot_admission_refusals.load(Ordering::Relaxed);
        snap.hot_evictions += self.hot_evictions.load(Ordering::Relaxed);
        snap.hot_invalidations += self.hot_invalidations.load(Ordering::Relaxed);
        snap.full_flushes += self.full_flushes.load(Ordering::Relaxed);
        snap.lru_evictions += self.lru_evictions.load(Ordering::Relaxed);
        snap.secondary_hits += self.secondary_hits.load(Ordering::Relaxed);
    }
}
