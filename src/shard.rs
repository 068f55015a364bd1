//! One shard of the block cache.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                         CacheShard<V>                                │
//!   │                                                                      │
//!   │   EntryTable ───────── authoritative (hash, key) → Entry index       │
//!   │       │                (atomic links; probe-able without the mutex)  │
//!   │       │                                                              │
//!   │   Mutex<ShardCore> ─── usage, capacity, LRU list, decision window    │
//!   │       │                                                              │
//!   │   RwLock<HotIndex> ─── bounded hot-key index + reference tally       │
//!   │       │                                                              │
//!   │   AdaptiveState ────── fast-path hit counters, enable flag           │
//!   └──────────────────────────────────────────────────────────────────────┘
//!
//!   Lookup fast path:   read lock ──► primary probe (negative filter)
//!                                 ──► hot-index probe ──► handle
//!   Lookup slow path:   shard mutex ──► primary table ──► LRU detach + ref
//!                                   ──► adaptive decision every NLIMIT hits
//!   Insert/Erase:       shard mutex (+ hot write lock iff the touched
//!                       entry is hot-indexed)
//! ```
//!
//! ## Entry states
//!
//! ```text
//!                Insert(pinned)                  Insert
//!                      │                           │
//!                      ▼                           ▼
//!               ┌──────────────┐   release   ┌───────────┐
//!               │ Hot-External │────────────►│    LRU    │
//!               │ refs>0       │◄────────────│  refs==0  │
//!               └──────┬───────┘  slow hit   └─────┬─────┘
//!                      │                           │ adaptive promote
//!                      │ erase / overwrite        ▼
//!                      │ / forced release    ┌───────────┐
//!                      ▼                     │  Hot-Aux  │ flush / FIFO
//!               ┌──────────────┐             │ in hot    │──────► LRU
//!               │  Tombstoned  │◄────────────│ index     │
//!               │ !in_cache    │ erase/evict └───────────┘
//!               └──────┬───────┘
//!                      │ refs==0
//!                      ▼
//!                    freed (value drop runs outside all shard locks)
//! ```
//!
//! ## Locking
//!
//! Lock order is always shard mutex before hot-index lock; the fast path
//! takes only the hot-index read lock. Memory unlinked under the mutex
//! (evicted entries, displaced bucket arrays) is freed only after a
//! write-lock barrier on the hot-index lock drains every in-flight
//! fast-path reader.

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::adaptive::{blended_percentile, AdaptiveState, HitrateBoard, HotIndexParams};
use crate::builder::MetadataChargePolicy;
use crate::cache::InsertStatus;
use crate::entry::{Entry, EntryHandle, Priority};
use crate::error::CacheFull;
use crate::hot::HotIndex;
use crate::list::LruList;
use crate::metrics::ShardCounters;
use crate::secondary::SecondaryCache;
use crate::table::{BucketArray, EntryTable};
use crate::tid::ThreadRegistry;

/// State guarded by the shard mutex.
struct ShardCore<V> {
    capacity: usize,
    strict_capacity_limit: bool,
    /// Sum of `total_charge` over charged entries.
    usage: usize,
    lru: LruList<V>,
    /// What the fast path would have yielded, sampled on slow-path hits.
    virtual_totalhit: u64,
    virtual_nohit: u64,
    /// Slow-path hits since the last adaptive decision.
    window_hits: u64,
}

/// Entries and bucket arrays unlinked under the mutex, to be freed after
/// the reclaim barrier. Value drops and secondary-cache offers happen here,
/// outside every shard lock.
struct ReclaimBatch<V> {
    entries: Vec<NonNull<Entry<V>>>,
    retired: Vec<*mut BucketArray<V>>,
}

impl<V> ReclaimBatch<V> {
    fn new() -> Self {
        ReclaimBatch {
            entries: Vec::new(),
            retired: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.retired.is_empty()
    }
}

/// Outcome of the locked section of an insert.
enum Placed {
    Done(InsertStatus),
    /// Refused under the strict limit; the caller still owns the entry.
    RejectedKeep,
    /// Refused under the strict limit; free the never-published entry.
    RejectedFree,
}

/// One of the cache's `2^S` independent sub-caches.
///
/// Cacheline-aligned so the per-shard fast-path counters of neighboring
/// shards never share a line.
#[repr(align(64))]
pub(crate) struct CacheShard<V> {
    table: EntryTable<V>,
    core: Mutex<ShardCore<V>>,
    hot: RwLock<HotIndex<V>>,
    adapt: AdaptiveState,
    pub(crate) counters: ShardCounters,
    params: HotIndexParams,
    board: Arc<HitrateBoard>,
    registry: Arc<ThreadRegistry>,
    secondary: Option<Arc<dyn SecondaryCache<V>>>,
    metadata_policy: MetadataChargePolicy,
    index: usize,
}

// SAFETY: all shared mutable state behind the raw entry pointers is either
// atomic or guarded by the shard mutex / hot-index lock as documented on
// each field; entries are freed only through the reclaim barrier.
unsafe impl<V: Send + Sync> Send for CacheShard<V> {}
unsafe impl<V: Send + Sync> Sync for CacheShard<V> {}

impl<V> CacheShard<V> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        capacity: usize,
        strict_capacity_limit: bool,
        high_pri_pool_ratio: f64,
        metadata_policy: MetadataChargePolicy,
        max_upper_hash_bits: u32,
        params: HotIndexParams,
        board: Arc<HitrateBoard>,
        registry: Arc<ThreadRegistry>,
        secondary: Option<Arc<dyn SecondaryCache<V>>>,
    ) -> Self {
        let mut lru = LruList::new();
        // SAFETY: the list is not shared yet.
        unsafe { lru.set_pool_params(high_pri_pool_ratio, capacity) };
        CacheShard {
            table: EntryTable::new(max_upper_hash_bits),
            core: Mutex::new(ShardCore {
                capacity,
                strict_capacity_limit,
                usage: 0,
                lru,
                virtual_totalhit: 0,
                virtual_nohit: 0,
                window_hits: 0,
            }),
            hot: RwLock::new(HotIndex::new(params.aux_bits, params.thread_slots)),
            adapt: AdaptiveState::new(),
            counters: ShardCounters::default(),
            params,
            board,
            registry,
            secondary,
            metadata_policy,
            index,
        }
    }

    fn total_charge_of(&self, key_len: usize, charge: usize) -> usize {
        match self.metadata_policy {
            MetadataChargePolicy::DontCharge => charge,
            MetadataChargePolicy::FullCharge => {
                charge + std::mem::size_of::<Entry<V>>() + key_len
            },
        }
    }

    fn uncharge(core: &mut ShardCore<V>, e: NonNull<Entry<V>>) {
        let total_charge = unsafe { e.as_ref() }.total_charge;
        debug_assert!(core.usage >= total_charge);
        core.usage -= total_charge;
        unsafe { e.as_ref() }.set_charged(false);
    }

    /// Frees everything the locked section unlinked. Runs the write-lock
    /// barrier first so no fast-path reader can still see the memory, then
    /// offers evicted values to the secondary tier and drops them.
    fn reclaim(&self, batch: ReclaimBatch<V>) {
        if batch.is_empty() {
            return;
        }
        drop(self.hot.write());
        for e in batch.entries {
            // SAFETY: the entry is unlinked from every shard structure and
            // unreferenced; the barrier above drained racing readers.
            let entry = unsafe { Box::from_raw(e.as_ptr()) };
            if let (Some(secondary), Some(value)) = (&self.secondary, entry.value.as_ref()) {
                if entry.is_secondary_compatible() && !entry.is_promoted() {
                    secondary.insert(&entry.key, value);
                }
            }
        }
        for arr in batch.retired {
            // SAFETY: displaced by a rehash and unreachable since the barrier.
            unsafe { drop(Box::from_raw(arr)) };
        }
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    /// Allocates the entry outside the shard mutex; a full cache will have
    /// to free it again, but that is the rare case.
    fn alloc_entry(
        &self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
        priority: Priority,
    ) -> NonNull<Entry<V>> {
        let total_charge = self.total_charge_of(key.len(), charge);
        let entry = Entry::new(
            key,
            hash,
            Some(value),
            charge,
            total_charge,
            priority,
            self.secondary.is_some(),
        );
        entry.set_in_cache(true);
        NonNull::from(Box::leak(Box::new(entry)))
    }

    pub(crate) fn insert(
        &self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
        priority: Priority,
    ) -> Result<InsertStatus, CacheFull> {
        let e = self.alloc_entry(key, hash, value, charge, priority);
        self.insert_entry(e, false, false, true)
    }

    pub(crate) fn insert_pinned(
        &self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
        priority: Priority,
    ) -> Result<(InsertStatus, EntryHandle<'_, V>), CacheFull> {
        let e = self.alloc_entry(key, hash, value, charge, priority);
        let status = self.insert_entry(e, true, true, true)?;
        Ok((status, EntryHandle::new(e)))
    }

    /// Places an allocated entry into the shard.
    ///
    /// With `pinned` the entry is handed to the caller instead of the LRU
    /// list; `take_ref` additionally takes the caller's reference here
    /// (promotions already hold one). With `free_on_fail` a strict-limit
    /// refusal frees the entry; otherwise the caller keeps ownership of the
    /// unpublished entry.
    fn insert_entry(
        &self,
        e: NonNull<Entry<V>>,
        pinned: bool,
        take_ref: bool,
        free_on_fail: bool,
    ) -> Result<InsertStatus, CacheFull> {
        let total_charge = unsafe { e.as_ref() }.total_charge;
        let mut batch = ReclaimBatch::new();
        let placed;
        {
            let mut core = self.core.lock();
            self.evict_from_lru(&mut core, total_charge, &mut batch);

            if core.usage + total_charge > core.capacity
                && (core.strict_capacity_limit || !pinned)
            {
                unsafe { e.as_ref() }.set_in_cache(false);
                if !pinned {
                    // Keep the Ok contract: behave as if the entry was
                    // inserted and evicted immediately (it still gets
                    // offered to the secondary tier).
                    batch.entries.push(e);
                    placed = Placed::Done(InsertStatus::Inserted);
                } else if free_on_fail {
                    placed = Placed::RejectedFree;
                } else {
                    placed = Placed::RejectedKeep;
                }
            } else {
                // The cache may run over capacity here if eviction could not
                // free enough space; usage settles back on later releases.
                let old = unsafe { self.table.insert(e, &mut batch.retired) };
                core.usage += total_charge;
                unsafe { e.as_ref() }.set_charged(true);
                let mut status = InsertStatus::Inserted;

                if let Some(old) = old {
                    status = InsertStatus::Overwritten;
                    debug_assert!(unsafe { old.as_ref() }.is_in_cache());
                    unsafe { old.as_ref() }.set_in_cache(false);
                    if unsafe { old.as_ref() }.is_in_hot() {
                        // Swap the displaced entry out of the hot index and
                        // the new one in, so the hot index keeps serving
                        // this key.
                        let mut hot = self.hot.write();
                        let (okey, ohash) =
                            unsafe { (&*std::ptr::addr_of!((*old.as_ptr()).key), old.as_ref().hash) };
                        unsafe { hot.remove(okey, ohash, true) };
                        self.counters.inc_hot_invalidation();
                        if self.admit_to_hot(&mut core, &mut hot, e) && pinned && take_ref {
                            // The caller's handle must hold its unit in the
                            // tally, like any other reference to a
                            // hot-indexed entry.
                            hot.note_ref(unsafe { e.as_ref() }, self.registry.current());
                        }
                    }
                    if unsafe { old.as_ref() }.refs == 0 {
                        // Off-LRU for ex-hot entries; remove is idempotent.
                        unsafe { core.lru.remove(old) };
                        Self::uncharge(&mut core, old);
                        batch.entries.push(old);
                    }
                }

                if !pinned {
                    if !unsafe { e.as_ref() }.is_in_hot() {
                        unsafe { core.lru.insert(e) };
                    }
                } else if take_ref && !unsafe { e.as_ref() }.is_in_hot() {
                    unsafe { (*e.as_ptr()).refs += 1 };
                }
                placed = Placed::Done(status);
            }
        }
        self.reclaim(batch);

        match placed {
            Placed::Done(status) => Ok(status),
            Placed::RejectedKeep => Err(CacheFull),
            Placed::RejectedFree => {
                // Never published; no barrier needed.
                unsafe { drop(Box::from_raw(e.as_ptr())) };
                Err(CacheFull)
            },
        }
    }

    /// Inserts `e` into the hot index, routing any FIFO victim back to the
    /// LRU list and keeping the admission counters straight.
    fn admit_to_hot(
        &self,
        core: &mut ShardCore<V>,
        hot: &mut HotIndex<V>,
        e: NonNull<Entry<V>>,
    ) -> bool {
        // SAFETY: shard mutex and hot write lock are held by the caller.
        let admission = unsafe { hot.insert(e) };
        if let Some(victim) = admission.fifo_victim {
            self.counters.inc_hot_eviction();
            // The tally fold can resurrect external references; only an
            // unreferenced victim belongs on the LRU list.
            if unsafe { victim.as_ref() }.refs == 0 {
                unsafe { core.lru.insert(victim) };
            }
        }
        if admission.admitted {
            self.counters.inc_hot_insertion();
        } else {
            self.counters.inc_hot_admission_refusal();
        }
        admission.admitted
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    /// Frees space following strict LRU order until `usage + charge` fits
    /// or the list is drained.
    fn evict_from_lru(
        &self,
        core: &mut ShardCore<V>,
        charge: usize,
        batch: &mut ReclaimBatch<V>,
    ) {
        while core.usage + charge > core.capacity {
            if !self.detach_lru_victim(core, batch) {
                break;
            }
        }
    }

    /// Detaches the current LRU victim from every shard structure and
    /// queues it for reclamation. Returns false when the list is empty.
    fn detach_lru_victim(&self, core: &mut ShardCore<V>, batch: &mut ReclaimBatch<V>) -> bool {
        let Some(old) = NonNull::new(core.lru.back()) else {
            return false;
        };
        // The LRU list only holds unreferenced in-cache entries.
        debug_assert!(unsafe { old.as_ref() }.is_in_cache());
        debug_assert_eq!(unsafe { old.as_ref() }.refs, 0);
        unsafe { core.lru.remove(old) };
        if unsafe { old.as_ref() }.is_in_hot() {
            // Unreachable while hot entries stay off the LRU list, but kept
            // so a hot entry can never slip through an eviction.
            let mut hot = self.hot.write();
            let (okey, ohash) =
                unsafe { (&*std::ptr::addr_of!((*old.as_ptr()).key), old.as_ref().hash) };
            unsafe { hot.remove(okey, ohash, true) };
            self.counters.inc_hot_invalidation();
        }
        unsafe {
            let (okey, ohash) = (&*std::ptr::addr_of!((*old.as_ptr()).key), old.as_ref().hash);
            self.table.remove(okey, ohash);
        }
        unsafe { old.as_ref() }.set_in_cache(false);
        Self::uncharge(core, old);
        self.counters.inc_lru_eviction();
        if unsafe { old.as_ref() }.refs == 0 {
            batch.entries.push(old);
        }
        true
    }

    /// Drains every unreferenced entry.
    pub(crate) fn erase_unreferenced(&self) {
        let mut batch = ReclaimBatch::new();
        {
            let mut core = self.core.lock();
            while self.detach_lru_victim(&mut core, &mut batch) {}
        }
        self.reclaim(batch);
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    pub(crate) fn lookup(
        &self,
        key: &[u8],
        hash: u32,
        priority: Priority,
        wait: bool,
    ) -> Option<EntryHandle<'_, V>> {
        let mut filtered_out = false;

        if self.params.activate_pctl != 0 {
            let hot = self.hot.read();
            // Negative filter: a key absent from the primary index cannot be
            // in the bounded hot index either, and a true miss never needs
            // the mutex.
            // SAFETY: probing is sound while the hot-index read lock pins
            // unlinked memory (see `EntryTable::lookup`).
            if unsafe { self.table.lookup(key, hash) }.is_none() {
                filtered_out = true;
            } else if self.adapt.enabled() || self.params.activate_pctl == 100 {
                self.adapt.record_probe();
                if let Some(e) = hot.lookup(key, hash, self.registry.current()) {
                    self.counters.inc_hot_hit();
                    return Some(EntryHandle::new(e));
                }
                self.counters.inc_hot_miss();
                // A sustained miss streak means the hot set is elsewhere;
                // stop paying for the probe until the next decision.
                if self.adapt.record_miss() && self.params.activate_pctl != 100 {
                    self.adapt.set_enabled(false);
                }
            }
        }

        if !filtered_out {
            let mut core = self.core.lock();
            // SAFETY: shard mutex held.
            if let Some(e) = unsafe { self.table.lookup(key, hash) } {
                debug_assert!(unsafe { e.as_ref() }.is_in_cache());
                core.virtual_totalhit += 1;
                let in_hot = unsafe { e.as_ref() }.is_in_hot();
                if !in_hot {
                    core.virtual_nohit += 1;
                }
                // Hot entries are not on the LRU list; remove is idempotent.
                unsafe { core.lru.remove(e) };
                if !in_hot {
                    unsafe { (*e.as_ptr()).refs += 1 };
                    unsafe { e.as_ref() }.set_in_high_pri_pool(false);
                } else {
                    // A hot-indexed entry reached the slow path (the fast
                    // probe raced its promotion). The handle must still
                    // hold exactly one unit, so record it in the tally the
                    // way a fast-path hit would.
                    self.hot
                        .read()
                        .note_ref(unsafe { e.as_ref() }, self.registry.current());
                }
                unsafe { e.as_ref() }.set_has_hit();
                if self.params.activate_pctl != 0 {
                    core.window_hits += 1;
                    if core.window_hits > self.params.nlimit {
                        core.window_hits = 0;
                        self.run_adaptive_decision(&mut core, e);
                    }
                }
                return Some(EntryHandle::new(e));
            }
        }

        self.lookup_secondary(key, hash, priority, wait)
    }

    /// Consults the secondary tier after a primary miss. Runs outside every
    /// shard lock; the secondary call may block.
    fn lookup_secondary(
        &self,
        key: &[u8],
        hash: u32,
        priority: Priority,
        wait: bool,
    ) -> Option<EntryHandle<'_, V>> {
        let secondary = self.secondary.as_ref()?;
        let result = secondary.lookup(key, wait)?;

        let mut entry = Entry::new(key, hash, None, 0, 0, priority, true);
        entry.refs = 1;
        entry.pending = Some(result);
        let e = NonNull::from(Box::leak(Box::new(entry)));

        if wait {
            self.promote(e);
            if unsafe { e.as_ref() }.value.is_some() {
                self.counters.inc_secondary_hit();
                Some(EntryHandle::new(e))
            } else {
                // The secondary tier returned a result but the fetch failed.
                // SAFETY: never published, single owner.
                unsafe { drop(Box::from_raw(e.as_ptr())) };
                None
            }
        } else {
            unsafe { e.as_ref() }.set_pending(true);
            self.counters.inc_secondary_hit();
            Some(EntryHandle::new(e))
        }
    }

    /// Resolves a pending secondary fetch and inserts the value.
    ///
    /// A capacity refusal under the strict limit leaves the value readable
    /// through the caller's handle — the data is already in memory, so
    /// freeing it here would only force a re-read.
    pub(crate) fn promote(&self, e: NonNull<Entry<V>>) {
        let fetched = {
            // SAFETY: a pending entry is unpublished; its single handle
            // (held by our caller) gives exclusive access.
            let entry = unsafe { &mut *e.as_ptr() };
            let Some(mut result) = entry.pending.take() else {
                return;
            };
            if !result.is_ready() {
                result.wait();
            }
            entry.set_pending(false);
            match result.take_value() {
                Some(value) => {
                    entry.value = Some(value);
                    entry.charge = result.charge();
                    entry.total_charge = self.total_charge_of(entry.key.len(), entry.charge);
                    entry.set_promoted();
                    entry.set_in_cache(true);
                    true
                },
                None => {
                    entry.charge = 0;
                    entry.set_in_cache(false);
                    false
                },
            }
        };
        if fetched {
            let _ = self.insert_entry(e, true, false, false);
        }
    }

    // -----------------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------------

    /// Takes an additional reference on an already-referenced entry.
    pub(crate) fn add_ref(&self, e: NonNull<Entry<V>>) {
        if self.params.activate_pctl != 0 {
            let hot = self.hot.read();
            // Stable under the read lock: hot transitions need the write
            // lock.
            if unsafe { e.as_ref() }.is_in_hot() {
                hot.note_ref(unsafe { e.as_ref() }, self.registry.current());
                return;
            }
        }
        let _core = self.core.lock();
        if unsafe { e.as_ref() }.is_in_hot() {
            // Promoted between the check above and taking the mutex.
            self.hot
                .read()
                .note_ref(unsafe { e.as_ref() }, self.registry.current());
            return;
        }
        debug_assert!(unsafe { e.as_ref() }.refs > 0, "add_ref on an unreferenced entry");
        unsafe { (*e.as_ptr()).refs += 1 };
    }

    /// Gives back one reference. Returns true iff this call freed the entry
    /// (hot-index entries are never released from here; their references
    /// drain through the tally).
    pub(crate) fn release(&self, e: NonNull<Entry<V>>, force_erase: bool) -> bool {
        if self.params.activate_pctl != 0 {
            let hot = self.hot.read();
            // The flag cannot change while we hold the read lock, so the
            // tally decrement always hits the stamp the lookup incremented.
            if unsafe { e.as_ref() }.is_in_hot() {
                hot.unref(unsafe { e.as_ref() }, self.registry.current());
                return true;
            }
        }

        let mut batch = ReclaimBatch::new();
        let freed;
        {
            let mut core = self.core.lock();
            if unsafe { e.as_ref() }.is_in_hot() {
                // Promoted between the unlocked check and the mutex.
                self.hot
                    .read()
                    .unref(unsafe { e.as_ref() }, self.registry.current());
                return true;
            }
            debug_assert!(unsafe { e.as_ref() }.refs > 0, "release without a reference");
            unsafe { (*e.as_ptr()).refs -= 1 };
            let mut last = unsafe { e.as_ref() }.refs == 0;
            if last && unsafe { e.as_ref() }.is_in_cache() {
                if core.usage > core.capacity || force_erase {
                    // Over capacity (or told to): drop the entry instead of
                    // recycling it through the LRU list.
                    unsafe {
                        let (okey, ohash) =
                            (&*std::ptr::addr_of!((*e.as_ptr()).key), e.as_ref().hash);
                        self.table.remove(okey, ohash);
                    }
                    unsafe { e.as_ref() }.set_in_cache(false);
                } else {
                    unsafe { core.lru.insert(e) };
                    last = false;
                }
            }
            if last {
                if unsafe { e.as_ref() }.is_charged() {
                    Self::uncharge(&mut core, e);
                }
                batch.entries.push(e);
                freed = true;
            } else {
                freed = false;
            }
        }
        self.reclaim(batch);
        freed
    }

    // -----------------------------------------------------------------------
    // Erase
    // -----------------------------------------------------------------------

    pub(crate) fn erase(&self, key: &[u8], hash: u32) {
        let mut batch = ReclaimBatch::new();
        {
            let mut core = self.core.lock();
            // SAFETY: shard mutex held.
            if let Some(e) = unsafe { self.table.remove(key, hash) } {
                debug_assert!(unsafe { e.as_ref() }.is_in_cache());
                unsafe { e.as_ref() }.set_in_cache(false);
                if unsafe { e.as_ref() }.is_in_hot() {
                    let mut hot = self.hot.write();
                    unsafe { hot.remove(key, hash, true) };
                    self.counters.inc_hot_invalidation();
                }
                // Only after the tally fold do we know the true reference
                // count; outstanding fast-path holders keep the tombstone
                // alive until their releases drain.
                if unsafe { e.as_ref() }.refs == 0 {
                    unsafe { core.lru.remove(e) };
                    Self::uncharge(&mut core, e);
                    batch.entries.push(e);
                }
            }
        }
        self.reclaim(batch);
    }

    // -----------------------------------------------------------------------
    // Adaptive controller
    // -----------------------------------------------------------------------

    /// Periodic per-shard decision, run under the shard mutex on every
    /// `nlimit`-th slow-path hit. `e` is the entry that tripped the window.
    fn run_adaptive_decision(&self, core: &mut ShardCore<V>, e: NonNull<Entry<V>>) {
        let mut hot = self.hot.write();
        let params = &self.params;

        // Use whichever sample stream saw more traffic; both denominators
        // are nonzero when their branch is taken (a slow-path hit just
        // bumped virtual_totalhit).
        let probes = self.adapt.probes();
        let hitrate = if probes > core.virtual_totalhit {
            100 - (self.adapt.misses() * 100 / probes) as i64
        } else {
            100 - (core.virtual_nohit * 100 / core.virtual_totalhit) as i64
        };

        self.board.publish_hitrate(self.index, hitrate);
        let sorted = self.board.sorted_hitrates();
        let skip_median = blended_percentile(&sorted, params.activate_pctl);
        let flush_median = blended_percentile(&sorted, params.flush_pctl);
        self.board.set_medians(self.index, skip_median, flush_median);

        // Averaging every shard's median smooths out skewed workloads and
        // shards whose own decision runs rarely.
        let avg_skip = self.board.avg_skip_median();
        self.adapt
            .set_miss_budget((params.nlimit as i64 * avg_skip / 100).max(0) as u64);
        let avg_flush = self.board.avg_flush_median();

        if params.flush_pctl != 0 && hitrate < avg_flush {
            // The hot index is working a cold shard; hand everything back
            // to the LRU list. Entries with outstanding references stay
            // indexed (evict_fifo refuses them) and drain later.
            let mut flushed = false;
            while let Some(victim) = unsafe { hot.evict_fifo() } {
                self.counters.inc_hot_eviction();
                if unsafe { victim.as_ref() }.refs == 0 {
                    unsafe { core.lru.insert(victim) };
                }
                flushed = true;
            }
            if flushed {
                self.counters.inc_full_flush();
            }
        }

        // Promote the entry that tripped the window, then refill from the
        // MRU end until the index reaches its admission threshold.
        if !unsafe { e.as_ref() }.is_in_hot() {
            self.admit_to_hot(core, &mut hot, e);
        }
        loop {
            if hot.is_full() {
                break;
            }
            let Some(front) = NonNull::new(core.lru.front()) else {
                break;
            };
            if self.admit_to_hot(core, &mut hot, front) {
                unsafe { core.lru.remove(front) };
            } else {
                break;
            }
        }

        // Re-arm the fast path only for a shard that is actually running
        // hot; a cold shard stays on the slow path until the next decision.
        if hitrate > avg_skip {
            self.adapt.set_enabled(true);
        }
        self.adapt.reset_window();
        core.virtual_totalhit = 0;
        core.virtual_nohit = 0;
    }

    // -----------------------------------------------------------------------
    // Introspection & reconfiguration
    // -----------------------------------------------------------------------

    pub(crate) fn usage(&self) -> usize {
        self.core.lock().usage
    }

    /// Number of entries in the primary index.
    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn pinned_usage(&self) -> usize {
        let core = self.core.lock();
        debug_assert!(core.usage >= core.lru.lru_usage());
        core.usage - core.lru.lru_usage()
    }

    pub(crate) fn lru_len(&self) -> usize {
        self.core.lock().lru.len()
    }

    pub(crate) fn hot_len(&self) -> usize {
        self.hot.read().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.core.lock().capacity
    }

    pub(crate) fn high_pri_pool_ratio(&self) -> f64 {
        self.core.lock().lru.high_pri_pool_ratio()
    }

    pub(crate) fn hot_enabled(&self) -> bool {
        self.adapt.enabled()
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        let mut batch = ReclaimBatch::new();
        {
            let mut core = self.core.lock();
            core.capacity = capacity;
            let ratio = core.lru.high_pri_pool_ratio();
            // SAFETY: shard mutex held.
            unsafe { core.lru.set_pool_params(ratio, capacity) };
            self.evict_from_lru(&mut core, 0, &mut batch);
        }
        self.reclaim(batch);
    }

    pub(crate) fn set_strict_capacity_limit(&self, strict: bool) {
        self.core.lock().strict_capacity_limit = strict;
    }

    pub(crate) fn set_high_pri_pool_ratio(&self, ratio: f64) {
        let mut core = self.core.lock();
        let capacity = core.capacity;
        // SAFETY: shard mutex held.
        unsafe { core.lru.set_pool_params(ratio, capacity) };
    }

    /// Visits every cached entry of this shard under the shard mutex.
    pub(crate) fn for_each(&self, f: &mut dyn FnMut(&[u8], &V, usize)) {
        let _core = self.core.lock();
        // SAFETY: shard mutex held; `f` cannot reenter the shard.
        unsafe {
            self.table.for_each(|e| {
                let entry = e.as_ref();
                if let Some(value) = &entry.value {
                    f(&entry.key, value, entry.charge);
                }
            });
        }
    }
}

impl<V> Drop for CacheShard<V> {
    fn drop(&mut self) {
        // Exclusive access: no handles can outlive the cache (lifetime) and
        // no other thread can hold a lock. Entries erased while still
        // referenced were the caller's to release and have leaked already.
        let mut entries = Vec::new();
        unsafe { self.table.for_each(|e| entries.push(e)) };
        for e in entries {
            unsafe { drop(Box::from_raw(e.as_ptr())) };
        }
    }
}
