//! Bounded hot-key index of a shard.
//!
//! ## Architecture
//!
//! ```text
//!   HotIndex (behind the shard's RwLock)
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │ buckets[2^B]    slot = hash >> (32 − B), chained via next_hot    │
//!   │ queue           FIFO of (key, hash) in admission order           │
//!   │ avail[2^B]      stamp-in-use bitmap                              │
//!   │                                                                  │
//!   │ tally[2^B × T]  per-stamp, per-thread net Lookup(+1)/Unref(−1)   │
//!   │                 ┌───────── thread column ─────────┐              │
//!   │        stamp 0  │  +2  │  −1  │   0  │  −1  │ ... │  Σ = 0      │
//!   │        stamp 1  │   0  │  +1  │   0  │   0  │ ... │  Σ = +1     │
//!   │                 └──────────────────────────────────┘             │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The hot index lets lookups of currently-hot keys proceed under the shared
//! read lock with no LRU bookkeeping: a fast-path hit records `+1` in the
//! caller thread's tally column and a later release records `−1`, so
//! concurrent readers never contend on a shared counter cacheline. Removal
//! (exclusive lock) sums a stamp's row to learn the net outstanding
//! references and folds them back into the entry's ordinary refcount.
//!
//! Admission is FIFO and the index refuses inserts once half full, keeping
//! bucket chains short. Eviction pops admission order, skipping entries that
//! are no longer indexed and re-queueing entries whose tally row is nonzero.
//!
//! ## Locking contract
//!
//! | operation            | lock                                  |
//! |----------------------|---------------------------------------|
//! | `lookup`, `unref`    | shared read lock                      |
//! | `insert`, `remove`, `evict_fifo` | exclusive write lock + shard mutex |
//!
//! A snapshot of `Entry::stamp` taken under the read lock cannot go stale:
//! stamps change only under the write lock, and the entry itself cannot be
//! freed while any reader is inside the lock (the shard's reclaim barrier
//! acquires the write lock first).

use std::collections::VecDeque;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};

use crate::entry::{Entry, NO_STAMP};

pub(crate) struct HotIndex<V> {
    buckets: Box<[AtomicPtr<Entry<V>>]>,
    bits: u32,
    elems: usize,
    /// Admission order; stale pairs are filtered lazily by `evict_fifo`.
    queue: VecDeque<(Box<[u8]>, u32)>,
    /// Stamp-in-use bitmap.
    avail: Box<[bool]>,
    /// Where the next stamp scan starts; rotating it keeps the scan O(1)
    /// in the common case.
    stamp_hint: usize,
    /// `capacity × thread_slots` net reference deltas.
    tally: Box<[AtomicI64]>,
    thread_slots: usize,
}

/// Outcome of a [`HotIndex::insert`] attempt.
pub(crate) struct HotAdmission<V> {
    /// Whether the entry was admitted into the index.
    pub admitted: bool,
    /// Entry displaced by FIFO admission pressure, already detached from the
    /// index with its tally folded into `refs`. The caller decides whether
    /// it goes back on the LRU list.
    pub fifo_victim: Option<NonNull<Entry<V>>>,
}

impl<V> HotIndex<V> {
    pub(crate) fn new(bits: u32, thread_slots: usize) -> Self {
        let capacity = 1usize << bits;
        let mut buckets = Vec::with_capacity(capacity);
        buckets.resize_with(capacity, || AtomicPtr::new(ptr::null_mut()));
        let mut tally = Vec::with_capacity(capacity * thread_slots);
        tally.resize_with(capacity * thread_slots, || AtomicI64::new(0));
        HotIndex {
            buckets: buckets.into_boxed_slice(),
            bits,
            elems: 0,
            queue: VecDeque::new(),
            avail: vec![false; capacity].into_boxed_slice(),
            stamp_hint: 0,
            tally: tally.into_boxed_slice(),
            thread_slots,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        1usize << self.bits
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.elems
    }

    /// Admission threshold: half the bucket count keeps chains O(1).
    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.elems >= self.capacity() / 2
    }

    #[inline]
    fn slot_of(&self, hash: u32) -> &AtomicPtr<Entry<V>> {
        &self.buckets[(hash >> (32 - self.bits)) as usize]
    }

    /// Chain walk without touching the tally; shared by existence checks and
    /// unlinking.
    fn find_link(&self, key: &[u8], hash: u32) -> &AtomicPtr<Entry<V>> {
        let mut link = self.slot_of(hash);
        loop {
            let p = link.load(Ordering::Acquire);
            if p.is_null() {
                return link;
            }
            // SAFETY: hot-chain entries stay live while the caller holds
            // either side of the hot-index lock (see module docs).
            let e = unsafe { &*p };
            if e.hash == hash && &*e.key == key {
                return link;
            }
            link = &e.next_hot;
        }
    }

    fn find(&self, key: &[u8], hash: u32) -> Option<NonNull<Entry<V>>> {
        NonNull::new(self.find_link(key, hash).load(Ordering::Acquire))
    }

    /// Fast-path lookup. Requires the shared read lock (enforced by access
    /// through the shard's `RwLock`). On a hit, records `+1` in the caller
    /// thread's tally column for the entry's stamp.
    pub(crate) fn lookup(&self, key: &[u8], hash: u32, tid: usize) -> Option<NonNull<Entry<V>>> {
        let e = self.find(key, hash)?;
        let stamp = unsafe { e.as_ref() }.stamp.load(Ordering::Relaxed);
        if stamp > NO_STAMP && (stamp as usize) < self.capacity() {
            self.tally_cell(stamp as usize, tid).fetch_add(1, Ordering::Relaxed);
        }
        Some(e)
    }

    /// Release-side counterpart of [`lookup`](Self::lookup): records `−1`
    /// in the caller thread's tally column. Requires the read lock.
    pub(crate) fn unref(&self, e: &Entry<V>, tid: usize) {
        let stamp = e.stamp.load(Ordering::Relaxed);
        if stamp > NO_STAMP && (stamp as usize) < self.capacity() {
            self.tally_cell(stamp as usize, tid).fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Records an additional reference on an indexed entry, as if it had
    /// been looked up. Requires the read lock.
    pub(crate) fn note_ref(&self, e: &Entry<V>, tid: usize) {
        let stamp = e.stamp.load(Ordering::Relaxed);
        if stamp > NO_STAMP && (stamp as usize) < self.capacity() {
            self.tally_cell(stamp as usize, tid).fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    fn tally_cell(&self, stamp: usize, tid: usize) -> &AtomicI64 {
        &self.tally[stamp * self.thread_slots + tid.min(self.thread_slots - 1)]
    }

    /// Admits `e` into the index, evicting FIFO-oldest entries first if the
    /// index is at its admission threshold.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard mutex and the exclusive write lock; `e`
    /// must be a live in-cache entry of this shard.
    pub(crate) unsafe fn insert(&mut self, e: NonNull<Entry<V>>) -> HotAdmission<V> {
        let entry = unsafe { e.as_ref() };
        if entry.is_in_hot() {
            // Already indexed (a slow-path hit can race the fast path's view
            // of the shard state); re-admitting would leak its stamp.
            return HotAdmission {
                admitted: true,
                fifo_victim: None,
            };
        }

        let mut fifo_victim = None;
        if self.is_full() {
            fifo_victim = unsafe { self.evict_fifo() };
        }
        if self.is_full() {
            // Eviction could not free a slot (everything still referenced).
            return HotAdmission {
                admitted: false,
                fifo_victim,
            };
        }

        let Some(stamp) = self.take_stamp() else {
            return HotAdmission {
                admitted: false,
                fifo_victim,
            };
        };

        let slot = self.slot_of(entry.hash);
        entry.next_hot.store(slot.load(Ordering::Relaxed), Ordering::Relaxed);
        slot.store(e.as_ptr(), Ordering::Release);
        self.elems += 1;
        self.queue.push_back((entry.key.clone(), entry.hash));
        entry.stamp.store(stamp as i32, Ordering::Relaxed);
        entry.set_in_hot(true);
        HotAdmission {
            admitted: true,
            fifo_victim,
        }
    }

    /// Claims a free stamp, scanning from just past the last claim.
    fn take_stamp(&mut self) -> Option<usize> {
        let capacity = self.capacity();
        let mut i = self.stamp_hint;
        for _ in 0..capacity {
            i += 1;
            if i >= capacity {
                i = 0;
            }
            if !self.avail[i] {
                self.avail[i] = true;
                self.stamp_hint = i;
                return Some(i);
            }
        }
        // Unreachable while `elems < capacity / 2`: each indexed entry holds
        // exactly one stamp.
        debug_assert!(false, "no free stamp below the admission threshold");
        None
    }

    /// Detaches the entry for `(hash, key)` from the index.
    ///
    /// Sums the stamp's tally row; with `force` false a nonzero sum aborts
    /// the removal and the entry stays indexed. On success the row is
    /// zeroed, the net delta is folded into `Entry::refs` (clamped at 0),
    /// the stamp is released and the entry's hot state is cleared. The
    /// admission-queue pair is left for `evict_fifo` to filter lazily.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard mutex and the exclusive write lock.
    pub(crate) unsafe fn remove(
        &mut self,
        key: &[u8],
        hash: u32,
        force: bool,
    ) -> Option<NonNull<Entry<V>>> {
        // Raw pointer to the link so the chain borrow does not overlap the
        // bitmap/queue bookkeeping below. It points into the bucket array or
        // a predecessor entry; neither moves nor is freed during this call.
        let link: *const AtomicPtr<Entry<V>> = self.find_link(key, hash);
        let p = NonNull::new(unsafe { (*link).load(Ordering::Relaxed) })?;

        let stamp = unsafe { p.as_ref() }.stamp.load(Ordering::Relaxed);
        debug_assert!(stamp > NO_STAMP && (stamp as usize) < self.capacity());
        if stamp > NO_STAMP && (stamp as usize) < self.capacity() {
            let stamp = stamp as usize;
            let mut outstanding: i64 = 0;
            for tid in 0..self.thread_slots {
                outstanding += self.tally[stamp * self.thread_slots + tid].load(Ordering::Relaxed);
            }
            if !force && outstanding != 0 {
                return None;
            }
            for tid in 0..self.thread_slots {
                self.tally[stamp * self.thread_slots + tid].store(0, Ordering::Relaxed);
            }
            // SAFETY: refs is guarded by the shard mutex, which the caller
            // holds; the borrow is dropped before any other view of the
            // entry is formed.
            unsafe {
                let refs = &mut (*p.as_ptr()).refs;
                *refs = (*refs as i64 + outstanding).max(0) as u32;
            }
            unsafe { p.as_ref() }.stamp.store(NO_STAMP, Ordering::Relaxed);
            self.avail[stamp] = false;
        }

        let chain_next = unsafe { p.as_ref() }.next_hot.load(Ordering::Relaxed);
        unsafe { (*link).store(chain_next, Ordering::Release) };
        self.elems -= 1;
        unsafe { p.as_ref() }.set_in_hot(false);
        Some(p)
    }

    /// Evicts at most one entry in admission order.
    ///
    /// Pops the queue head, skips pairs whose key is no longer indexed, and
    /// re-queues entries whose tally row shows outstanding references. Gives
    /// up after a full queue's worth of probes.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard mutex and the exclusive write lock.
    pub(crate) unsafe fn evict_fifo(&mut self) -> Option<NonNull<Entry<V>>> {
        for _ in 0..self.capacity() {
            let Some((key, hash)) = self.queue.pop_front() else {
                return None;
            };
            if self.find(&key, hash).is_some() {
                match unsafe { self.remove(&key, hash, false) } {
                    Some(e) => return Some(e),
                    // Still referenced; give it another round.
                    None => self.queue.push_back((key, hash)),
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Priority;

    const BITS: u32 = 4; // capacity 16, admits 8

    fn alloc(key: &[u8], hash: u32) -> NonNull<Entry<u32>> {
        let e = Entry::new(key, hash, Some(0u32), 1, 1, Priority::Low, false);
        e.set_in_cache(true);
        NonNull::new(Box::into_raw(Box::new(e))).unwrap()
    }

    unsafe fn free(e: NonNull<Entry<u32>>) {
        drop(Box::from_raw(e.as_ptr()));
    }

    #[test]
    fn insert_assigns_stamp_and_links_chain() {
        let mut hot: HotIndex<u32> = HotIndex::new(BITS, 2);
        let e = alloc(b"hot", 0xdead_beef);

        unsafe {
            let outcome = hot.insert(e);
            assert!(outcome.admitted);
            assert!(outcome.fifo_victim.is_none());
            assert_eq!(hot.len(), 1);

            let entry = e.as_ref();
            assert!(entry.is_in_hot());
            let stamp = entry.stamp.load(Ordering::Relaxed);
            assert!(stamp > NO_STAMP && (stamp as usize) < hot.capacity());
            assert!(hot.avail[stamp as usize]);

            assert_eq!(hot.lookup(b"hot", 0xdead_beef, 0), Some(e));
            assert_eq!(hot.lookup(b"cold", 0xdead_beef, 0), None);

            assert_eq!(hot.remove(b"hot", 0xdead_beef, true), Some(e));
            assert!(!e.as_ref().is_in_hot());
            assert_eq!(e.as_ref().stamp.load(Ordering::Relaxed), NO_STAMP);
            free(e);
        }
    }

    #[test]
    fn reinserting_an_indexed_entry_is_a_noop() {
        let mut hot: HotIndex<u32> = HotIndex::new(BITS, 2);
        let e = alloc(b"k", 1);
        unsafe {
            assert!(hot.insert(e).admitted);
            let stamp = e.as_ref().stamp.load(Ordering::Relaxed);
            assert!(hot.insert(e).admitted);
            assert_eq!(hot.len(), 1);
            assert_eq!(e.as_ref().stamp.load(Ordering::Relaxed), stamp);
            hot.remove(b"k", 1, true);
            free(e);
        }
    }

    #[test]
    fn lookup_and_unref_balance_through_remove() {
        let mut hot: HotIndex<u32> = HotIndex::new(BITS, 4);
        let e = alloc(b"key", 99);

        unsafe {
            hot.insert(e);

            // Two lookups from thread 1, one from thread 3, one release
            // from thread 3: net +2.
            hot.lookup(b"key", 99, 1);
            hot.lookup(b"key", 99, 1);
            hot.lookup(b"key", 99, 3);
            hot.unref(e.as_ref(), 3);

            // Unforced removal refuses while the net is nonzero.
            assert_eq!(hot.remove(b"key", 99, false), None);
            assert!(e.as_ref().is_in_hot());

            // Forced removal folds the net into refs.
            assert_eq!(hot.remove(b"key", 99, true), Some(e));
            assert_eq!(e.as_ref().refs, 2);
            free(e);
        }
    }

    #[test]
    fn fold_clamps_negative_net_at_zero() {
        let mut hot: HotIndex<u32> = HotIndex::new(BITS, 2);
        let e = alloc(b"key", 5);
        unsafe {
            hot.insert(e);
            // A release without a prior tallied lookup (the handle came from
            // the slow path before promotion).
            hot.unref(e.as_ref(), 0);
            assert_eq!(hot.remove(b"key", 5, true), Some(e));
            assert_eq!(e.as_ref().refs, 0);
            free(e);
        }
    }

    #[test]
    fn admission_threshold_is_half_capacity() {
        let mut hot: HotIndex<u32> = HotIndex::new(BITS, 2);
        let entries: Vec<_> = (0..9u32)
            .map(|i| alloc(format!("k{i}").as_bytes(), i << 28))
            .collect();

        unsafe {
            // First 8 admit without eviction.
            for &e in entries.iter().take(8) {
                let outcome = hot.insert(e);
                assert!(outcome.admitted);
                assert!(outcome.fifo_victim.is_none());
            }
            assert!(hot.is_full());

            // The 9th evicts the FIFO-oldest to make room.
            let outcome = hot.insert(entries[8]);
            assert!(outcome.admitted);
            let victim = outcome.fifo_victim.expect("oldest entry displaced");
            assert_eq!(victim, entries[0]);
            assert!(!victim.as_ref().is_in_hot());
            assert_eq!(hot.len(), 8);

            for (i, &e) in entries.iter().enumerate().skip(1) {
                assert_eq!(hot.remove(format!("k{i}").as_bytes(), (i as u32) << 28, true), Some(e));
            }
            for e in entries {
                free(e);
            }
        }
    }

    #[test]
    fn evict_fifo_requeues_referenced_entries() {
        let mut hot: HotIndex<u32> = HotIndex::new(BITS, 2);
        let a = alloc(b"a", 0x1000_0000);
        let b = alloc(b"b", 0x2000_0000);

        unsafe {
            hot.insert(a);
            hot.insert(b);
            // `a` is admission-oldest but referenced; `b` is free.
            hot.lookup(b"a", 0x1000_0000, 0);

            let evicted = hot.evict_fifo().expect("b is evictable");
            assert_eq!(evicted, b);
            assert!(a.as_ref().is_in_hot());
            // `a` went back to the queue tail and is still indexed.
            assert_eq!(hot.len(), 1);

            hot.unref(a.as_ref(), 0);
            assert_eq!(hot.evict_fifo(), Some(a));
            assert_eq!(hot.len(), 0);
            free(a);
            free(b);
        }
    }

    #[test]
    fn evict_fifo_skips_stale_queue_pairs() {
        let mut hot: HotIndex<u32> = HotIndex::new(BITS, 2);
        let a = alloc(b"a", 0x1000_0000);
        let b = alloc(b"b", 0x2000_0000);

        unsafe {
            hot.insert(a);
            hot.insert(b);
            // Force-remove `a`: its queue pair goes stale.
            assert_eq!(hot.remove(b"a", 0x1000_0000, true), Some(a));

            // FIFO eviction skips the stale pair and takes `b`.
            assert_eq!(hot.evict_fifo(), Some(b));
            assert_eq!(hot.len(), 0);
            free(a);
            free(b);
        }
    }

    #[test]
    fn stamps_are_recycled() {
        let mut hot: HotIndex<u32> = HotIndex::new(2, 2); // capacity 4, admits 2
        unsafe {
            for round in 0..10u32 {
                let e = alloc(format!("r{round}").as_bytes(), round.rotate_right(4));
                assert!(hot.insert(e).admitted);
                let stamp = e.as_ref().stamp.load(Ordering::Relaxed);
                assert!((stamp as usize) < hot.capacity());
                assert_eq!(
                    hot.remove(format!("r{round}").as_bytes(), round.rotate_right(4), true),
                    Some(e)
                );
                free(e);
            }
            assert!(hot.avail.iter().all(|&used| !used));
        }
    }
}
