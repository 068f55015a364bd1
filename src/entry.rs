//! Cache entry record and the user-facing pinned handle.
//!
//! ## Architecture
//!
//! ```text
//!   ┌───────────────────────────────────────────────────────────────┐
//!   │                         Entry<V>                              │
//!   ├───────────────────────────────────────────────────────────────┤
//!   │  hash, charge, total_charge        │  immutable after publish │
//!   │  key: Box<[u8]>, value: Option<V>  │  immutable after publish │
//!   ├────────────────────────────────────┼──────────────────────────┤
//!   │  refs, prev, next                  │  shard mutex only        │
//!   ├────────────────────────────────────┼──────────────────────────┤
//!   │  next_hash, next_hot (AtomicPtr)   │  written under locks,    │
//!   │  stamp (AtomicI32), flags (bitset) │  readable lock-free      │
//!   └────────────────────────────────────┴──────────────────────────┘
//! ```
//!
//! One `Entry` exists per cached key. The entry is reachable from the primary
//! table for as long as it is in cache; the LRU links, hot-index chain link
//! and stamp describe which of the shard's structures currently index it.
//!
//! Fields fall into three concurrency classes. Immutable fields are written
//! once before the entry is published to the primary table. Plain mutable
//! fields (`refs`, LRU links) are only touched while the owning shard's mutex
//! is held. Atomic fields may be read by the lock-free fast path while a
//! writer holding the appropriate lock mutates them.
//!
//! ## Thread Safety
//!
//! `Entry` itself is never handed to users; [`EntryHandle`] is the public
//! pinned view. A handle keeps the entry alive via the external reference
//! count (or, for hot-index entries, the per-thread reference tally) until it
//! is passed back to [`BlockCache::release`](crate::cache::BlockCache::release).

use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU16, Ordering};

use crate::secondary::SecondaryResult;

/// Insertion priority of a cache entry.
///
/// High-priority entries are inserted into the high-priority pool of the LRU
/// list (when a high-priority pool is configured), which biases eviction
/// toward recently-inserted but never-hit low-priority entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Evict-first pool.
    #[default]
    Low,
    /// Evict-last pool.
    High,
}

/// Sentinel stamp meaning "not in the hot index".
///
/// Stamp 0 is a valid hot-index stamp; only −1 means "no stamp".
pub(crate) const NO_STAMP: i32 = -1;

pub(crate) mod flag {
    pub const IN_CACHE: u16 = 1 << 0;
    pub const IN_HIGH_PRI_POOL: u16 = 1 << 1;
    pub const HAS_HIT: u16 = 1 << 2;
    pub const HIGH_PRI: u16 = 1 << 3;
    pub const SECONDARY_COMPATIBLE: u16 = 1 << 4;
    pub const INCOMPLETE: u16 = 1 << 5;
    pub const PROMOTED: u16 = 1 << 6;
    pub const PENDING: u16 = 1 << 7;
    pub const IN_HOT: u16 = 1 << 8;
    /// Set while the entry's charge is counted against shard usage.
    pub const CHARGED: u16 = 1 << 9;
}

/// One cached key/value pair, with the intrusive links used by the primary
/// table, the LRU list and the hot index.
pub(crate) struct Entry<V> {
    pub hash: u32,
    /// Caller-supplied charge.
    pub charge: usize,
    /// Charge plus optional metadata overhead; the unit of capacity
    /// accounting. Precomputed at construction so accounting never
    /// recomputes it.
    pub total_charge: usize,
    /// External reference count, excluding the LRU's implicit reference.
    /// Guarded by the shard mutex.
    pub refs: u32,
    /// LRU neighbor toward the MRU end. Guarded by the shard mutex.
    /// Null iff `next` is null iff the entry is off the LRU list.
    pub prev: *mut Entry<V>,
    /// LRU neighbor toward the eviction end. Guarded by the shard mutex.
    pub next: *mut Entry<V>,
    /// Primary-table bucket chain. Written under the shard mutex, read by
    /// the lock-free probe.
    pub next_hash: AtomicPtr<Entry<V>>,
    /// Hot-index bucket chain. Written under the hot-index write lock, read
    /// under the read lock. Meaningful only while `IN_HOT` is set.
    pub next_hot: AtomicPtr<Entry<V>>,
    /// Hot-index stamp, or [`NO_STAMP`]. Written under the hot-index write
    /// lock; snapshotted by lock-free readers.
    pub stamp: AtomicI32,
    flags: AtomicU16,
    pub key: Box<[u8]>,
    /// `None` only while a secondary-cache fetch is pending (or failed).
    pub value: Option<V>,
    /// Outstanding secondary-cache result for a pending lookup. Owned
    /// exclusively by the single handle of an unpublished entry.
    pub pending: Option<Box<dyn SecondaryResult<V>>>,
}

impl<V> Entry<V> {
    pub(crate) fn new(
        key: &[u8],
        hash: u32,
        value: Option<V>,
        charge: usize,
        total_charge: usize,
        priority: Priority,
        secondary_compatible: bool,
    ) -> Self {
        let mut flags = 0u16;
        if priority == Priority::High {
            flags |= flag::HIGH_PRI;
        }
        if secondary_compatible {
            flags |= flag::SECONDARY_COMPATIBLE;
        }
        Entry {
            hash,
            charge,
            total_charge,
            refs: 0,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            next_hash: AtomicPtr::new(ptr::null_mut()),
            next_hot: AtomicPtr::new(ptr::null_mut()),
            stamp: AtomicI32::new(NO_STAMP),
            flags: AtomicU16::new(flags),
            key: key.to_vec().into_boxed_slice(),
            value,
            pending: None,
        }
    }

    #[inline]
    fn get_flag(&self, bit: u16) -> bool {
        self.flags.load(Ordering::Relaxed) & bit != 0
    }

    #[inline]
    fn put_flag(&self, bit: u16, on: bool) {
        if on {
            self.flags.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn is_in_cache(&self) -> bool {
        self.get_flag(flag::IN_CACHE)
    }

    #[inline]
    pub(crate) fn set_in_cache(&self, on: bool) {
        self.put_flag(flag::IN_CACHE, on);
    }

    #[inline]
    pub(crate) fn is_in_high_pri_pool(&self) -> bool {
        self.get_flag(flag::IN_HIGH_PRI_POOL)
    }

    #[inline]
    pub(crate) fn set_in_high_pri_pool(&self, on: bool) {
        self.put_flag(flag::IN_HIGH_PRI_POOL, on);
    }

    #[inline]
    pub(crate) fn has_hit(&self) -> bool {
        self.get_flag(flag::HAS_HIT)
    }

    #[inline]
    pub(crate) fn set_has_hit(&self) {
        self.put_flag(flag::HAS_HIT, true);
    }

    #[inline]
    pub(crate) fn is_high_pri(&self) -> bool {
        self.get_flag(flag::HIGH_PRI)
    }

    #[inline]
    pub(crate) fn is_secondary_compatible(&self) -> bool {
        self.get_flag(flag::SECONDARY_COMPATIBLE)
    }

    #[inline]
    pub(crate) fn is_pending(&self) -> bool {
        self.get_flag(flag::PENDING)
    }

    #[inline]
    pub(crate) fn set_pending(&self, on: bool) {
        self.put_flag(flag::PENDING | flag::INCOMPLETE, on);
    }

    #[inline]
    pub(crate) fn is_promoted(&self) -> bool {
        self.get_flag(flag::PROMOTED)
    }

    #[inline]
    pub(crate) fn set_promoted(&self) {
        self.put_flag(flag::PROMOTED, true);
    }

    #[inline]
    pub(crate) fn is_in_hot(&self) -> bool {
        self.get_flag(flag::IN_HOT)
    }

    #[inline]
    pub(crate) fn set_in_hot(&self, on: bool) {
        self.put_flag(flag::IN_HOT, on);
    }

    #[inline]
    pub(crate) fn is_charged(&self) -> bool {
        self.get_flag(flag::CHARGED)
    }

    #[inline]
    pub(crate) fn set_charged(&self, on: bool) {
        self.put_flag(flag::CHARGED, on);
    }

    /// True iff the entry is linked on the LRU list.
    #[inline]
    pub(crate) fn on_lru(&self) -> bool {
        debug_assert_eq!(self.prev.is_null(), self.next.is_null());
        !self.next.is_null()
    }
}

// ---------------------------------------------------------------------------
// EntryHandle
// ---------------------------------------------------------------------------

/// A pinned reference to a cache entry.
///
/// Returned by [`lookup`](crate::cache::BlockCache::lookup) and
/// [`insert_pinned`](crate::cache::BlockCache::insert_pinned). The entry's
/// value cannot be freed while the handle is live; the handle must be given
/// back with [`release`](crate::cache::BlockCache::release) (it is
/// deliberately not `Clone` — additional references come from
/// [`add_ref`](crate::cache::BlockCache::add_ref)).
///
/// The lifetime parameter ties the handle to the cache that produced it, so
/// a handle cannot outlive its cache.
pub struct EntryHandle<'c, V> {
    ptr: NonNull<Entry<V>>,
    _cache: PhantomData<&'c ()>,
}

// SAFETY: a handle only grants shared access to the entry's immutable fields
// (key, hash, charge, value); all mutable state behind the pointer is either
// atomic or guarded by the owning shard's locks. The entry cannot be freed
// while the handle is live. V: Send + Sync is required because the value may
// be read from, and the handle released on, any thread.
unsafe impl<V: Send + Sync> Send for EntryHandle<'_, V> {}
unsafe impl<V: Send + Sync> Sync for EntryHandle<'_, V> {}

impl<'c, V> EntryHandle<'c, V> {
    #[inline]
    pub(crate) fn new(ptr: NonNull<Entry<V>>) -> Self {
        EntryHandle {
            ptr,
            _cache: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn entry_ptr(&self) -> NonNull<Entry<V>> {
        self.ptr
    }

    #[inline]
    fn entry(&self) -> &Entry<V> {
        // SAFETY: the reference count (or hot-index tally) pins the entry for
        // the handle's lifetime.
        unsafe { self.ptr.as_ref() }
    }

    /// The entry's key bytes.
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.entry().key
    }

    /// The 32-bit hash the entry was inserted with.
    #[inline]
    pub fn hash(&self) -> u32 {
        self.entry().hash
    }

    /// The caller-supplied charge of the entry.
    #[inline]
    pub fn charge(&self) -> usize {
        self.entry().charge
    }

    /// The cached value, if available.
    ///
    /// Returns `None` for a handle whose secondary-cache fetch is still
    /// pending (see [`BlockCache::wait_all`](crate::cache::BlockCache::wait_all))
    /// or failed.
    #[inline]
    pub fn try_value(&self) -> Option<&V> {
        self.entry().value.as_ref()
    }

    /// The cached value.
    ///
    /// # Panics
    ///
    /// Panics if the value is not available; see [`try_value`](Self::try_value).
    #[inline]
    pub fn value(&self) -> &V {
        match self.entry().value.as_ref() {
            Some(v) => v,
            None => panic!("value() called on a handle without a resolved value"),
        }
    }

    /// False while a secondary-cache fetch for this handle is outstanding.
    #[inline]
    pub fn is_ready(&self) -> bool {
        !self.entry().is_pending()
    }
}

impl<V> std::fmt::Debug for EntryHandle<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("hash", &self.hash())
            .field("charge", &self.charge())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip() {
        let e: Entry<u32> = Entry::new(b"k", 7, Some(1), 10, 10, Priority::High, false);
        assert!(e.is_high_pri());
        assert!(!e.is_in_cache());

        e.set_in_cache(true);
        assert!(e.is_in_cache());
        e.set_in_cache(false);
        assert!(!e.is_in_cache());

        e.set_in_hot(true);
        assert!(e.is_in_hot());
        assert!(!e.is_in_high_pri_pool());
    }

    #[test]
    fn new_entry_is_off_lru_with_no_stamp() {
        let e: Entry<u32> = Entry::new(b"key", 1, Some(9), 4, 4, Priority::Low, false);
        assert!(!e.on_lru());
        assert_eq!(e.stamp.load(Ordering::Relaxed), NO_STAMP);
        assert_eq!(e.refs, 0);
        assert_eq!(&*e.key, b"key");
    }

    #[test]
    fn pending_flag_covers_incomplete() {
        let e: Entry<u32> = Entry::new(b"k", 0, None, 0, 0, Priority::Low, true);
        assert!(e.is_secondary_compatible());
        e.set_pending(true);
        assert!(e.is_pending());
        e.set_pending(false);
        assert!(!e.is_pending());
    }
}
