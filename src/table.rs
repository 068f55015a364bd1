//! Primary hash index of a shard.
//!
//! ## Architecture
//!
//! ```text
//!   EntryTable
//!   ┌───────────────────────────────────────────────────────────────┐
//!   │ current ──► BucketArray { bits: L, slots: [AtomicPtr; 2^L] }  │
//!   │                                                               │
//!   │   slot = hash >> (32 − L)                                     │
//!   │                                                               │
//!   │   slots[i] ──► Entry ──next_hash──► Entry ──next_hash──► ∅    │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Closed-addressing table keyed by `(hash, key)`; collisions chain through
//! `Entry::next_hash`. The bucket count doubles once the element count
//! reaches it, up to `max_length_bits` (derived from the shard-bit count —
//! growing past that would spread the same hash information over more
//! buckets for no gain). A capped table simply runs overloaded; chains
//! lengthen but every operation stays correct.
//!
//! ## Concurrency
//!
//! All mutation happens under the owning shard's mutex. Chain links and the
//! bucket-array pointer are atomics so that the hot-path negative filter may
//! [`lookup`](EntryTable::lookup) concurrently while holding only the shard's
//! hot-index read lock. Unlinked entries and retired bucket arrays are
//! reclaimed only after a hot-index write-lock barrier, which drains every
//! in-flight reader; a probe that races a rehash can therefore follow stale
//! links, which at worst yields a spurious miss, never a dangling read.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::entry::Entry;

/// Historical starting size: 16 buckets.
const INITIAL_LENGTH_BITS: u32 = 4;

/// One power-of-two generation of buckets.
pub(crate) struct BucketArray<V> {
    bits: u32,
    slots: Box<[AtomicPtr<Entry<V>>]>,
}

impl<V> BucketArray<V> {
    fn boxed(bits: u32) -> Box<Self> {
        let mut slots = Vec::with_capacity(1 << bits);
        slots.resize_with(1 << bits, || AtomicPtr::new(ptr::null_mut()));
        Box::new(BucketArray {
            bits,
            slots: slots.into_boxed_slice(),
        })
    }

    #[inline]
    fn slot_of(&self, hash: u32) -> &AtomicPtr<Entry<V>> {
        &self.slots[(hash >> (32 - self.bits)) as usize]
    }
}

/// The authoritative per-shard index from `(hash, key)` to entries.
pub(crate) struct EntryTable<V> {
    current: AtomicPtr<BucketArray<V>>,
    elems: AtomicU32,
    max_length_bits: u32,
}

impl<V> EntryTable<V> {
    /// `max_upper_hash_bits` caps the bucket-array size; the shard passes
    /// `32 − num_shard_bits` since the low bits select the shard.
    pub(crate) fn new(max_upper_hash_bits: u32) -> Self {
        EntryTable {
            current: AtomicPtr::new(Box::into_raw(BucketArray::boxed(INITIAL_LENGTH_BITS))),
            elems: AtomicU32::new(0),
            max_length_bits: max_upper_hash_bits,
        }
    }

    /// Number of entries currently indexed.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.elems.load(Ordering::Relaxed) as usize
    }

    /// Walks the bucket chain for `(hash, key)` and returns the link whose
    /// target is the matching entry, or the null link at the chain's end.
    fn find_link<'a>(arr: &'a BucketArray<V>, key: &[u8], hash: u32) -> &'a AtomicPtr<Entry<V>> {
        let mut link = arr.slot_of(hash);
        loop {
            let p = link.load(Ordering::Acquire);
            if p.is_null() {
                return link;
            }
            // SAFETY: `p` was published with release ordering and is kept
            // alive by the reclaim protocol (see module docs).
            let e: &'a Entry<V> = unsafe { &*p };
            if e.hash == hash && &*e.key == key {
                return link;
            }
            link = &e.next_hash;
        }
    }

    /// Finds the entry for `(hash, key)`.
    ///
    /// # Safety
    ///
    /// The caller must hold either the shard mutex or the shard's hot-index
    /// read lock, so that chain memory reclaimed by the shard cannot be
    /// freed mid-walk.
    pub(crate) unsafe fn lookup(&self, key: &[u8], hash: u32) -> Option<NonNull<Entry<V>>> {
        let arr = unsafe { &*self.current.load(Ordering::Acquire) };
        NonNull::new(Self::find_link(arr, key, hash).load(Ordering::Acquire))
    }

    /// Indexes `e`, displacing and returning any previous entry with the
    /// same key. Grows the table when the element count reaches the bucket
    /// count; a displaced bucket array is pushed onto `retired` for the
    /// caller to free after its reclaim barrier.
    ///
    /// # Safety
    ///
    /// The caller must hold the shard mutex. `e` must point to a live entry
    /// not currently in the table.
    pub(crate) unsafe fn insert(
        &self,
        e: NonNull<Entry<V>>,
        retired: &mut Vec<*mut BucketArray<V>>,
    ) -> Option<NonNull<Entry<V>>> {
        let arr = unsafe { &*self.current.load(Ordering::Relaxed) };
        let new = unsafe { e.as_ref() };
        let link = Self::find_link(arr, &new.key, new.hash);
        let old = link.load(Ordering::Relaxed);
        let chain_next = if old.is_null() {
            ptr::null_mut()
        } else {
            // The new entry takes the old one's chain position.
            unsafe { (*old).next_hash.load(Ordering::Relaxed) }
        };
        new.next_hash.store(chain_next, Ordering::Relaxed);
        link.store(e.as_ptr(), Ordering::Release);
        if old.is_null() {
            let elems = self.elems.fetch_add(1, Ordering::Relaxed) + 1;
            // Entries are large; aim for an average chain length <= 1.
            if elems as usize >= arr.slots.len() {
                unsafe { self.grow(retired) };
            }
            None
        } else {
            NonNull::new(old)
        }
    }

    /// Unlinks and returns the entry for `(hash, key)`, if present.
    ///
    /// # Safety
    ///
    /// The caller must hold the shard mutex.
    pub(crate) unsafe fn remove(&self, key: &[u8], hash: u32) -> Option<NonNull<Entry<V>>> {
        let arr = unsafe { &*self.current.load(Ordering::Relaxed) };
        let link = Self::find_link(arr, key, hash);
        let p = link.load(Ordering::Relaxed);
        if p.is_null() {
            return None;
        }
        let next = unsafe { (*p).next_hash.load(Ordering::Relaxed) };
        link.store(next, Ordering::Release);
        self.elems.fetch_sub(1, Ordering::Relaxed);
        NonNull::new(p)
    }

    /// Doubles the bucket count and relinks every entry.
    ///
    /// Concurrent probes keep walking the old array (and possibly freshly
    /// rewritten `next_hash` links); chains stay acyclic at every step, so a
    /// racing probe terminates, at worst missing an entry it raced past.
    unsafe fn grow(&self, retired: &mut Vec<*mut BucketArray<V>>) {
        let old_ptr = self.current.load(Ordering::Relaxed);
        let old = unsafe { &*old_ptr };
        if old.bits >= self.max_length_bits || old.bits >= 31 {
            return;
        }
        let new = BucketArray::boxed(old.bits + 1);
        for slot in old.slots.iter() {
            let mut p = slot.load(Ordering::Relaxed);
            while !p.is_null() {
                let e = unsafe { &*p };
                let next = e.next_hash.load(Ordering::Relaxed);
                let target = new.slot_of(e.hash);
                e.next_hash.store(target.load(Ordering::Relaxed), Ordering::Relaxed);
                target.store(p, Ordering::Release);
                p = next;
            }
        }
        self.current.store(Box::into_raw(new), Ordering::Release);
        retired.push(old_ptr);
    }

    /// Visits every indexed entry.
    ///
    /// # Safety
    ///
    /// The caller must hold the shard mutex and must not mutate the table
    /// from within `f`.
    pub(crate) unsafe fn for_each(&self, mut f: impl FnMut(NonNull<Entry<V>>)) {
        let arr = unsafe { &*self.current.load(Ordering::Relaxed) };
        for slot in arr.slots.iter() {
            let mut p = slot.load(Ordering::Relaxed);
            while let Some(e) = NonNull::new(p) {
                p = unsafe { e.as_ref() }.next_hash.load(Ordering::Relaxed);
                f(e);
            }
        }
    }
}

impl<V> Drop for EntryTable<V> {
    fn drop(&mut self) {
        // Entries are owned and freed by the shard; only the bucket array
        // belongs to the table.
        let arr = self.current.load(Ordering::Relaxed);
        if !arr.is_null() {
            unsafe { drop(Box::from_raw(arr)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Priority;

    fn alloc(key: &[u8], hash: u32) -> NonNull<Entry<u64>> {
        let e = Entry::new(key, hash, Some(0u64), 1, 1, Priority::Low, false);
        NonNull::new(Box::into_raw(Box::new(e))).unwrap()
    }

    unsafe fn free(e: NonNull<Entry<u64>>) {
        drop(Box::from_raw(e.as_ptr()));
    }

    fn free_retired(retired: Vec<*mut BucketArray<u64>>) {
        for arr in retired {
            unsafe { drop(Box::from_raw(arr)) };
        }
    }

    #[test]
    fn insert_lookup_remove_roundtrip() {
        let table: EntryTable<u64> = EntryTable::new(28);
        let mut retired = Vec::new();
        let e = alloc(b"alpha", 0x8000_0000);

        unsafe {
            assert!(table.insert(e, &mut retired).is_none());
            assert_eq!(table.len(), 1);
            assert_eq!(table.lookup(b"alpha", 0x8000_0000), Some(e));
            assert_eq!(table.lookup(b"alpha", 0x8000_0001), None);
            assert_eq!(table.lookup(b"beta", 0x8000_0000), None);

            assert_eq!(table.remove(b"alpha", 0x8000_0000), Some(e));
            assert_eq!(table.len(), 0);
            assert_eq!(table.lookup(b"alpha", 0x8000_0000), None);
            free(e);
        }
        free_retired(retired);
    }

    #[test]
    fn insert_displaces_same_key() {
        let table: EntryTable<u64> = EntryTable::new(28);
        let mut retired = Vec::new();
        let first = alloc(b"key", 42);
        let second = alloc(b"key", 42);

        unsafe {
            assert!(table.insert(first, &mut retired).is_none());
            assert_eq!(table.insert(second, &mut retired), Some(first));
            // The displaced entry is unlinked, not freed.
            assert_eq!(table.len(), 1);
            assert_eq!(table.lookup(b"key", 42), Some(second));

            assert_eq!(table.remove(b"key", 42), Some(second));
            free(first);
            free(second);
        }
        free_retired(retired);
    }

    #[test]
    fn colliding_bucket_chains_resolve_by_key() {
        let table: EntryTable<u64> = EntryTable::new(28);
        let mut retired = Vec::new();
        // Same top bits, so both land in one bucket of the 16-slot table.
        let a = alloc(b"a", 0x1000_0001);
        let b = alloc(b"b", 0x1000_0002);

        unsafe {
            table.insert(a, &mut retired);
            table.insert(b, &mut retired);
            assert_eq!(table.lookup(b"a", 0x1000_0001), Some(a));
            assert_eq!(table.lookup(b"b", 0x1000_0002), Some(b));

            assert_eq!(table.remove(b"a", 0x1000_0001), Some(a));
            assert_eq!(table.lookup(b"b", 0x1000_0002), Some(b));
            assert_eq!(table.remove(b"b", 0x1000_0002), Some(b));
            free(a);
            free(b);
        }
        free_retired(retired);
    }

    #[test]
    fn growth_keeps_all_entries_reachable() {
        let table: EntryTable<u64> = EntryTable::new(28);
        let mut retired = Vec::new();
        let count = 200u32;
        let entries: Vec<_> = (0..count)
            .map(|i| alloc(format!("key-{i}").as_bytes(), i.wrapping_mul(0x9e37_79b9)))
            .collect();

        unsafe {
            for &e in &entries {
                table.insert(e, &mut retired);
            }
            assert_eq!(table.len(), count as usize);
            assert!(!retired.is_empty(), "growth should retire old arrays");

            for (i, &e) in entries.iter().enumerate() {
                let key = format!("key-{i}");
                let hash = (i as u32).wrapping_mul(0x9e37_79b9);
                assert_eq!(table.lookup(key.as_bytes(), hash), Some(e));
            }

            let mut seen = 0;
            table.for_each(|_| seen += 1);
            assert_eq!(seen, count as usize);

            for (i, &e) in entries.iter().enumerate() {
                let key = format!("key-{i}");
                let hash = (i as u32).wrapping_mul(0x9e37_79b9);
                assert_eq!(table.remove(key.as_bytes(), hash), Some(e));
                free(e);
            }
        }
        free_retired(retired);
    }

    #[test]
    fn growth_is_capped_by_max_length_bits() {
        // Cap at the initial size: the table must stay at 16 buckets and
        // simply run overloaded.
        let table: EntryTable<u64> = EntryTable::new(INITIAL_LENGTH_BITS);
        let mut retired = Vec::new();
        let entries: Vec<_> = (0..64u32)
            .map(|i| alloc(format!("k{i}").as_bytes(), i.rotate_left(27)))
            .collect();

        unsafe {
            for &e in &entries {
                table.insert(e, &mut retired);
            }
            assert!(retired.is_empty(), "capped table must not grow");
            for (i, &e) in entries.iter().enumerate() {
                let key = format!("k{i}");
                assert_eq!(table.lookup(key.as_bytes(), (i as u32).rotate_left(27)), Some(e));
            }
            for (i, &e) in entries.iter().enumerate() {
                let key = format!("k{i}");
                table.remove(key.as_bytes(), (i as u32).rotate_left(27));
                free(e);
            }
        }
    }
}
