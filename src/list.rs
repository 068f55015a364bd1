//! Intrusive LRU list with high- and low-priority pools.
//!
//! ## Architecture
//!
//! ```text
//!   head (MRU)                                              tail (victim)
//!     │                                                          │
//!     ▼                                                          ▼
//!   ┌────┐      ┌────┐      ┌────┐      ┌────┐      ┌────┐      ┌────┐
//!   │ H1 │◄────►│ H2 │◄────►│ L1 │◄────►│ L2 │◄────►│ L3 │◄────►│ L4 │
//!   └────┘      └────┘      └────┘      └────┘      └────┘      └────┘
//!    high-pri pool   │       ▲
//!                    │       └── low_pri_head: newest low-pri entry
//!                    └── movable boundary
//! ```
//!
//! `next` points toward the eviction end, `prev` toward the MRU end. The
//! low-priority pool occupies the tail side; `low_pri_head` marks its newest
//! entry (null when the pool is empty). High-priority entries are inserted
//! at the MRU head, low-priority entries just in front of `low_pri_head`.
//! When the high-priority pool outgrows its byte budget, the boundary walks
//! toward the head, demoting the entries it crosses.
//!
//! Only entries with no external references live on the list (they are the
//! eviction candidates); an entry in the hot index or held by a caller is
//! detached. `remove` is idempotent: detaching nulls both links, and both
//! links are null iff the entry is off the list.
//!
//! All operations require the owning shard's mutex; the list itself is plain
//! data.

use std::ptr::{self, NonNull};

use crate::entry::Entry;

pub(crate) struct LruList<V> {
    head: *mut Entry<V>,
    tail: *mut Entry<V>,
    /// Newest entry of the low-priority pool; null when the pool is empty.
    low_pri_head: *mut Entry<V>,
    /// Sum of `total_charge` over listed entries.
    lru_usage: usize,
    /// Sum of `total_charge` over listed high-priority-pool entries.
    high_pri_pool_usage: usize,
    len: usize,
    /// Fraction of the shard capacity reserved for the high-priority pool.
    high_pri_pool_ratio: f64,
    /// Byte budget of the high-priority pool.
    high_pri_pool_capacity: usize,
}

impl<V> LruList<V> {
    pub(crate) fn new() -> Self {
        LruList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            low_pri_head: ptr::null_mut(),
            lru_usage: 0,
            high_pri_pool_usage: 0,
            len: 0,
            high_pri_pool_ratio: 0.0,
            high_pri_pool_capacity: 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn lru_usage(&self) -> usize {
        self.lru_usage
    }

    /// MRU-end entry, or null. This is the promotion candidate.
    #[inline]
    pub(crate) fn front(&self) -> *mut Entry<V> {
        self.head
    }

    /// Eviction-end entry, or null. This is the next victim.
    #[inline]
    pub(crate) fn back(&self) -> *mut Entry<V> {
        self.tail
    }

    #[inline]
    pub(crate) fn high_pri_pool_ratio(&self) -> f64 {
        self.high_pri_pool_ratio
    }

    /// Reconfigures the priority-pool split and rebalances the boundary.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard mutex.
    pub(crate) unsafe fn set_pool_params(&mut self, ratio: f64, capacity: usize) {
        self.high_pri_pool_ratio = ratio;
        self.high_pri_pool_capacity = (capacity as f64 * ratio) as usize;
        unsafe { self.maintain_pool_size() };
    }

    /// Links `e` at the position its priority calls for.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard mutex; `e` must be live, off the list, and
    /// not in the hot index.
    pub(crate) unsafe fn insert(&mut self, e: NonNull<Entry<V>>) {
        let p = e.as_ptr();
        unsafe {
            debug_assert!(!(*p).on_lru());
            let charge = (*p).total_charge;
            if self.high_pri_pool_ratio > 0.0 && ((*p).is_high_pri() || (*p).has_hit()) {
                // MRU head of the high-priority pool.
                (*p).prev = ptr::null_mut();
                (*p).next = self.head;
                match NonNull::new(self.head) {
                    Some(mut h) => h.as_mut().prev = p,
                    None => self.tail = p,
                }
                self.head = p;
                (*p).set_in_high_pri_pool(true);
                self.high_pri_pool_usage += charge;
                self.len += 1;
                self.lru_usage += charge;
                self.maintain_pool_size();
            } else {
                // Newest slot of the low-priority pool: just in front of the
                // current low-pri head, or at the very tail if the pool is
                // empty. When no high-priority pool is configured this is
                // the head of the whole list.
                let before = self.low_pri_head;
                if before.is_null() {
                    (*p).prev = self.tail;
                    (*p).next = ptr::null_mut();
                    match NonNull::new(self.tail) {
                        Some(mut t) => t.as_mut().next = p,
                        None => self.head = p,
                    }
                    self.tail = p;
                } else {
                    (*p).prev = (*before).prev;
                    (*p).next = before;
                    match NonNull::new((*before).prev) {
                        Some(mut b) => b.as_mut().next = p,
                        None => self.head = p,
                    }
                    (*before).prev = p;
                }
                (*p).set_in_high_pri_pool(false);
                self.low_pri_head = p;
                self.len += 1;
                self.lru_usage += charge;
            }
        }
    }

    /// Detaches `e`. Idempotent: an entry that is already off the list is
    /// left untouched.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard mutex; `e` must be live.
    pub(crate) unsafe fn remove(&mut self, e: NonNull<Entry<V>>) {
        let p = e.as_ptr();
        unsafe {
            if !(*p).on_lru() {
                return;
            }
            if self.low_pri_head == p {
                // The boundary steps toward the tail; off the end means the
                // low-priority pool is now empty.
                self.low_pri_head = (*p).next;
            }
            match NonNull::new((*p).prev) {
                Some(mut b) => b.as_mut().next = (*p).next,
                None => self.head = (*p).next,
            }
            match NonNull::new((*p).next) {
                Some(mut n) => n.as_mut().prev = (*p).prev,
                None => self.tail = (*p).prev,
            }
            (*p).prev = ptr::null_mut();
            (*p).next = ptr::null_mut();
            let charge = (*p).total_charge;
            debug_assert!(self.lru_usage >= charge);
            self.lru_usage -= charge;
            self.len -= 1;
            if (*p).is_in_high_pri_pool() {
                debug_assert!(self.high_pri_pool_usage >= charge);
                self.high_pri_pool_usage -= charge;
            }
        }
    }

    /// Walks the boundary toward the head, demoting crossed entries, until
    /// the high-priority pool fits its byte budget again.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard mutex.
    pub(crate) unsafe fn maintain_pool_size(&mut self) {
        while self.high_pri_pool_usage > self.high_pri_pool_capacity {
            unsafe {
                let demote = if self.low_pri_head.is_null() {
                    self.tail
                } else {
                    (*self.low_pri_head).prev
                };
                debug_assert!(!demote.is_null(), "high-pri usage implies a high-pri entry");
                (*demote).set_in_high_pri_pool(false);
                self.low_pri_head = demote;
                let charge = (*demote).total_charge;
                debug_assert!(self.high_pri_pool_usage >= charge);
                self.high_pri_pool_usage -= charge;
            }
        }
    }

    /// Validates link and accounting invariants. Test builds only.
    #[cfg(test)]
    pub(crate) unsafe fn debug_validate(&self) {
        unsafe {
            let mut seen = 0usize;
            let mut usage = 0usize;
            let mut high_usage = 0usize;
            let mut low_pri_seen = false;
            let mut p = self.head;
            let mut prev: *mut Entry<V> = ptr::null_mut();
            while !p.is_null() {
                assert_eq!((*p).prev, prev, "prev link mismatch");
                seen += 1;
                assert!(seen <= self.len, "cycle detected in LRU list");
                usage += (*p).total_charge;
                if p == self.low_pri_head {
                    low_pri_seen = true;
                }
                if (*p).is_in_high_pri_pool() {
                    assert!(!low_pri_seen, "high-pri entry on the tail side of the boundary");
                    high_usage += (*p).total_charge;
                }
                prev = p;
                p = (*p).next;
            }
            assert_eq!(prev, self.tail, "tail link mismatch");
            assert_eq!(seen, self.len, "length mismatch");
            assert_eq!(usage, self.lru_usage, "lru_usage mismatch");
            assert_eq!(high_usage, self.high_pri_pool_usage, "pool usage mismatch");
            assert!(
                self.low_pri_head.is_null() || low_pri_seen,
                "low_pri_head not on list"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Priority;

    fn alloc(charge: usize, priority: Priority) -> NonNull<Entry<u32>> {
        let e = Entry::new(b"k", 0, Some(0u32), charge, charge, priority, false);
        NonNull::new(Box::into_raw(Box::new(e))).unwrap()
    }

    unsafe fn free_all(entries: Vec<NonNull<Entry<u32>>>) {
        for e in entries {
            drop(Box::from_raw(e.as_ptr()));
        }
    }

    unsafe fn collect(list: &LruList<u32>) -> Vec<*mut Entry<u32>> {
        let mut out = Vec::new();
        let mut p = list.front();
        while !p.is_null() {
            out.push(p);
            p = (*p).next;
        }
        out
    }

    #[test]
    fn low_pri_inserts_stack_mru_first() {
        let mut list: LruList<u32> = LruList::new();
        let a = alloc(1, Priority::Low);
        let b = alloc(1, Priority::Low);
        let c = alloc(1, Priority::Low);

        unsafe {
            list.insert(a);
            list.insert(b);
            list.insert(c);
            list.debug_validate();
            // Most recent insert is at the MRU end, first insert is the victim.
            assert_eq!(collect(&list), vec![c.as_ptr(), b.as_ptr(), a.as_ptr()]);
            assert_eq!(list.back(), a.as_ptr());
            assert_eq!(list.lru_usage(), 3);

            list.remove(b);
            list.debug_validate();
            assert_eq!(collect(&list), vec![c.as_ptr(), a.as_ptr()]);

            // Removal is idempotent.
            list.remove(b);
            assert_eq!(list.len(), 2);

            list.remove(a);
            list.remove(c);
            assert!(list.is_empty());
            free_all(vec![a, b, c]);
        }
    }

    #[test]
    fn high_pri_entries_go_to_head_of_list() {
        let mut list: LruList<u32> = LruList::new();
        unsafe {
            list.set_pool_params(0.5, 100);
        }
        let low = alloc(10, Priority::Low);
        let high = alloc(10, Priority::High);
        let low2 = alloc(10, Priority::Low);

        unsafe {
            list.insert(low);
            list.insert(high);
            list.insert(low2);
            list.debug_validate();
            // High-pri leads; low-pri entries stack in their own pool.
            assert_eq!(
                collect(&list),
                vec![high.as_ptr(), low2.as_ptr(), low.as_ptr()]
            );
            assert!((*high.as_ptr()).is_in_high_pri_pool());
            assert!(!(*low.as_ptr()).is_in_high_pri_pool());

            list.remove(low);
            list.remove(low2);
            list.remove(high);
            free_all(vec![low, high, low2]);
        }
    }

    #[test]
    fn pool_overflow_demotes_oldest_high_pri() {
        let mut list: LruList<u32> = LruList::new();
        unsafe {
            list.set_pool_params(0.2, 100); // 20-byte high-pri budget
        }
        let h1 = alloc(15, Priority::High);
        let h2 = alloc(15, Priority::High);

        unsafe {
            list.insert(h1);
            list.debug_validate();
            assert!((*h1.as_ptr()).is_in_high_pri_pool());

            // Second high-pri insert blows the 20-byte budget; the oldest
            // high-pri entry is demoted into the low-pri pool.
            list.insert(h2);
            list.debug_validate();
            assert!((*h2.as_ptr()).is_in_high_pri_pool());
            assert!(!(*h1.as_ptr()).is_in_high_pri_pool());
            assert_eq!(list.back(), h1.as_ptr());

            list.remove(h1);
            list.remove(h2);
            free_all(vec![h1, h2]);
        }
    }

    #[test]
    fn zero_ratio_ignores_priority() {
        let mut list: LruList<u32> = LruList::new();
        let h = alloc(5, Priority::High);
        let l = alloc(5, Priority::Low);

        unsafe {
            list.insert(h);
            list.insert(l);
            list.debug_validate();
            // Without a high-pri pool everything is recency-ordered.
            assert_eq!(collect(&list), vec![l.as_ptr(), h.as_ptr()]);
            assert!(!(*h.as_ptr()).is_in_high_pri_pool());

            list.remove(h);
            list.remove(l);
            free_all(vec![h, l]);
        }
    }

    #[test]
    fn boundary_follows_removals() {
        let mut list: LruList<u32> = LruList::new();
        unsafe {
            list.set_pool_params(0.5, 100);
        }
        let l1 = alloc(10, Priority::Low);
        let l2 = alloc(10, Priority::Low);
        let h = alloc(10, Priority::High);

        unsafe {
            list.insert(l1);
            list.insert(l2);
            list.insert(h);
            // Boundary sits at the newest low-pri entry.
            assert_eq!(list.low_pri_head, l2.as_ptr());

            list.remove(l2);
            list.debug_validate();
            assert_eq!(list.low_pri_head, l1.as_ptr());

            list.remove(l1);
            list.debug_validate();
            assert!(list.low_pri_head.is_null());

            list.remove(h);
            free_all(vec![l1, l2, h]);
        }
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::entry::Priority;
    use proptest::prelude::*;
    use std::ptr::NonNull;

    // =========================================================================
    // Property Tests - Link & Accounting Invariants
    // =========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Insert { charge: usize, high: bool },
        RemoveBack,
        RemoveFront,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..64, any::<bool>()).prop_map(|(charge, high)| Op::Insert { charge, high }),
            Just(Op::RemoveBack),
            Just(Op::RemoveFront),
        ]
    }

    proptest! {
        /// Property: any interleaving of inserts and removals keeps the
        /// link structure, length, and usage accounting consistent.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_list_invariants_hold(
            ratio in prop_oneof![Just(0.0), Just(0.25), Just(0.5)],
            ops in prop::collection::vec(op_strategy(), 1..200)
        ) {
            let mut list: LruList<u32> = LruList::new();
            unsafe { list.set_pool_params(ratio, 100) };
            let mut live: Vec<NonNull<Entry<u32>>> = Vec::new();
            let mut all: Vec<NonNull<Entry<u32>>> = Vec::new();

            for op in ops {
                unsafe {
                    match op {
                        Op::Insert { charge, high } => {
                            let priority = if high { Priority::High } else { Priority::Low };
                            let e = Entry::new(b"p", 0, Some(0u32), charge, charge, priority, false);
                            let e = NonNull::new(Box::into_raw(Box::new(e))).unwrap();
                            list.insert(e);
                            live.push(e);
                            all.push(e);
                        },
                        Op::RemoveBack => {
                            if let Some(back) = NonNull::new(list.back()) {
                                list.remove(back);
                                live.retain(|&e| e != back);
                            }
                        },
                        Op::RemoveFront => {
                            if let Some(front) = NonNull::new(list.front()) {
                                list.remove(front);
                                live.retain(|&e| e != front);
                            }
                        },
                    }
                    list.debug_validate();
                }
            }

            prop_assert_eq!(list.len(), live.len());
            let expected: usize = live.iter().map(|e| unsafe { e.as_ref().total_charge }).collect::<Vec<_>>().iter().sum();
            prop_assert_eq!(list.lru_usage(), expected);

            unsafe {
                for e in all {
                    drop(Box::from_raw(e.as_ptr()));
                }
            }
        }
    }
}
