//! Dense thread-id registry for the hot index's per-thread reference tally.
//!
//! Each worker thread that touches the lock-free fast path should call
//! [`ThreadRegistry::register_current`] once at startup to claim a dense id
//! in `[0, slots)`. The id selects the thread's column in the tally matrix.
//! Unregistered threads (and threads beyond the configured slot count) map
//! to column 0, which under-counts per-thread contention but never loses a
//! reference: column sums stay correct because every `+1` and `−1` from the
//! same thread lands in the same cell.
//!
//! The registry is append-only after startup; the hot path takes only the
//! read lock.

use std::thread::{self, ThreadId};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Maps OS thread identities to dense ids in `[0, slots)`.
#[derive(Debug)]
pub struct ThreadRegistry {
    ids: RwLock<FxHashMap<ThreadId, usize>>,
    slots: usize,
}

impl ThreadRegistry {
    /// Creates a registry with `slots` dense ids available.
    pub fn new(slots: usize) -> Self {
        ThreadRegistry {
            ids: RwLock::new(FxHashMap::default()),
            slots: slots.max(1),
        }
    }

    /// Number of dense ids this registry can hand out.
    #[inline]
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Registers the calling thread and returns its dense id.
    ///
    /// Idempotent: re-registering returns the id assigned first. When all
    /// slots are taken, the thread shares id 0.
    pub fn register_current(&self) -> usize {
        let me = thread::current().id();
        if let Some(&id) = self.ids.read().get(&me) {
            return id;
        }
        let mut ids = self.ids.write();
        if let Some(&id) = ids.get(&me) {
            return id;
        }
        let next = ids.len();
        if next >= self.slots {
            return 0;
        }
        ids.insert(me, next);
        next
    }

    /// Dense id of the calling thread; 0 if it never registered.
    #[inline]
    pub fn current(&self) -> usize {
        self.ids
            .read()
            .get(&thread::current().id())
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unregistered_thread_maps_to_zero() {
        let registry = ThreadRegistry::new(4);
        assert_eq!(registry.current(), 0);
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = ThreadRegistry::new(4);
        let a = registry.register_current();
        let b = registry.register_current();
        assert_eq!(a, b);
        assert_eq!(registry.current(), a);
    }

    #[test]
    fn ids_are_dense_and_distinct() {
        let registry = Arc::new(ThreadRegistry::new(8));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || registry.register_current()));
        }
        let mut ids: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.push(registry.register_current());
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5, "each thread should get its own id");
        assert!(ids.iter().all(|&id| id < registry.slots()));
    }

    #[test]
    fn overflow_threads_share_zero() {
        let registry = Arc::new(ThreadRegistry::new(1));
        registry.register_current();
        let id = {
            let registry = registry.clone();
            thread::spawn(move || registry.register_current())
                .join()
                .unwrap()
        };
        assert_eq!(id, 0);
    }
}
