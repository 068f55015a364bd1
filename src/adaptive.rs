//! Adaptive controller state for the hot index.
//!
//! Each shard samples its own hit rate two ways: `totalhit`/`nohit` count
//! real fast-path probes, while `virtual_totalhit`/`virtual_nohit` (kept
//! under the shard mutex) measure what the fast path *would* have yielded,
//! sampled on slow-path hits. Every `nlimit` slow-path hits the shard runs a
//! decision: it publishes its hit rate to the [`HitrateBoard`], blends the
//! cross-shard percentile with the configured threshold, and from that
//! decides whether to flush its hot index, how aggressively the fast path
//! may miss before self-disabling (`nsupple`), and whether to re-enable the
//! fast path at all.
//!
//! Blending `(sorted[(n−1)·pctl/100] + pctl) / 2` rather than taking the raw
//! percentile keeps skip decisions meaningful when every shard has a low hit
//! rate, and the per-shard medians are averaged across shards to smooth out
//! skewed or unstable workloads.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Tunables of the hot index and its adaptive controller.
#[derive(Debug, Clone, Copy)]
pub struct HotIndexParams {
    /// log2 of the hot-index bucket count per shard (the index admits up to
    /// half that many entries).
    pub aux_bits: u32,
    /// Columns in the per-thread reference tally; worker threads beyond
    /// this share column 0.
    pub thread_slots: usize,
    /// Slow-path hits between adaptive decisions.
    pub nlimit: u64,
    /// Activation percentile in `[0, 100]`: 0 disables the hot index
    /// entirely, 100 keeps it permanently on.
    pub activate_pctl: u32,
    /// Flush percentile in `[0, 100]`: 0 never flushes.
    pub flush_pctl: u32,
}

impl Default for HotIndexParams {
    fn default() -> Self {
        HotIndexParams {
            aux_bits: 8,
            thread_slots: 16,
            nlimit: 1024,
            activate_pctl: 50,
            flush_pctl: 20,
        }
    }
}

/// Per-shard fast-path counters, readable and writable without the shard
/// mutex. One instance is embedded in each (cacheline-aligned) shard.
#[derive(Debug)]
pub(crate) struct AdaptiveState {
    /// Whether the fast path currently consults the hot index.
    enabled: AtomicBool,
    /// Fast-path probes since the last decision.
    totalhit: AtomicU64,
    /// Fast-path misses since the last decision.
    nohit: AtomicU64,
    /// Miss budget before the fast path self-disables.
    nsupple: AtomicU64,
}

impl AdaptiveState {
    pub(crate) fn new() -> Self {
        AdaptiveState {
            enabled: AtomicBool::new(true),
            totalhit: AtomicU64::new(0),
            nohit: AtomicU64::new(0),
            nsupple: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_probe(&self) {
        self.totalhit.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a fast-path miss; returns true if the miss budget is spent
    /// and the fast path should self-disable.
    #[inline]
    pub(crate) fn record_miss(&self) -> bool {
        let misses = self.nohit.fetch_add(1, Ordering::Relaxed) + 1;
        misses > self.nsupple.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn probes(&self) -> u64 {
        self.totalhit.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn misses(&self) -> u64 {
        self.nohit.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_miss_budget(&self, budget: u64) {
        self.nsupple.store(budget, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn reset_window(&self) {
        self.totalhit.store(0, Ordering::Relaxed);
        self.nohit.store(0, Ordering::Relaxed);
    }
}

/// One cacheline per shard so hitrate publishing never contends.
#[repr(align(64))]
#[derive(Debug, Default)]
struct BoardSlot {
    hitrate: AtomicI64,
    skip_median: AtomicI64,
    flush_median: AtomicI64,
}

/// Cross-shard exchange of per-shard hit rates and blended medians.
///
/// Written by each shard during its own adaptive decision (under that
/// shard's hot-index write lock); read by every shard. Slots are relaxed
/// atomics — decisions tolerate slightly stale peers.
#[derive(Debug)]
pub(crate) struct HitrateBoard {
    slots: Box<[BoardSlot]>,
}

impl HitrateBoard {
    pub(crate) fn new(shards: usize) -> Self {
        let mut slots = Vec::with_capacity(shards);
        slots.resize_with(shards, BoardSlot::default);
        HitrateBoard {
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn publish_hitrate(&self, shard: usize, hitrate: i64) {
        self.slots[shard].hitrate.store(hitrate, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_medians(&self, shard: usize, skip: i64, flush: i64) {
        self.slots[shard].skip_median.store(skip, Ordering::Relaxed);
        self.slots[shard].flush_median.store(flush, Ordering::Relaxed);
    }

    /// All shards' hit rates, sorted ascending. The scratch copy is small
    /// (one i64 per shard) and decisions are rare, so a fresh sort beats
    /// maintaining an order incrementally.
    pub(crate) fn sorted_hitrates(&self) -> Vec<i64> {
        let mut rates: Vec<i64> = self
            .slots
            .iter()
            .map(|slot| slot.hitrate.load(Ordering::Relaxed))
            .collect();
        rates.sort_unstable();
        rates
    }

    pub(crate) fn avg_skip_median(&self) -> i64 {
        let sum: i64 = self
            .slots
            .iter()
            .map(|slot| slot.skip_median.load(Ordering::Relaxed))
            .sum();
        sum / self.slots.len() as i64
    }

    pub(crate) fn avg_flush_median(&self) -> i64 {
        let sum: i64 = self
            .slots
            .iter()
            .map(|slot| slot.flush_median.load(Ordering::Relaxed))
            .sum();
        sum / self.slots.len() as i64
    }
}

/// Blends the cross-shard percentile with the percentile threshold itself,
/// so a skip/flush decision still fires when every shard runs cold.
pub(crate) fn blended_percentile(sorted: &[i64], pctl: u32) -> i64 {
    let idx = (sorted.len() - 1) * pctl as usize / 100;
    (sorted[idx] + pctl as i64) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_budget_gates_self_disable() {
        let state = AdaptiveState::new();
        state.set_miss_budget(2);
        assert!(state.enabled());

        state.record_probe();
        assert!(!state.record_miss()); // 1 <= 2
        assert!(!state.record_miss()); // 2 <= 2
        assert!(state.record_miss()); // 3 > 2

        state.reset_window();
        assert_eq!(state.probes(), 0);
        assert_eq!(state.misses(), 0);
    }

    #[test]
    fn board_publishes_and_sorts() {
        let board = HitrateBoard::new(4);
        board.publish_hitrate(0, 90);
        board.publish_hitrate(1, 10);
        board.publish_hitrate(2, 50);
        board.publish_hitrate(3, 70);
        assert_eq!(board.sorted_hitrates(), vec![10, 50, 70, 90]);

        board.set_medians(0, 60, 20);
        board.set_medians(1, 40, 10);
        board.set_medians(2, 60, 30);
        board.set_medians(3, 40, 20);
        assert_eq!(board.avg_skip_median(), 50);
        assert_eq!(board.avg_flush_median(), 20);
    }

    #[test]
    fn blended_percentile_mixes_threshold_in() {
        let sorted = vec![10, 50, 70, 90];
        // (sorted[(4-1)*50/100] + 50) / 2 = (50 + 50) / 2
        assert_eq!(blended_percentile(&sorted, 50), 50);
        // (sorted[3*100/100] + 100) / 2 = (90 + 100) / 2
        assert_eq!(blended_percentile(&sorted, 100), 95);
        // Low percentile over a cold board still yields a nonzero floor.
        assert_eq!(blended_percentile(&[0, 0, 0, 0], 20), 10);
    }

    #[test]
    fn single_shard_board() {
        let board = HitrateBoard::new(1);
        board.publish_hitrate(0, 33);
        assert_eq!(board.sorted_hitrates(), vec![33]);
        assert_eq!(blended_percentile(&board.sorted_hitrates(), 50), (33 + 50) / 2);
    }
}
