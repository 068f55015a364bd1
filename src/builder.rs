//! Cache construction and validation.
//!
//! [`CacheBuilder`] collects the user-configurable parameters, validates
//! them, and assembles the sharded cache. All validation happens in
//! [`try_build`](CacheBuilder::try_build) so a constructed
//! [`BlockCache`](crate::cache::BlockCache) never carries an out-of-range
//! configuration.
//!
//! ## Example
//!
//! ```rust
//! use blockcache::builder::CacheBuilder;
//! use blockcache::cache::hash_key;
//!
//! let cache = CacheBuilder::new(64 * 1024)
//!     .shard_bits(2)
//!     .high_pri_pool_ratio(0.5)
//!     .try_build::<Vec<u8>>()
//!     .unwrap();
//!
//! let hash = hash_key(b"block-1");
//! cache.insert(b"block-1", hash, vec![0u8; 512], 512).unwrap();
//! assert!(cache.lookup(b"block-1", hash).is_some());
//! ```

use std::sync::Arc;

use crate::adaptive::{HitrateBoard, HotIndexParams};
use crate::cache::BlockCache;
use crate::error::ConfigError;
use crate::secondary::SecondaryCache;
use crate::shard::CacheShard;
use crate::tid::ThreadRegistry;

/// Whether per-entry metadata counts against the capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataChargePolicy {
    /// Only the caller-supplied charge is accounted.
    #[default]
    DontCharge,
    /// The entry header and key bytes are added to each charge.
    FullCharge,
}

/// Most shard bits a cache may be built with.
pub const MAX_SHARD_BITS: u32 = 19;

/// Builder for [`BlockCache`] instances.
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    capacity: usize,
    shard_bits: Option<u32>,
    strict_capacity_limit: bool,
    high_pri_pool_ratio: f64,
    metadata_charge_policy: MetadataChargePolicy,
    hot: HotIndexParams,
}

impl CacheBuilder {
    /// Starts a builder for a cache of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        CacheBuilder {
            capacity,
            shard_bits: None,
            strict_capacity_limit: false,
            high_pri_pool_ratio: 0.0,
            metadata_charge_policy: MetadataChargePolicy::default(),
            hot: HotIndexParams::default(),
        }
    }

    /// Shards the cache into `2^bits` sub-caches. Without this the shard
    /// count is derived from the capacity.
    pub fn shard_bits(mut self, bits: u32) -> Self {
        self.shard_bits = Some(bits);
        self
    }

    /// Refuse inserts that would exceed the capacity instead of letting
    /// usage temporarily overflow.
    pub fn strict_capacity_limit(mut self, strict: bool) -> Self {
        self.strict_capacity_limit = strict;
        self
    }

    /// Fraction of each shard's capacity reserved for high-priority and
    /// already-hit entries.
    pub fn high_pri_pool_ratio(mut self, ratio: f64) -> Self {
        self.high_pri_pool_ratio = ratio;
        self
    }

    /// See [`MetadataChargePolicy`].
    pub fn metadata_charge_policy(mut self, policy: MetadataChargePolicy) -> Self {
        self.metadata_charge_policy = policy;
        self
    }

    /// Tunables of the per-shard hot index and its adaptive controller.
    pub fn hot_index(mut self, params: HotIndexParams) -> Self {
        self.hot = params;
        self
    }

    /// Builds the cache.
    pub fn try_build<V>(self) -> Result<BlockCache<V>, ConfigError> {
        self.build_inner(None)
    }

    /// Builds the cache with a secondary tier behind it.
    pub fn try_build_with_secondary<V>(
        self,
        secondary: Arc<dyn SecondaryCache<V>>,
    ) -> Result<BlockCache<V>, ConfigError> {
        self.build_inner(Some(secondary))
    }

    fn build_inner<V>(
        self,
        secondary: Option<Arc<dyn SecondaryCache<V>>>,
    ) -> Result<BlockCache<V>, ConfigError> {
        let shard_bits = match self.shard_bits {
            Some(bits) if bits > MAX_SHARD_BITS => {
                return Err(ConfigError::new(format!(
                    "shard bits must be in 0..={MAX_SHARD_BITS}, got {bits}"
                )));
            },
            Some(bits) => bits,
            None => default_shard_bits(self.capacity),
        };
        if !(0.0..=1.0).contains(&self.high_pri_pool_ratio) {
            return Err(ConfigError::new(format!(
                "high_pri_pool_ratio must be in [0.0, 1.0], got {}",
                self.high_pri_pool_ratio
            )));
        }
        if self.hot.activate_pctl > 100 {
            return Err(ConfigError::new(format!(
                "activate_pctl must be in 0..=100, got {}",
                self.hot.activate_pctl
            )));
        }
        if self.hot.flush_pctl > 100 {
            return Err(ConfigError::new(format!(
                "flush_pctl must be in 0..=100, got {}",
                self.hot.flush_pctl
            )));
        }
        if !(1..=20).contains(&self.hot.aux_bits) {
            return Err(ConfigError::new(format!(
                "aux_bits must be in 1..=20, got {}",
                self.hot.aux_bits
            )));
        }
        if self.hot.thread_slots == 0 {
            return Err(ConfigError::new("thread_slots must be at least 1"));
        }
        if self.hot.nlimit == 0 {
            return Err(ConfigError::new("nlimit must be at least 1"));
        }

        let num_shards = 1usize << shard_bits;
        let per_shard = self.capacity.div_ceil(num_shards);
        let registry = Arc::new(ThreadRegistry::new(self.hot.thread_slots));
        let board = Arc::new(HitrateBoard::new(num_shards));
        let shards: Vec<CacheShard<V>> = (0..num_shards)
            .map(|index| {
                CacheShard::new(
                    index,
                    per_shard,
                    self.strict_capacity_limit,
                    self.high_pri_pool_ratio,
                    self.metadata_charge_policy,
                    32 - shard_bits,
                    self.hot,
                    board.clone(),
                    registry.clone(),
                    secondary.clone(),
                )
            })
            .collect();

        Ok(BlockCache::from_parts(
            shards.into_boxed_slice(),
            self.capacity,
            registry,
            secondary,
        ))
    }
}

/// Enough shards that each holds at least 512 KiB, capped at 6 bits — the
/// same heuristic storage engines use for their block caches.
fn default_shard_bits(capacity: usize) -> u32 {
    const MIN_SHARD_SIZE: usize = 512 * 1024;
    let mut bits = 0;
    let mut shards = capacity / MIN_SHARD_SIZE;
    loop {
        shards >>= 1;
        if shards == 0 {
            return bits;
        }
        bits += 1;
        if bits >= 6 {
            return bits;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shard_bits_scales_with_capacity() {
        assert_eq!(default_shard_bits(0), 0);
        assert_eq!(default_shard_bits(512 * 1024), 0);
        assert_eq!(default_shard_bits(2 * 1024 * 1024), 2);
        // Large capacities cap at 6 bits (64 shards).
        assert_eq!(default_shard_bits(1 << 40), 6);
    }

    #[test]
    fn shard_bits_out_of_range_is_rejected() {
        let err = CacheBuilder::new(1024)
            .shard_bits(MAX_SHARD_BITS + 1)
            .try_build::<u64>()
            .unwrap_err();
        assert!(err.message().contains("shard bits"));
    }

    #[test]
    fn ratio_out_of_range_is_rejected() {
        for ratio in [-0.1, 1.1, f64::NAN] {
            assert!(CacheBuilder::new(1024)
                .high_pri_pool_ratio(ratio)
                .try_build::<u64>()
                .is_err());
        }
    }

    #[test]
    fn hot_params_are_validated() {
        let mut params = HotIndexParams::default();
        params.activate_pctl = 101;
        assert!(CacheBuilder::new(1024)
            .hot_index(params)
            .try_build::<u64>()
            .is_err());

        let mut params = HotIndexParams::default();
        params.aux_bits = 0;
        assert!(CacheBuilder::new(1024)
            .hot_index(params)
            .try_build::<u64>()
            .is_err());

        let mut params = HotIndexParams::default();
        params.thread_slots = 0;
        assert!(CacheBuilder::new(1024)
            .hot_index(params)
            .try_build::<u64>()
            .is_err());
    }

    #[test]
    fn valid_configuration_builds() {
        let cache = CacheBuilder::new(4096)
            .shard_bits(1)
            .strict_capacity_limit(true)
            .high_pri_pool_ratio(0.25)
            .try_build::<u64>()
            .unwrap();
        assert_eq!(cache.shard_count(), 2);
        assert_eq!(cache.capacity(), 4096);
        assert_eq!(cache.usage(), 0);
    }
}
