//! Error types for the blockcache library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when cache configuration parameters are invalid
//!   (e.g. out-of-range shard bits, priority-pool ratios, percentiles).
//! - [`CacheFull`]: Returned when an insert is refused because the cache is at
//!   capacity and the strict capacity limit is in force.
//!
//! ## Example Usage
//!
//! ```
//! use blockcache::builder::CacheBuilder;
//!
//! // Fallible construction for user-configurable parameters
//! let cache = CacheBuilder::new(1024).shard_bits(2).try_build::<String>();
//! assert!(cache.is_ok());
//!
//! // Out-of-range shard bits are caught without panicking
//! let bad = CacheBuilder::new(1024).shard_bits(25).try_build::<String>();
//! assert!(bad.is_err());
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`CacheBuilder::try_build`](crate::builder::CacheBuilder::try_build)
/// and by runtime setters such as
/// [`BlockCache::set_high_pri_pool_ratio`](crate::cache::BlockCache::set_high_pri_pool_ratio).
/// Carries a human-readable description of which parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// CacheFull
// ---------------------------------------------------------------------------

/// Error returned when an insert is refused under the strict capacity limit.
///
/// Only pinned inserts ([`BlockCache::insert_pinned`](crate::cache::BlockCache::insert_pinned))
/// or inserts into a cache with `strict_capacity_limit(true)` can observe
/// this; an unpinned insert into a non-strict cache always succeeds, at worst
/// evicting the new entry immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFull;

impl fmt::Display for CacheFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("insert refused: cache is at capacity")
    }
}

impl std::error::Error for CacheFull {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- ConfigError ------------------------------------------------------

    #[test]
    fn config_display_shows_message() {
        let err = ConfigError::new("shard bits must be in 0..=19");
        assert_eq!(err.to_string(), "shard bits must be in 0..=19");
    }

    #[test]
    fn config_message_accessor() {
        let err = ConfigError::new("test");
        assert_eq!(err.message(), "test");
    }

    #[test]
    fn config_clone_and_eq() {
        let a = ConfigError::new("x");
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn config_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<ConfigError>();
    }

    // -- CacheFull --------------------------------------------------------

    #[test]
    fn cache_full_display() {
        assert!(CacheFull.to_string().contains("capacity"));
    }

    #[test]
    fn cache_full_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<CacheFull>();
    }
}
