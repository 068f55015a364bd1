pub use crate::adaptive::HotIndexParams;
pub use crate::builder::{CacheBuilder, MetadataChargePolicy};
pub use crate::cache::{hash_key, BlockCache, InsertStatus};
pub use crate::entry::{EntryHandle, Priority};
pub use crate::error::{CacheFull, ConfigError};
pub use crate::metrics::CacheMetricsSnapshot;
pub use crate::secondary::{SecondaryCache, SecondaryResult};
pub use crate::tid::ThreadRegistry;
