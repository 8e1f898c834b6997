//! RAM/VRAM model cache
//!
//! - [`ModelCache`]: LRU store, eviction, device reservation
//! - [`ModelLocker`] / [`LockedModel`]: scoped device placement of one entry
//! - [`CacheStatsRegistry`]: per-session hit/miss accounting

pub mod locker;
pub mod model_cache;
pub mod record;
pub mod stats;

pub use locker::{LockedModel, ModelLocker};
pub use model_cache::{ExecutionDeviceGuard, ModelCache, cache_key};
pub use record::CacheRecord;
pub use stats::{CacheStats, CacheStatsHandle, CacheStatsRegistry, CacheStatsSummary};
