//! Cache statistics, attributed per unit of work
//!
//! Each session (one graph execution, one request) gets its own
//! [`CacheStatsHandle`] from the [`CacheStatsRegistry`] and passes it to the
//! cache calls it makes. Concurrent sessions sharing one cache therefore never
//! see each other's counters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::GIB;

/// Counters collected while a session uses the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Largest cache occupancy seen, in bytes
    pub high_watermark: u64,
    /// Entries resident at the last hit
    pub in_cache: usize,
    /// Entries evicted by the latest eviction pass
    pub cleared: usize,
    /// Cache capacity in bytes
    pub cache_size: u64,
    /// Size of each model the session used, by stats label
    pub loaded_model_sizes: HashMap<String, u64>,
}

/// Shared, mutable handle to one session's [`CacheStats`]
#[derive(Debug, Clone, Default)]
pub struct CacheStatsHandle {
    inner: Arc<Mutex<CacheStats>>,
}

impl CacheStatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> CacheStats {
        self.inner.lock().clone()
    }

    pub(crate) fn update<F: FnOnce(&mut CacheStats)>(&self, f: F) {
        f(&mut self.inner.lock());
    }

    pub fn summary(&self) -> CacheStatsSummary {
        CacheStatsSummary::from(&self.snapshot())
    }
}

/// Stats handles keyed by session id
#[derive(Debug, Default)]
pub struct CacheStatsRegistry {
    sessions: DashMap<String, CacheStatsHandle>,
}

impl CacheStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh random session id.
    pub fn new_session() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Handle for `session_id`, created on first use.
    pub fn collect(&self, session_id: &str) -> CacheStatsHandle {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<CacheStatsHandle> {
        self.sessions.get(session_id).map(|h| h.value().clone())
    }

    pub fn summary(&self, session_id: &str) -> Option<CacheStatsSummary> {
        self.get(session_id).map(|h| h.summary())
    }

    /// Drop a session, returning its final counters.
    pub fn reset(&self, session_id: &str) -> Option<CacheStats> {
        self.sessions
            .remove(session_id)
            .map(|(_, handle)| handle.snapshot())
    }

    pub fn sessions(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

/// GB-scaled view of [`CacheStats`] for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatsSummary {
    pub hits: u64,
    pub misses: u64,
    pub high_water_mark_gb: f64,
    pub cache_size_gb: f64,
    pub total_usage_gb: f64,
    pub models_cached: usize,
    pub models_cleared: usize,
}

impl From<&CacheStats> for CacheStatsSummary {
    fn from(stats: &CacheStats) -> Self {
        let gb = |bytes: u64| bytes as f64 / GIB as f64;
        Self {
            hits: stats.hits,
            misses: stats.misses,
            high_water_mark_gb: gb(stats.high_watermark),
            cache_size_gb: gb(stats.cache_size),
            total_usage_gb: gb(stats.loaded_model_sizes.values().sum()),
            models_cached: stats.in_cache,
            models_cleared: stats.cleared,
        }
    }
}

impl fmt::Display for CacheStatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RAM Cache Statistics:")?;
        writeln!(f, "   Model cache hits: {}", self.hits)?;
        writeln!(f, "   Model cache misses: {}", self.misses)?;
        writeln!(f, "   Models cached: {}", self.models_cached)?;
        writeln!(f, "   Models cleared from cache: {}", self.models_cleared)?;
        write!(
            f,
            "   Cache high water mark: {:.2}/{:.2}G",
            self.high_water_mark_gb, self.cache_size_gb
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_are_isolated() {
        let registry = CacheStatsRegistry::new();
        let a = registry.collect("a");
        let b = registry.collect("b");
        a.update(|s| s.hits += 2);
        b.update(|s| s.misses += 1);

        assert_eq!(registry.get("a").unwrap().snapshot().hits, 2);
        assert_eq!(registry.get("a").unwrap().snapshot().misses, 0);
        assert_eq!(registry.get("b").unwrap().snapshot().misses, 1);
    }

    #[test]
    fn test_collect_returns_same_handle() {
        let registry = CacheStatsRegistry::new();
        registry.collect("s").update(|s| s.hits += 1);
        registry.collect("s").update(|s| s.hits += 1);
        assert_eq!(registry.reset("s").unwrap().hits, 2);
        assert!(registry.get("s").is_none());
        assert!(registry.reset("s").is_none());
    }

    #[test]
    fn test_summary_scales_to_gb() {
        let handle = CacheStatsHandle::new();
        handle.update(|s| {
            s.hits = 3;
            s.high_watermark = 3 * GIB / 2;
            s.cache_size = 6 * GIB;
            s.loaded_model_sizes.insert("a".into(), GIB);
            s.loaded_model_sizes.insert("b".into(), GIB);
        });
        let summary = handle.summary();
        assert_eq!(summary.high_water_mark_gb, 1.5);
        assert_eq!(summary.total_usage_gb, 2.0);
        let text = summary.to_string();
        assert!(text.contains("Model cache hits: 3"));
        assert!(text.contains("1.50/6.00G"));
    }

    #[test]
    fn test_new_session_ids_are_unique() {
        assert_ne!(
            CacheStatsRegistry::new_session(),
            CacheStatsRegistry::new_session()
        );
    }
}
