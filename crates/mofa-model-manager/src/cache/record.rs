//! A single cache entry

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::raw_model::AnyModel;

/// One resident model plus the number of live locks on it
#[derive(Debug)]
pub struct CacheRecord {
    key: String,
    size: u64,
    model: AnyModel,
    lock_count: AtomicUsize,
}

impl CacheRecord {
    pub(crate) fn new(key: String, size: u64, model: AnyModel) -> Self {
        Self {
            key,
            size,
            model,
            lock_count: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Size computed at insertion
    pub fn size(&self) -> u64 {
        self.size
    }

    /// CPU-resident model
    pub fn model(&self) -> &AnyModel {
        &self.model
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count.load(Ordering::SeqCst)
    }

    pub fn locked(&self) -> bool {
        self.lock_count() > 0
    }

    /// True while anything outside the cache still references this entry or
    /// its model. Pinned entries are never evicted.
    pub(crate) fn pinned(self: &Arc<Self>) -> bool {
        self.locked() || Arc::strong_count(self) > 1 || Arc::strong_count(&self.model) > 1
    }
}

/// Counts one lock on a record for as long as it lives
#[derive(Debug)]
pub(crate) struct RecordLock {
    record: Arc<CacheRecord>,
}

impl RecordLock {
    pub(crate) fn acquire(record: Arc<CacheRecord>) -> Self {
        record.lock_count.fetch_add(1, Ordering::SeqCst);
        Self { record }
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = self
            .record
            .lock_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_model::TensorStateDict;
    use std::collections::HashMap;

    fn record() -> Arc<CacheRecord> {
        let model: AnyModel = Arc::new(TensorStateDict::new("m", HashMap::new()));
        Arc::new(CacheRecord::new("k".into(), 10, model))
    }

    #[test]
    fn test_lock_counts_nest() {
        let rec = record();
        let a = RecordLock::acquire(rec.clone());
        let b = RecordLock::acquire(rec.clone());
        assert_eq!(rec.lock_count(), 2);
        drop(a);
        assert!(rec.locked());
        drop(b);
        assert!(!rec.locked());
    }

    #[test]
    fn test_pinned_by_outstanding_references() {
        let rec = record();
        assert!(!rec.pinned());

        let handle = rec.clone();
        assert!(rec.pinned());
        drop(handle);

        let model = rec.model().clone();
        assert!(rec.pinned());
        drop(model);
        assert!(!rec.pinned());
    }
}
