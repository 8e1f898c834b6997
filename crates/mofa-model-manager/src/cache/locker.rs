//! Scoped access to a cached model

use std::sync::Arc;

use candle_core::Device;
use tracing::{debug, warn};

use crate::cache::model_cache::ModelCache;
use crate::cache::record::{CacheRecord, RecordLock};
use crate::devices::device_name;
use crate::error::{ModelManagerError, Result};
use crate::raw_model::{AnyModel, RawModel};

/// Handle on one cache entry, returned by [`ModelCache::get`]
///
/// Holding a locker pins the entry against eviction. [`ModelLocker::lock`]
/// puts the model on the calling thread's reserved execution device.
#[derive(Debug, Clone)]
pub struct ModelLocker {
    cache: ModelCache,
    record: Arc<CacheRecord>,
}

impl ModelLocker {
    pub(crate) fn new(cache: ModelCache, record: Arc<CacheRecord>) -> Self {
        Self { cache, record }
    }

    pub fn key(&self) -> &str {
        self.record.key()
    }

    pub fn record(&self) -> &CacheRecord {
        &self.record
    }

    /// The CPU-resident model, without any device movement.
    pub fn model(&self) -> AnyModel {
        self.record.model().clone()
    }

    /// Move the model to this thread's execution device.
    ///
    /// Requires a prior [`ModelCache::reserve_execution_device`]. Running out
    /// of device memory is logged and returned; it is never retried.
    pub fn lock(&self) -> Result<LockedModel> {
        self.lock_with(|cache, record| {
            let device = cache.get_execution_device()?;
            let model = cache.model_to_device(record, &device)?;
            Ok((device, model))
        })
    }

    /// Count a lock while `place` puts the model on a device; the count is
    /// released again if placement fails.
    fn lock_with<F>(&self, place: F) -> Result<LockedModel>
    where
        F: FnOnce(&ModelCache, &CacheRecord) -> Result<(Device, AnyModel)>,
    {
        let lock = RecordLock::acquire(self.record.clone());

        match place(&self.cache, &*self.record) {
            Ok((device, model)) => {
                debug!(key = self.key(), device = %device_name(&device), "Locked model");
                self.cache.log_device_stats();
                Ok(LockedModel {
                    model,
                    device,
                    cache: self.cache.clone(),
                    key: self.key().to_string(),
                    _lock: lock,
                })
            }
            Err(err) => {
                if matches!(err, ModelManagerError::OutOfDeviceMemory { .. }) {
                    warn!(key = self.key(), error = %err, "Insufficient device memory to load model, aborting");
                }
                drop(lock);
                self.cache.log_device_stats();
                Err(err)
            }
        }
    }
}

/// A model placed on an execution device; unlocks when dropped
///
/// Dropping the guard releases the lock count. Device memory is freed once
/// the last clone of [`LockedModel::model`] goes out of scope.
#[derive(Debug)]
pub struct LockedModel {
    model: AnyModel,
    device: Device,
    cache: ModelCache,
    key: String,
    _lock: RecordLock,
}

impl LockedModel {
    pub fn model(&self) -> &AnyModel {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Typed view of the model.
    pub fn downcast_ref<T: RawModel + 'static>(&self) -> Option<&T> {
        self.model.as_any().downcast_ref::<T>()
    }

    /// Release explicitly; same as dropping.
    pub fn unlock(self) {}
}

impl Drop for LockedModel {
    fn drop(&mut self) {
        debug!(key = %self.key, device = %device_name(&self.device), "Unlocked model");
        self.cache.log_device_stats();
    }
}
