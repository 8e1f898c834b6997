//! ModelCache - RAM/VRAM cache for loaded models
//!
//! Models live in system RAM (the storage device) keyed by
//! `"{key}:{submodel}"`, ordered least to most recently used. Work runs on an
//! execution device which a thread reserves for the duration of a scope; a
//! locked model is copied onto that device and dropped from it on unlock.
//!
//! Capacity is soft: when every remaining entry is pinned by a live handle,
//! [`ModelCache::make_room`] stops evicting and the cache grows past its
//! nominal size instead of failing or blocking.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mofa_model_manager::{ModelCache, ModelManagerConfig};
//! use mofa_model_manager::raw_model::{AnyModel, TensorStateDict};
//!
//! let cache = ModelCache::new(&ModelManagerConfig::default()).unwrap();
//! let model: AnyModel = Arc::new(TensorStateDict::new("vae", Default::default()));
//! cache.put("abc123", model, None, None);
//!
//! let _device = cache.reserve_execution_device(Some(Duration::from_secs(30))).unwrap();
//! let locker = cache.get("abc123", None, None, None).unwrap();
//! let locked = locker.lock().unwrap();
//! // ... run inference with locked.model()
//! drop(locked);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use candle_core::Device;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::cache::locker::ModelLocker;
use crate::cache::record::CacheRecord;
use crate::cache::stats::CacheStatsHandle;
use crate::config::{GIB, ModelManagerConfig};
use crate::devices::{device_name, execution_devices};
use crate::error::{ModelManagerError, Result};
use crate::memory::MemorySnapshot;
use crate::raw_model::AnyModel;
use crate::taxonomy::SubModelType;

/// Cache key for a model or one of its submodels.
pub fn cache_key(key: &str, submodel: Option<SubModelType>) -> String {
    match submodel {
        Some(submodel) => format!("{key}:{submodel}"),
        None => key.to_string(),
    }
}

fn gb(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

// ============================================================================
// State
// ============================================================================

#[derive(Default)]
struct CacheState {
    cached_models: HashMap<String, Arc<CacheRecord>>,
    /// LRU order: front is the least recently used
    cache_stack: Vec<String>,
}

impl CacheState {
    fn total_size(&self) -> u64 {
        self.cached_models.values().map(|r| r.size()).sum()
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.cache_stack.iter().position(|k| k == key) {
            let key = self.cache_stack.remove(pos);
            self.cache_stack.push(key);
        }
    }
}

#[derive(Debug)]
struct DeviceSlot {
    device: Device,
    owner: Option<ThreadId>,
}

struct ModelCacheInner {
    state: Mutex<CacheState>,
    max_cache_size: AtomicU64,
    vram_cache_size: u64,
    storage_device: Device,
    execution_devices: Vec<Device>,
    slots: Mutex<Vec<DeviceSlot>>,
    device_freed: Condvar,
    default_wait: Duration,
    log_memory_usage: bool,
}

/// Capacity-bounded model cache with thread-scoped device reservation
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<ModelCacheInner>,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("max_cache_size", &self.max_cache_size())
            .field("cache_size", &self.cache_size())
            .field("execution_devices", &self.inner.execution_devices)
            .finish()
    }
}

impl ModelCache {
    /// Build a cache for `config`, resolving its execution devices.
    pub fn new(config: &ModelManagerConfig) -> Result<Self> {
        let devices = execution_devices(config.devices.as_deref())?;
        Ok(Self::with_devices(config, devices))
    }

    /// Build a cache over an explicit set of execution devices.
    pub fn with_devices(config: &ModelManagerConfig, devices: Vec<Device>) -> Self {
        let devices = if devices.is_empty() {
            vec![Device::Cpu]
        } else {
            devices
        };

        info!(
            "ModelCache created: max_cache_size={:.2}G, vram_cache={:.2}G, execution_devices=[{}]",
            gb(config.ram_cache_bytes),
            gb(config.vram_cache_bytes),
            devices.iter().map(device_name).collect::<Vec<_>>().join(", ")
        );

        let slots = devices
            .iter()
            .map(|device| DeviceSlot {
                device: device.clone(),
                owner: None,
            })
            .collect();

        Self {
            inner: Arc::new(ModelCacheInner {
                state: Mutex::new(CacheState::default()),
                max_cache_size: AtomicU64::new(config.ram_cache_bytes),
                vram_cache_size: config.vram_cache_bytes,
                storage_device: Device::Cpu,
                execution_devices: devices,
                slots: Mutex::new(slots),
                device_freed: Condvar::new(),
                default_wait: Duration::from_secs(config.device_wait_secs),
                log_memory_usage: config.log_memory_usage,
            }),
        }
    }

    pub fn storage_device(&self) -> &Device {
        &self.inner.storage_device
    }

    pub fn execution_devices(&self) -> &[Device] {
        &self.inner.execution_devices
    }

    pub fn max_cache_size(&self) -> u64 {
        self.inner.max_cache_size.load(Ordering::SeqCst)
    }

    /// Change the capacity. Takes effect on the next insertion.
    pub fn set_max_cache_size(&self, bytes: u64) {
        self.inner.max_cache_size.store(bytes, Ordering::SeqCst);
    }

    /// Total bytes of every resident entry.
    pub fn cache_size(&self) -> u64 {
        self.inner.state.lock().total_size()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().cached_models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exists(&self, key: &str, submodel: Option<SubModelType>) -> bool {
        self.inner
            .state
            .lock()
            .cached_models
            .contains_key(&cache_key(key, submodel))
    }

    // ========================================================================
    // Insertion and lookup
    // ========================================================================

    /// Insert a model, evicting unpinned entries first if needed.
    ///
    /// Re-inserting a key that is already resident leaves the existing entry
    /// untouched.
    pub fn put(
        &self,
        key: &str,
        model: AnyModel,
        submodel: Option<SubModelType>,
        stats: Option<&CacheStatsHandle>,
    ) {
        let key = cache_key(key, submodel);
        let mut state = self.inner.state.lock();
        self.insert_locked(&mut state, &key, model, stats);
    }

    /// Insert a model and return a locker on the resident entry.
    ///
    /// Both steps run under one acquisition of the cache lock, so a concurrent
    /// insertion cannot evict the entry in between.
    pub fn put_and_get(
        &self,
        key: &str,
        model: AnyModel,
        submodel: Option<SubModelType>,
        stats_name: Option<&str>,
        stats: Option<&CacheStatsHandle>,
    ) -> ModelLocker {
        let key = cache_key(key, submodel);
        let mut state = self.inner.state.lock();
        let record = self.insert_locked(&mut state, &key, model, stats);
        self.record_hit(&state, &record, stats_name, stats);
        state.touch(&key);
        ModelLocker::new(self.clone(), record)
    }

    fn insert_locked(
        &self,
        state: &mut CacheState,
        key: &str,
        model: AnyModel,
        stats: Option<&CacheStatsHandle>,
    ) -> Arc<CacheRecord> {
        if let Some(existing) = state.cached_models.get(key) {
            debug!(key = %key, "Model already cached, ignoring put");
            return existing.clone();
        }

        let size = model.size_in_bytes();
        self.make_room_locked(state, size, stats);

        let record = Arc::new(CacheRecord::new(key.to_string(), size, model));
        state.cached_models.insert(key.to_string(), record.clone());
        state.cache_stack.push(key.to_string());
        debug!(
            key = %key,
            size_gb = gb(size),
            cache_size_gb = gb(state.total_size()),
            "Added model to RAM cache"
        );
        record
    }

    /// Look up a resident model.
    ///
    /// Fails with [`ModelManagerError::NotCached`] on a miss, which callers
    /// answer by loading the model. `stats_name` labels the model in the
    /// session stats and defaults to the cache key.
    pub fn get(
        &self,
        key: &str,
        submodel: Option<SubModelType>,
        stats_name: Option<&str>,
        stats: Option<&CacheStatsHandle>,
    ) -> Result<ModelLocker> {
        let key = cache_key(key, submodel);
        let mut state = self.inner.state.lock();

        let Some(record) = state.cached_models.get(&key).cloned() else {
            if let Some(stats) = stats {
                stats.update(|s| s.misses += 1);
            }
            return Err(ModelManagerError::NotCached(key));
        };

        self.record_hit(&state, &record, stats_name, stats);
        state.touch(&key);
        Ok(ModelLocker::new(self.clone(), record))
    }

    fn record_hit(
        &self,
        state: &CacheState,
        record: &CacheRecord,
        stats_name: Option<&str>,
        stats: Option<&CacheStatsHandle>,
    ) {
        let Some(stats) = stats else {
            return;
        };
        let label = stats_name.unwrap_or(record.key()).to_string();
        let total = state.total_size();
        let in_cache = state.cached_models.len();
        let max = self.max_cache_size();
        let size = record.size();
        stats.update(|s| {
            s.hits += 1;
            s.cache_size = max;
            s.high_watermark = s.high_watermark.max(total);
            s.in_cache = in_cache;
            let seen = s.loaded_model_sizes.entry(label).or_insert(0);
            *seen = (*seen).max(size);
        });
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    /// Evict least recently used, unpinned entries until `size` more bytes fit.
    pub fn make_room(&self, size: u64, stats: Option<&CacheStatsHandle>) {
        let mut state = self.inner.state.lock();
        self.make_room_locked(&mut state, size, stats);
    }

    fn make_room_locked(
        &self,
        state: &mut CacheState,
        size: u64,
        stats: Option<&CacheStatsHandle>,
    ) {
        let max = self.max_cache_size();
        let mut current = state.total_size();
        if current + size <= max {
            return;
        }

        let before = self.inner.log_memory_usage.then(MemorySnapshot::capture);
        let mut pos = 0;
        let mut cleared = 0usize;

        while current + size > max && pos < state.cache_stack.len() {
            let key = state.cache_stack[pos].clone();
            let Some(record) = state.cached_models.get(&key) else {
                state.cache_stack.remove(pos);
                continue;
            };

            if record.pinned() {
                debug!(
                    key = %key,
                    locks = record.lock_count(),
                    "Skipping pinned model during eviction"
                );
                pos += 1;
                continue;
            }

            let freed = record.size();
            state.cached_models.remove(&key);
            state.cache_stack.remove(pos);
            current -= freed;
            cleared += 1;
            info!(
                "Removing {} from RAM cache to free at least {:.2}G (-{:.2}G)",
                key,
                gb(size),
                gb(freed)
            );
        }

        if cleared > 0 {
            if let Some(stats) = stats {
                stats.update(|s| s.cleared = cleared);
            }
        }

        if current + size > max {
            debug!(
                needed_gb = gb(size),
                cache_size_gb = gb(current),
                max_gb = gb(max),
                "All remaining models are in use; RAM cache will exceed its capacity"
            );
        }

        if let Some(before) = before {
            debug!(
                "After making room: {}",
                MemorySnapshot::diff(&before, &MemorySnapshot::capture())
            );
        }
    }

    // ========================================================================
    // Execution devices
    // ========================================================================

    /// Reserve an execution device for the calling thread.
    ///
    /// Blocks for up to `timeout` (default from config) until a device is
    /// free. A thread that already holds a device gets the same device back;
    /// the inner guard then leaves the reservation in place.
    pub fn reserve_execution_device(
        &self,
        timeout: Option<Duration>,
    ) -> Result<ExecutionDeviceGuard> {
        let me = thread::current().id();
        let timeout = timeout.unwrap_or(self.inner.default_wait);
        // None when the bound is too large to represent: wait without one
        let deadline = Instant::now().checked_add(timeout);

        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.iter().find(|s| s.owner == Some(me)) {
            return Ok(ExecutionDeviceGuard {
                cache: self.clone(),
                device: slot.device.clone(),
                owner: me,
                owned: false,
            });
        }

        loop {
            if let Some(slot) = slots.iter_mut().find(|s| s.owner.is_none()) {
                slot.owner = Some(me);
                let device = slot.device.clone();
                info!(thread = ?me, device = %device_name(&device), "Reserved execution device");
                return Ok(ExecutionDeviceGuard {
                    cache: self.clone(),
                    device,
                    owner: me,
                    owned: true,
                });
            }

            debug!(thread = ?me, "Waiting for a free execution device");
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        warn!(thread = ?me, timeout_secs = timeout.as_secs(), "Timed out waiting for an execution device");
                        return Err(ModelManagerError::DeviceReservationTimeout {
                            timeout_secs: timeout.as_secs(),
                        });
                    }
                    self.inner.device_freed.wait_until(&mut slots, deadline);
                }
                None => self.inner.device_freed.wait(&mut slots),
            }
        }
    }

    fn release_execution_device(&self, owner: ThreadId) {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.owner == Some(owner)) {
            slot.owner = None;
            info!(thread = ?owner, device = %device_name(&slot.device), "Released execution device");
        }
        drop(slots);
        self.inner.device_freed.notify_all();
    }

    /// Device reserved by the calling thread.
    pub fn get_execution_device(&self) -> Result<Device> {
        let me = thread::current().id();
        self.inner
            .slots
            .lock()
            .iter()
            .find(|s| s.owner == Some(me))
            .map(|s| s.device.clone())
            .ok_or_else(|| ModelManagerError::NoReservation(format!("{me:?}")))
    }

    // ========================================================================
    // Device movement
    // ========================================================================

    /// Device-resident copy of a cached model. The CPU original is untouched.
    ///
    /// Errors are fatal to the current operation: no eviction and retry is
    /// attempted here. `OutOfDeviceMemory` only ever comes from the device
    /// runtime; the VRAM budget is not consulted.
    pub fn model_to_device(&self, record: &CacheRecord, device: &Device) -> Result<AnyModel> {
        if device.same_device(&self.inner.storage_device) {
            return Ok(record.model().clone());
        }
        self.copy_to_device(record, device)
    }

    fn copy_to_device(&self, record: &CacheRecord, device: &Device) -> Result<AnyModel> {
        let before = self.inner.log_memory_usage.then(MemorySnapshot::capture);
        let start = Instant::now();

        let mut copy = record.model().clone_model();
        copy.to(Some(device), None)
            .map_err(|e| classify_device_error(e, record.key(), device))?;
        let model: AnyModel = Arc::from(copy);

        debug!(
            key = record.key(),
            device = %device_name(device),
            size_gb = gb(record.size()),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Moved model to execution device"
        );
        if let Some(before) = before {
            debug!(
                "After moving {} to {}: {}",
                record.key(),
                device_name(device),
                MemorySnapshot::diff(&before, &MemorySnapshot::capture())
            );
        }
        Ok(model)
    }

    /// Log RAM usage and current device reservations.
    pub fn log_device_stats(&self) {
        let (count, total) = {
            let state = self.inner.state.lock();
            (state.cached_models.len(), state.total_size())
        };
        let reservations: Vec<String> = self
            .inner
            .slots
            .lock()
            .iter()
            .map(|s| match s.owner {
                Some(owner) => format!("{}={owner:?}", device_name(&s.device)),
                None => format!("{}=free", device_name(&s.device)),
            })
            .collect();
        debug!(
            "Current RAM utilization {:.2}/{:.2}G across {} models; VRAM budget {:.2}G; devices [{}]",
            gb(total),
            gb(self.max_cache_size()),
            count,
            gb(self.inner.vram_cache_size),
            reservations.join(", ")
        );
    }
}

fn classify_device_error(err: candle_core::Error, key: &str, device: &Device) -> ModelManagerError {
    let msg = err.to_string();
    if msg.to_lowercase().contains("out of memory") {
        ModelManagerError::OutOfDeviceMemory {
            key: key.to_string(),
            device: device_name(device),
            reason: msg,
        }
    } else {
        ModelManagerError::Tensor(err)
    }
}

// ============================================================================
// ExecutionDeviceGuard
// ============================================================================

/// Scoped reservation of an execution device; released on drop
#[derive(Debug)]
pub struct ExecutionDeviceGuard {
    cache: ModelCache,
    device: Device,
    owner: ThreadId,
    owned: bool,
}

impl ExecutionDeviceGuard {
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// False when this guard re-entered a reservation an outer guard holds.
    pub fn owns_reservation(&self) -> bool {
        self.owned
    }
}

impl Drop for ExecutionDeviceGuard {
    fn drop(&mut self) {
        if self.owned {
            self.cache.release_execution_device(self.owner);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::raw_model::{RawModel, TensorStateDict};
    use candle_core::{DType, Tensor};

    /// Reports a fixed size without allocating; `to` counts calls and can fail
    #[derive(Debug, Clone)]
    struct SizedStub {
        size: u64,
        moves: Arc<AtomicUsize>,
        fail_with: Option<&'static str>,
    }

    impl RawModel for SizedStub {
        fn size_in_bytes(&self) -> u64 {
            self.size
        }

        fn to(&mut self, _: Option<&Device>, _: Option<DType>) -> candle_core::Result<()> {
            self.moves.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(msg) => Err(candle_core::Error::Msg(msg.to_string())),
                None => Ok(()),
            }
        }

        fn clone_model(&self) -> Box<dyn RawModel> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn stub_record(
        cache: &ModelCache,
        size: u64,
        fail_with: Option<&'static str>,
    ) -> (ModelLocker, Arc<AtomicUsize>) {
        let moves = Arc::new(AtomicUsize::new(0));
        let stub = SizedStub {
            size,
            moves: moves.clone(),
            fail_with,
        };
        cache.put("stub", Arc::new(stub), None, None);
        (cache.get("stub", None, None, None).unwrap(), moves)
    }

    /// Model of exactly `bytes` bytes (multiple of 4).
    fn model_of(bytes: usize) -> AnyModel {
        let mut tensors = HashMap::new();
        tensors.insert(
            "w".to_string(),
            Tensor::zeros(bytes / 4, DType::F32, &Device::Cpu).unwrap(),
        );
        Arc::new(TensorStateDict::new("m", tensors))
    }

    fn cache(max: u64) -> ModelCache {
        let config = ModelManagerConfig::default().with_ram_cache_bytes(max);
        ModelCache::with_devices(&config, vec![Device::Cpu])
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("abc", None), "abc");
        assert_eq!(cache_key("abc", Some(SubModelType::Unet)), "abc:unet");
    }

    #[test]
    fn test_put_get_exists() {
        let cache = cache(1000);
        cache.put("a", model_of(40), Some(SubModelType::Vae), None);
        assert!(cache.exists("a", Some(SubModelType::Vae)));
        assert!(!cache.exists("a", None));
        assert_eq!(cache.cache_size(), 40);

        let locker = cache.get("a", Some(SubModelType::Vae), None, None).unwrap();
        assert_eq!(locker.key(), "a:vae");
    }

    #[test]
    fn test_get_missing_is_not_cached() {
        let cache = cache(1000);
        let stats = CacheStatsHandle::new();
        let err = cache.get("nope", None, None, Some(&stats)).unwrap_err();
        assert!(err.is_not_cached());
        assert_eq!(stats.snapshot().misses, 1);
    }

    #[test]
    fn test_duplicate_put_is_ignored() {
        let cache = cache(1000);
        cache.put("a", model_of(40), None, None);
        cache.put("a", model_of(80), None, None);
        assert_eq!(cache.cache_size(), 40);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(100);
        cache.put("first", model_of(60), None, None);
        cache.put("second", model_of(60), None, None);
        assert!(!cache.exists("first", None));
        assert!(cache.exists("second", None));
        assert!(cache.cache_size() <= 120);
    }

    #[test]
    fn test_get_refreshes_lru_order() {
        let cache = cache(100);
        cache.put("a", model_of(40), None, None);
        cache.put("b", model_of(40), None, None);
        drop(cache.get("a", None, None, None).unwrap());
        cache.put("c", model_of(40), None, None);
        assert!(cache.exists("a", None));
        assert!(!cache.exists("b", None));
    }

    #[test]
    fn test_locker_pins_entry() {
        let cache = cache(100);
        cache.put("first", model_of(60), None, None);
        let locker = cache.get("first", None, None, None).unwrap();
        cache.put("second", model_of(60), None, None);

        // soft capacity: nothing evictable, so both stay
        assert!(cache.exists("first", None));
        assert!(cache.exists("second", None));
        assert_eq!(cache.cache_size(), 120);

        drop(locker);
        cache.put("third", model_of(60), None, None);
        assert!(!cache.exists("first", None));
    }

    #[test]
    fn test_stats_on_hit_and_eviction() {
        let cache = cache(100);
        let stats = CacheStatsHandle::new();
        cache.put("a", model_of(60), None, Some(&stats));
        cache.get("a", None, Some("sdxl:lora:style"), Some(&stats)).unwrap();
        cache.put("b", model_of(60), None, Some(&stats));
        cache.get("b", None, None, Some(&stats)).unwrap();

        let s = stats.snapshot();
        assert_eq!(s.hits, 2);
        assert_eq!(s.cleared, 1);
        assert_eq!(s.in_cache, 1);
        assert_eq!(s.cache_size, 100);
        assert_eq!(s.high_watermark, 60);
        assert_eq!(s.loaded_model_sizes["sdxl:lora:style"], 60);
        assert_eq!(s.loaded_model_sizes["b"], 60);
    }

    #[test]
    fn test_set_max_cache_size() {
        let cache = cache(100);
        cache.set_max_cache_size(1000);
        cache.put("a", model_of(600), None, None);
        cache.put("b", model_of(200), None, None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.max_cache_size(), 1000);
    }

    #[test]
    fn test_no_reservation() {
        let cache = cache(100);
        let err = cache.get_execution_device().unwrap_err();
        assert!(matches!(err, ModelManagerError::NoReservation(_)));
    }

    #[test]
    fn test_reservation_scope() {
        let cache = cache(100);
        {
            let guard = cache.reserve_execution_device(None).unwrap();
            assert!(guard.owns_reservation());
            assert!(cache.get_execution_device().unwrap().is_cpu());

            let inner = cache.reserve_execution_device(None).unwrap();
            assert!(!inner.owns_reservation());
            drop(inner);
            assert!(cache.get_execution_device().is_ok());
        }
        assert!(cache.get_execution_device().is_err());
    }

    #[test]
    fn test_reservation_times_out() {
        let cache = cache(100);
        let _held = cache.reserve_execution_device(None).unwrap();
        let other = cache.clone();
        let err = std::thread::spawn(move || {
            other
                .reserve_execution_device(Some(Duration::from_millis(50)))
                .map(|_| ())
        })
        .join()
        .unwrap()
        .unwrap_err();
        assert!(matches!(
            err,
            ModelManagerError::DeviceReservationTimeout { .. }
        ));
    }

    #[test]
    fn test_model_to_storage_device_shares_model() {
        let cache = cache(100);
        cache.put("a", model_of(40), None, None);
        let locker = cache.get("a", None, None, None).unwrap();
        let moved = cache
            .model_to_device(locker.record(), &Device::Cpu)
            .unwrap();
        assert!(Arc::ptr_eq(&moved, locker.record().model()));
    }

    #[test]
    fn test_model_over_vram_budget_is_still_moved() {
        let cache = ModelCache::with_devices(&ModelManagerConfig::default(), vec![Device::Cpu]);
        let (locker, moves) = stub_record(&cache, 300 * 1024 * 1024, None);
        assert!(locker.record().size() > ModelManagerConfig::default().vram_cache_bytes);

        let moved = cache.copy_to_device(locker.record(), &Device::Cpu).unwrap();
        assert_eq!(moves.load(Ordering::SeqCst), 1);
        assert_eq!(moved.size_in_bytes(), 300 * 1024 * 1024);
        // the cached original is untouched
        assert!(!Arc::ptr_eq(&moved, locker.record().model()));
    }

    #[test]
    fn test_device_runtime_oom_is_classified() {
        let cache = cache(1 << 30);
        let (locker, _) = stub_record(
            &cache,
            64,
            Some("CUDA_ERROR_OUT_OF_MEMORY: out of memory"),
        );
        let err = cache
            .copy_to_device(locker.record(), &Device::Cpu)
            .unwrap_err();
        assert!(matches!(
            err,
            ModelManagerError::OutOfDeviceMemory { ref key, .. } if key == "stub"
        ));
    }

    #[test]
    fn test_other_move_errors_stay_tensor_errors() {
        let cache = cache(1 << 30);
        let (locker, _) = stub_record(&cache, 64, Some("unsupported dtype"));
        let err = cache
            .copy_to_device(locker.record(), &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, ModelManagerError::Tensor(_)));
    }

    #[test]
    fn test_unbounded_reservation_wait() {
        let cache = cache(100);
        let guard = cache.reserve_execution_device(Some(Duration::MAX)).unwrap();
        assert!(guard.owns_reservation());
        drop(guard);

        let config = ModelManagerConfig::default().with_device_wait_secs(u64::MAX);
        let forever = ModelCache::with_devices(&config, vec![Device::Cpu]);
        let held = forever.reserve_execution_device(None).unwrap();
        let other = forever.clone();
        let waiter = std::thread::spawn(move || other.reserve_execution_device(None).map(|_| ()));
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_put_and_get_returns_resident_entry() {
        let cache = cache(100);
        let stats = CacheStatsHandle::new();
        let locker = cache.put_and_get("a", model_of(60), None, Some("label"), Some(&stats));
        assert_eq!(locker.key(), "a");

        // the returned locker pins the new entry against the next insertion
        cache.put("b", model_of(60), None, None);
        assert!(cache.exists("a", None));

        let again = cache.put_and_get("a", model_of(8), None, None, None);
        assert_eq!(again.record().size(), 60);
        assert_eq!(stats.snapshot().hits, 1);
        assert_eq!(stats.snapshot().loaded_model_sizes["label"], 60);
    }
}
