//! Cache behaviour observed through the public API

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use mofa_model_manager::{
    AnyModel, CacheStatsRegistry, ModelCache, ModelManagerConfig, ModelManagerError,
    TensorStateDict,
};

/// A model of `bytes` bytes (F32 elements).
fn model(name: &str, bytes: usize) -> AnyModel {
    let mut tensors = HashMap::new();
    tensors.insert(
        "w".to_string(),
        Tensor::zeros(bytes / 4, DType::F32, &Device::Cpu).unwrap(),
    );
    Arc::new(TensorStateDict::new(name, tensors))
}

fn cache(ram_bytes: u64) -> ModelCache {
    let config = ModelManagerConfig::default()
        .with_ram_cache_bytes(ram_bytes)
        .with_device_wait_secs(5);
    ModelCache::with_devices(&config, vec![Device::Cpu])
}

#[test]
fn test_locked_entry_survives_pressure() {
    let cache = cache(100);
    cache.put("a", model("a", 40), None, None);
    cache.put("b", model("b", 40), None, None);

    let _device = cache.reserve_execution_device(None).unwrap();
    let locked = cache.get("a", None, None, None).unwrap().lock().unwrap();

    // needs 40 more bytes: "a" is locked, so "b" goes even though "a" is older
    cache.put("c", model("c", 40), None, None);
    assert!(cache.exists("a", None));
    assert!(!cache.exists("b", None));
    assert!(cache.exists("c", None));
    drop(locked);

    cache.put("d", model("d", 40), None, None);
    assert!(!cache.exists("a", None));
    assert!(cache.cache_size() <= 100);
}

#[test]
fn test_oversized_model_is_still_admitted() {
    let cache = cache(100);
    cache.put("small", model("small", 40), None, None);
    cache.put("huge", model("huge", 400), None, None);
    assert!(cache.exists("huge", None));
    assert!(!cache.exists("small", None));
    assert_eq!(cache.cache_size(), 400);
}

#[test]
fn test_single_device_serializes_threads() {
    let cache = cache(1024);
    let barrier = Arc::new(Barrier::new(2));
    let timeline = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let timeline = timeline.clone();
            thread::spawn(move || {
                barrier.wait();
                let guard = cache.reserve_execution_device(None).unwrap();
                timeline.lock().unwrap().push(format!("start{i}"));
                thread::sleep(Duration::from_millis(50));
                timeline.lock().unwrap().push(format!("end{i}"));
                drop(guard);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let timeline = timeline.lock().unwrap();
    assert_eq!(timeline.len(), 4);
    // whoever started first finished before the other started
    let first = timeline[0].trim_start_matches("start").to_string();
    assert_eq!(timeline[1], format!("end{first}"));
}

#[test]
fn test_lock_without_reservation_fails() {
    let cache = cache(1024);
    cache.put("a", model("a", 8), None, None);
    let locker = cache.get("a", None, None, None).unwrap();
    let err = locker.lock().unwrap_err();
    assert!(matches!(err, ModelManagerError::NoReservation(_)));
    assert_eq!(locker.record().lock_count(), 0);
}

#[test]
fn test_sessions_keep_separate_stats() {
    let cache = cache(1024);
    let registry = CacheStatsRegistry::new();
    let first = CacheStatsRegistry::new_session();
    let second = CacheStatsRegistry::new_session();
    assert_ne!(first, second);

    cache.put("a", model("a", 8), None, None);
    let handle = registry.collect(&first);
    cache.get("a", None, None, Some(&handle)).unwrap();
    assert!(cache.get("missing", None, None, Some(&handle)).is_err());

    let stats = registry.get(&first).unwrap().snapshot();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    let other = registry.collect(&second).snapshot();
    assert_eq!((other.hits, other.misses), (0, 0));
    assert_eq!(registry.reset(&first).map(|s| s.hits), Some(1));
}
