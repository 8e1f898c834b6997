//! Load orchestration: cache lookup, path resolution, construction, insertion

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use tracing::{debug, info};

use crate::cache::{CacheStatsHandle, ModelCache, ModelLocker};
use crate::config::ModelManagerConfig;
use crate::devices::choose_dtype;
use crate::error::{ModelManagerError, Result};
use crate::load::checkpoint::size_on_disk;
use crate::load::loaded::LoadedModel;
use crate::memory::MemorySnapshot;
use crate::raw_model::AnyModel;
use crate::taxonomy::{AnyModelConfig, SubModelType};

/// Target placement for freshly constructed weights
///
/// Tensors are decoded straight from the file bytes, so no throwaway
/// initialization ever runs; construction only has to land them here.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub device: Device,
    pub dtype: DType,
}

/// Format-specific part of a loader
pub trait ModelConstructor: Send + Sync {
    /// On-disk location of the record's weights.
    fn model_path(&self, config: &AnyModelConfig, models_path: &Path) -> PathBuf {
        models_path.join(&config.path)
    }

    /// Build the in-memory model from `path`.
    fn construct(
        &self,
        config: &AnyModelConfig,
        path: &Path,
        submodel: Option<SubModelType>,
        ctx: &LoadContext,
    ) -> Result<AnyModel>;
}

/// Something that turns a model record into a cached, lockable model
pub trait ModelLoad: Send + Sync {
    fn load_model(
        &self,
        config: &AnyModelConfig,
        submodel: Option<SubModelType>,
        stats: Option<&CacheStatsHandle>,
    ) -> Result<LoadedModel>;

    /// Estimated in-memory size from the files on disk.
    fn size_on_disk(&self, config: &AnyModelConfig, submodel: Option<SubModelType>)
    -> Result<u64>;

    fn ram_cache(&self) -> &ModelCache;
}

/// Cache-backed loader for one model format
pub struct ModelLoader<C> {
    models_path: PathBuf,
    log_memory_usage: bool,
    context: LoadContext,
    cache: ModelCache,
    constructor: C,
}

impl<C: ModelConstructor> ModelLoader<C> {
    pub fn new(config: &ModelManagerConfig, cache: ModelCache, constructor: C) -> Self {
        let dtype = cache
            .execution_devices()
            .first()
            .map(|device| choose_dtype(device, config.precision))
            .unwrap_or(DType::F32);
        let context = LoadContext {
            device: cache.storage_device().clone(),
            dtype,
        };
        Self {
            models_path: config.models_path.clone(),
            log_memory_usage: config.log_memory_usage,
            context,
            cache,
            constructor,
        }
    }

    pub fn context(&self) -> &LoadContext {
        &self.context
    }

    pub fn model_path(&self, config: &AnyModelConfig) -> PathBuf {
        self.constructor.model_path(config, &self.models_path)
    }

    fn load_and_cache(
        &self,
        config: &AnyModelConfig,
        path: &Path,
        submodel: Option<SubModelType>,
        stats_name: &str,
        stats: Option<&CacheStatsHandle>,
    ) -> Result<ModelLocker> {
        let before = self.log_memory_usage.then(MemorySnapshot::capture);

        let model = self
            .constructor
            .construct(config, path, submodel, &self.context)?;
        let locker = self
            .cache
            .put_and_get(&config.key, model, submodel, Some(stats_name), stats);

        if let Some(before) = before {
            debug!(
                "After loading {}: {}",
                stats_name,
                MemorySnapshot::diff(&before, &MemorySnapshot::capture())
            );
        }
        Ok(locker)
    }
}

impl<C: ModelConstructor> ModelLoad for ModelLoader<C> {
    fn load_model(
        &self,
        config: &AnyModelConfig,
        submodel: Option<SubModelType>,
        stats: Option<&CacheStatsHandle>,
    ) -> Result<LoadedModel> {
        let path = self.model_path(config);
        if !path.exists() {
            return Err(ModelManagerError::ModelFilesNotFound {
                name: config.name.clone(),
                path,
            });
        }

        let stats_name = format!(
            "{}:{}:{}:{}",
            config.base,
            config.model_type,
            config.name,
            submodel.map(|s| s.as_str()).unwrap_or("")
        );

        let locker = match self
            .cache
            .get(&config.key, submodel, Some(&stats_name), stats)
        {
            Ok(locker) => locker,
            Err(err) if err.is_not_cached() => {
                info!(model = %stats_name, path = %path.display(), "Loading model from disk");
                self.load_and_cache(config, &path, submodel, &stats_name, stats)?
            }
            Err(err) => return Err(err),
        };

        Ok(LoadedModel::new(config.clone(), locker))
    }

    fn size_on_disk(
        &self,
        config: &AnyModelConfig,
        submodel: Option<SubModelType>,
    ) -> Result<u64> {
        size_on_disk(&self.model_path(config), submodel, config.repo_variant)
    }

    fn ram_cache(&self) -> &ModelCache {
        &self.cache
    }
}
