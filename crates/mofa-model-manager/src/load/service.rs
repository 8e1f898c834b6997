//! Front door for model loading

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheStatsHandle, ModelCache};
use crate::config::ModelManagerConfig;
use crate::devices::is_accelerator;
use crate::error::Result;
use crate::load::checkpoint::{read_state_dict, read_state_dicts, weight_files};
use crate::load::loaded::{LoadedModel, LoadedModelWithoutConfig};
use crate::load::registry::ModelLoaderRegistry;
use crate::raw_model::{AnyModel, TensorStateDict};
use crate::taxonomy::{AnyModelConfig, SubModelType};

/// Custom constructor for [`ModelLoadService::load_model_from_path`]
pub type PathConstructor<'a> = &'a dyn Fn(&Path) -> Result<AnyModel>;

/// Loads models by record or by path into one shared cache
pub struct ModelLoadService {
    cache: ModelCache,
    registry: ModelLoaderRegistry,
}

impl ModelLoadService {
    /// Service with its own cache and the default loaders.
    pub fn new(config: &ModelManagerConfig) -> Result<Self> {
        config.validate()?;
        let cache = ModelCache::new(config)?;
        Ok(Self::with_cache(config, cache))
    }

    pub fn with_cache(config: &ModelManagerConfig, cache: ModelCache) -> Self {
        let registry = ModelLoaderRegistry::with_default_loaders(config, &cache);
        Self { cache, registry }
    }

    pub fn with_registry(cache: ModelCache, registry: ModelLoaderRegistry) -> Self {
        Self { cache, registry }
    }

    pub fn ram_cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn registry(&self) -> &ModelLoaderRegistry {
        &self.registry
    }

    /// Number of accelerator execution devices.
    pub fn gpu_count(&self) -> usize {
        self.cache
            .execution_devices()
            .iter()
            .filter(|d| is_accelerator(d))
            .count()
    }

    /// Load a record's model (or submodel), from the cache when resident.
    pub fn load_model(
        &self,
        config: &AnyModelConfig,
        submodel: Option<SubModelType>,
        stats: Option<&CacheStatsHandle>,
    ) -> Result<LoadedModel> {
        info!(
            key = %config.key,
            model = %config.name,
            submodel = submodel.map(|s| s.as_str()).unwrap_or(""),
            "Loading model"
        );
        self.registry
            .get_implementation(config)?
            .load_model(config, submodel, stats)
    }

    /// Load an arbitrary weights file or folder, cached under its path.
    ///
    /// Without a `constructor` the tensors are read into a
    /// [`TensorStateDict`]; folders contribute every weight file they hold.
    pub fn load_model_from_path(
        &self,
        path: &Path,
        constructor: Option<PathConstructor<'_>>,
        stats: Option<&CacheStatsHandle>,
    ) -> Result<LoadedModelWithoutConfig> {
        let key = path.display().to_string();
        match self.cache.get(&key, None, None, stats) {
            Ok(locker) => return Ok(LoadedModelWithoutConfig::new(locker)),
            Err(err) if err.is_not_cached() => {}
            Err(err) => return Err(err),
        }

        let model = match constructor {
            Some(construct) => construct(path)?,
            None => default_path_constructor(path)?,
        };
        Ok(LoadedModelWithoutConfig::new(
            self.cache.put_and_get(&key, model, None, None, stats),
        ))
    }
}

fn default_path_constructor(path: &Path) -> Result<AnyModel> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tensors = if path.is_dir() {
        read_state_dicts(&weight_files(path, None)?)?
    } else {
        read_state_dict(path)?
    };
    Ok(Arc::new(TensorStateDict::new(name, tensors)))
}
