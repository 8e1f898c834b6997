//! Loader lookup by (base, type, format)

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::ModelCache;
use crate::config::ModelManagerConfig;
use crate::error::{ModelManagerError, Result};
use crate::load::loader::{ModelLoad, ModelLoader};
use crate::load::loaders::{CheckpointConstructor, LoRAConstructor};
use crate::taxonomy::{AnyModelConfig, BaseModelType, ModelFormat, ModelType};

type LoaderKey = (BaseModelType, ModelType, ModelFormat);

/// Registered loaders; a loader under [`BaseModelType::Any`] serves every base
#[derive(Default)]
pub struct ModelLoaderRegistry {
    loaders: HashMap<LoaderKey, Arc<dyn ModelLoad>>,
}

impl ModelLoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in checkpoint and adapter loaders.
    pub fn with_default_loaders(config: &ModelManagerConfig, cache: &ModelCache) -> Self {
        let mut registry = Self::new();

        let lora: Arc<dyn ModelLoad> =
            Arc::new(ModelLoader::new(config, cache.clone(), LoRAConstructor));
        for format in [ModelFormat::Lycoris, ModelFormat::Diffusers] {
            registry.register(BaseModelType::Any, ModelType::Lora, format, lora.clone());
        }

        let checkpoint: Arc<dyn ModelLoad> =
            Arc::new(ModelLoader::new(config, cache.clone(), CheckpointConstructor));
        for model_type in [
            ModelType::Main,
            ModelType::Vae,
            ModelType::ControlNet,
            ModelType::Embedding,
            ModelType::IpAdapter,
        ] {
            for format in [ModelFormat::Checkpoint, ModelFormat::Diffusers] {
                registry.register(BaseModelType::Any, model_type, format, checkpoint.clone());
            }
        }
        registry
    }

    /// Register `loader`, replacing any loader under the same key.
    pub fn register(
        &mut self,
        base: BaseModelType,
        model_type: ModelType,
        format: ModelFormat,
        loader: Arc<dyn ModelLoad>,
    ) {
        self.loaders.insert((base, model_type, format), loader);
    }

    /// Loader for a record: exact base first, then the `Any` fallback.
    pub fn get_implementation(&self, config: &AnyModelConfig) -> Result<Arc<dyn ModelLoad>> {
        self.loaders
            .get(&(config.base, config.model_type, config.format))
            .or_else(|| {
                self.loaders
                    .get(&(BaseModelType::Any, config.model_type, config.format))
            })
            .cloned()
            .ok_or_else(|| ModelManagerError::NoLoaderRegistered {
                base: config.base.to_string(),
                model_type: config.model_type.to_string(),
                format: config.format.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}
