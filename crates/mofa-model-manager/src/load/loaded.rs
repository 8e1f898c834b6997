//! Results of a load request

use crate::cache::{LockedModel, ModelLocker};
use crate::error::Result;
use crate::raw_model::AnyModel;
use crate::taxonomy::AnyModelConfig;

/// A cached model with no record behind it (loaded by path)
#[derive(Debug, Clone)]
pub struct LoadedModelWithoutConfig {
    locker: ModelLocker,
}

impl LoadedModelWithoutConfig {
    pub fn new(locker: ModelLocker) -> Self {
        Self { locker }
    }

    /// CPU-resident model; no device movement.
    pub fn model(&self) -> AnyModel {
        self.locker.model()
    }

    /// Place the model on this thread's execution device until the guard drops.
    pub fn lock(&self) -> Result<LockedModel> {
        self.locker.lock()
    }

    pub fn locker(&self) -> &ModelLocker {
        &self.locker
    }
}

/// A cached model together with the record it was loaded from
#[derive(Debug, Clone)]
pub struct LoadedModel {
    config: AnyModelConfig,
    inner: LoadedModelWithoutConfig,
}

impl LoadedModel {
    pub fn new(config: AnyModelConfig, locker: ModelLocker) -> Self {
        Self {
            config,
            inner: LoadedModelWithoutConfig::new(locker),
        }
    }

    pub fn config(&self) -> &AnyModelConfig {
        &self.config
    }

    pub fn model(&self) -> AnyModel {
        self.inner.model()
    }

    pub fn lock(&self) -> Result<LockedModel> {
        self.inner.lock()
    }

    pub fn locker(&self) -> &ModelLocker {
        self.inner.locker()
    }
}
