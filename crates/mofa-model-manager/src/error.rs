//! Error types for the model manager
//!
//! Every failure in the cache, the adapter parser and the loaders funnels into
//! [`ModelManagerError`]. Nothing is swallowed internally: the loader's caller
//! decides whether to retry, degrade or abort.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Model manager error types
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelManagerError {
    /// The requested key is not resident in the RAM cache. Expected on a
    /// first load; the loader reacts by constructing the model.
    #[error("the model with key {0} is not in the cache")]
    NotCached(String),

    /// The files backing a model record do not exist on disk
    #[error("files for model '{name}' not found at {}", path.display())]
    ModelFilesNotFound { name: String, path: PathBuf },

    /// A checkpoint layer group matched none of the known adapter formats
    #[error("unknown LoRA layer format in {model}: {layer_key} - {keys:?}")]
    UnknownLayerFormat {
        model: String,
        layer_key: String,
        keys: Vec<String>,
    },

    /// A layer group selected a format but lacks one of its required tensors
    #[error("LoRA layer {layer_key} is missing required tensor '{tensor}'")]
    MissingLayerTensor { layer_key: String, tensor: String },

    /// A layer group holds an inconsistent set of tensors
    #[error("LoRA layer {layer_key} is malformed: {reason}")]
    MalformedLayer { layer_key: String, reason: String },

    /// An SDXL adapter key does not start with a known namespace prefix
    #[error("unrecognized SDXL LoRA key prefix: '{0}'")]
    UnrecognizedKeyPrefix(String),

    /// Only part of the `lora_unet_` namespace could be remapped
    #[error(
        "the SDXL LoRA could only be partially converted to diffusers format. \
         converted={converted}, not_converted={not_converted}"
    )]
    PartialConversion {
        converted: usize,
        not_converted: usize,
    },

    /// No execution device became free within the wait bound
    #[error("no execution device became free within {timeout_secs}s")]
    DeviceReservationTimeout { timeout_secs: u64 },

    /// The calling thread asked for its device without reserving one first
    #[error("no execution device has been reserved for the use of thread {0}")]
    NoReservation(String),

    /// Moving a model onto an accelerator ran out of device memory
    #[error("insufficient memory on {device} to load model {key}: {reason}")]
    OutOfDeviceMemory {
        key: String,
        device: String,
        reason: String,
    },

    /// A submodel was requested from a model type that has none
    #[error("there are no submodels in a {0} model")]
    SubmodelNotSupported(String),

    /// No loader is registered for the model's base/type/format combination
    #[error("no model loader registered for base={base}, type={model_type}, format={format}")]
    NoLoaderRegistered {
        base: String,
        model_type: String,
        format: String,
    },

    /// The file is not a checkpoint container this crate can decode
    #[error("unsupported checkpoint file: {}", .0.display())]
    UnsupportedCheckpoint(PathBuf),

    /// A device string could not be parsed or opened
    #[error("invalid execution device '{device}': {reason}")]
    InvalidDevice { device: String, reason: String },

    /// Tensor-level failure reported by Candle
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration failure
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ModelManagerError {
    /// True for the cache miss that drives load-on-demand.
    pub fn is_not_cached(&self) -> bool {
        matches!(self, ModelManagerError::NotCached(_))
    }

    /// True for errors caused by a malformed or unsupported checkpoint.
    pub fn is_checkpoint_error(&self) -> bool {
        matches!(
            self,
            ModelManagerError::UnknownLayerFormat { .. }
                | ModelManagerError::MissingLayerTensor { .. }
                | ModelManagerError::MalformedLayer { .. }
                | ModelManagerError::UnrecognizedKeyPrefix(_)
                | ModelManagerError::PartialConversion { .. }
                | ModelManagerError::UnsupportedCheckpoint(_)
        )
    }
}

/// Result type for model manager operations
pub type Result<T> = std::result::Result<T, ModelManagerError>;
