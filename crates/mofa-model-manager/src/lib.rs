//! # mofa-model-manager
//!
//! Model lifecycle core for MoFA image-generation backends.
//!
//! Keeps decoded model weights in a size-bounded RAM cache, places them on an
//! execution device for the duration of a lock, and turns LoRA-family adapter
//! checkpoints into per-layer weight deltas.
//!
//! ## Features
//!
//! | Feature | Description                              |
//! |---------|------------------------------------------|
//! | `cuda`  | CUDA execution devices (NVIDIA GPUs)     |
//! | `metal` | Metal execution devices (Apple Silicon)  |
//!
//! Without features every load and lock runs on the CPU.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mofa_model_manager::{ModelLoadService, ModelManagerConfig};
//! use mofa_model_manager::taxonomy::{AnyModelConfig, BaseModelType, ModelFormat, ModelType};
//!
//! fn main() -> mofa_model_manager::Result<()> {
//!     let config = ModelManagerConfig::new("/models").with_ram_cache_bytes(8 << 30);
//!     let service = ModelLoadService::new(&config)?;
//!
//!     let record = AnyModelConfig::new(
//!         "b3f1",
//!         "watercolor",
//!         BaseModelType::StableDiffusionXL,
//!         ModelType::Lora,
//!         ModelFormat::Lycoris,
//!         "loras/watercolor.safetensors",
//!     );
//!     let loaded = service.load_model(&record, None, None)?;
//!     let _device = service.ram_cache().reserve_execution_device(None)?;
//!     let locked = loaded.lock()?;
//!     println!("adapter on {:?}", locked.device());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod devices;
pub mod error;
pub mod load;
pub mod lora;
pub mod memory;
pub mod raw_model;
pub mod taxonomy;
pub mod telemetry;

pub use cache::{
    CacheStats, CacheStatsHandle, CacheStatsRegistry, ExecutionDeviceGuard, LockedModel,
    ModelCache, ModelLocker,
};
pub use config::{ModelManagerConfig, Precision};
pub use error::{ModelManagerError, Result};
pub use load::{LoadedModel, LoadedModelWithoutConfig, ModelLoadService, ModelLoaderRegistry};
pub use lora::{AdapterLayer, LayerKind, LoRAModelRaw};
pub use raw_model::{AnyModel, RawModel, TensorStateDict};
