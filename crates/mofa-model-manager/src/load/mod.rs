//! Model loading
//!
//! [`ModelLoadService`] picks a loader from the [`ModelLoaderRegistry`] for a
//! record; each [`ModelLoader`] checks the cache, constructs on a miss and
//! inserts the result.

pub mod checkpoint;
pub mod loaded;
pub mod loader;
pub mod loaders;
pub mod registry;
pub mod service;

pub use loaded::{LoadedModel, LoadedModelWithoutConfig};
pub use loader::{LoadContext, ModelConstructor, ModelLoad, ModelLoader};
pub use loaders::{CheckpointConstructor, LoRAConstructor};
pub use registry::ModelLoaderRegistry;
pub use service::ModelLoadService;
