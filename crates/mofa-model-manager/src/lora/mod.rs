//! LoRA-family adapters: layer parsing, SDXL key conversion, model assembly

pub mod layer;
pub mod model;
pub mod sdxl;

pub use layer::{AdapterLayer, LayerKind, LayerTensors};
pub use model::LoRAModelRaw;
pub use sdxl::convert_sdxl_keys_to_diffusers_format;
