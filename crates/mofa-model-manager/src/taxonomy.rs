//! Model taxonomy and the read-only model record
//!
//! The record store owns model metadata; the loaders only ever see an
//! [`AnyModelConfig`] snapshot of it.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Base model family a model (or adapter) was trained against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseModelType {
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "sd-1")]
    StableDiffusion1,
    #[serde(rename = "sd-2")]
    StableDiffusion2,
    #[serde(rename = "sdxl")]
    StableDiffusionXL,
    #[serde(rename = "sdxl-refiner")]
    StableDiffusionXLRefiner,
}

impl BaseModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseModelType::Any => "any",
            BaseModelType::StableDiffusion1 => "sd-1",
            BaseModelType::StableDiffusion2 => "sd-2",
            BaseModelType::StableDiffusionXL => "sdxl",
            BaseModelType::StableDiffusionXLRefiner => "sdxl-refiner",
        }
    }
}

/// What kind of network a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Main,
    Vae,
    Lora,
    #[serde(rename = "controlnet")]
    ControlNet,
    Embedding,
    IpAdapter,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Main => "main",
            ModelType::Vae => "vae",
            ModelType::Lora => "lora",
            ModelType::ControlNet => "controlnet",
            ModelType::Embedding => "embedding",
            ModelType::IpAdapter => "ip_adapter",
        }
    }
}

/// On-disk packaging of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// Folder of per-submodel subfolders
    Diffusers,
    /// Single weights file
    Checkpoint,
    /// Single LyCORIS/kohya adapter file
    Lycoris,
}

impl ModelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Diffusers => "diffusers",
            ModelFormat::Checkpoint => "checkpoint",
            ModelFormat::Lycoris => "lycoris",
        }
    }
}

/// Named component of a composite model, cached independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubModelType {
    Unet,
    TextEncoder,
    TextEncoder2,
    Tokenizer,
    Tokenizer2,
    Vae,
    VaeDecoder,
    VaeEncoder,
    Scheduler,
    SafetyChecker,
}

impl SubModelType {
    /// Name of the submodel's subfolder in a diffusers layout.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubModelType::Unet => "unet",
            SubModelType::TextEncoder => "text_encoder",
            SubModelType::TextEncoder2 => "text_encoder_2",
            SubModelType::Tokenizer => "tokenizer",
            SubModelType::Tokenizer2 => "tokenizer_2",
            SubModelType::Vae => "vae",
            SubModelType::VaeDecoder => "vae_decoder",
            SubModelType::VaeEncoder => "vae_encoder",
            SubModelType::Scheduler => "scheduler",
            SubModelType::SafetyChecker => "safety_checker",
        }
    }
}

/// Weight-file variant inside a diffusers repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRepoVariant {
    #[serde(rename = "")]
    Default,
    Fp16,
    Fp32,
    Onnx,
    Openvino,
    Flax,
}

impl ModelRepoVariant {
    /// Infix used in file names (`model.fp16.safetensors`), `None` for the default.
    pub fn infix(&self) -> Option<&'static str> {
        match self {
            ModelRepoVariant::Default => None,
            ModelRepoVariant::Fp16 => Some("fp16"),
            ModelRepoVariant::Fp32 => Some("fp32"),
            ModelRepoVariant::Onnx => Some("onnx"),
            ModelRepoVariant::Openvino => Some("openvino"),
            ModelRepoVariant::Flax => Some("flax"),
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

display_as_str!(BaseModelType, ModelType, ModelFormat, SubModelType);

/// Model record as supplied by the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyModelConfig {
    /// Unique key, also the cache key
    pub key: String,
    pub name: String,
    pub base: BaseModelType,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub format: ModelFormat,
    /// Absolute, or relative to the configured models root
    pub path: PathBuf,
    #[serde(default)]
    pub repo_variant: Option<ModelRepoVariant>,
}

impl AnyModelConfig {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        base: BaseModelType,
        model_type: ModelType,
        format: ModelFormat,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            base,
            model_type,
            format,
            path: path.into(),
            repo_variant: None,
        }
    }

    pub fn with_repo_variant(mut self, variant: ModelRepoVariant) -> Self {
        self.repo_variant = Some(variant);
        self
    }
}
