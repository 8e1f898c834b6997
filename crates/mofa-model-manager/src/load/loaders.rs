//! Format-specific constructors

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{ModelManagerError, Result};
use crate::load::checkpoint::{read_state_dict, read_state_dicts, weight_files};
use crate::load::loader::{LoadContext, ModelConstructor};
use crate::lora::LoRAModelRaw;
use crate::raw_model::{AnyModel, RawModel, TensorStateDict};
use crate::taxonomy::{AnyModelConfig, ModelFormat, SubModelType};

/// File names probed, in order, inside a directory-packaged adapter
pub const LORA_WEIGHT_FILES: [&str; 2] = [
    "pytorch_lora_weights.safetensors",
    "pytorch_lora_weights.bin",
];

/// Generic loader: the checkpoint's tensors become a [`TensorStateDict`]
///
/// Single-file checkpoints are read whole. Diffusers folders resolve the
/// submodel to its subfolder and prefer the record's repo variant.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckpointConstructor;

impl ModelConstructor for CheckpointConstructor {
    fn construct(
        &self,
        config: &AnyModelConfig,
        path: &Path,
        submodel: Option<SubModelType>,
        ctx: &LoadContext,
    ) -> Result<AnyModel> {
        let (name, tensors) = if path.is_dir() {
            let folder = match submodel {
                Some(submodel) => path.join(submodel.as_str()),
                None => path.to_path_buf(),
            };
            let files = weight_files(&folder, config.repo_variant)?;
            if files.is_empty() {
                return Err(ModelManagerError::ModelFilesNotFound {
                    name: config.name.clone(),
                    path: folder,
                });
            }
            debug!(model = %config.name, files = files.len(), "Reading diffusers weights");
            let name = match submodel {
                Some(submodel) => format!("{}:{}", config.name, submodel),
                None => config.name.clone(),
            };
            (name, read_state_dicts(&files)?)
        } else {
            (config.name.clone(), read_state_dict(path)?)
        };

        let mut model = TensorStateDict::new(name, tensors);
        model.to(Some(&ctx.device), Some(ctx.dtype))?;
        Ok(Arc::new(model))
    }
}

/// Adapter loader: parses the checkpoint into a [`LoRAModelRaw`]
///
/// Diffusers-format adapters are folders holding one of
/// [`LORA_WEIGHT_FILES`]; every other format points at the weights directly.
///
/// The record's base model travels with each call, so one constructor serves
/// concurrent loads of adapters for different bases.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoRAConstructor;

impl ModelConstructor for LoRAConstructor {
    fn model_path(&self, config: &AnyModelConfig, models_path: &Path) -> PathBuf {
        let path = models_path.join(&config.path);
        if config.format == ModelFormat::Diffusers && path.is_dir() {
            for file in LORA_WEIGHT_FILES {
                let candidate = path.join(file);
                if candidate.exists() {
                    return candidate;
                }
            }
        }
        path
    }

    fn construct(
        &self,
        config: &AnyModelConfig,
        path: &Path,
        submodel: Option<SubModelType>,
        ctx: &LoadContext,
    ) -> Result<AnyModel> {
        if submodel.is_some() {
            return Err(ModelManagerError::SubmodelNotSupported(
                config.model_type.to_string(),
            ));
        }
        let model = LoRAModelRaw::from_checkpoint(path, &ctx.device, ctx.dtype, Some(config.base))?;
        Ok(Arc::new(model))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use candle_core::{DType, Device, Tensor};

    use super::*;
    use crate::taxonomy::{BaseModelType, ModelType};

    fn ctx() -> LoadContext {
        LoadContext {
            device: Device::Cpu,
            dtype: DType::F16,
        }
    }

    fn save(path: &Path, entries: &[(&str, (usize, usize))]) {
        let tensors: HashMap<String, Tensor> = entries
            .iter()
            .map(|(k, shape)| {
                (
                    k.to_string(),
                    Tensor::ones(*shape, DType::F32, &Device::Cpu).unwrap(),
                )
            })
            .collect();
        candle_core::safetensors::save(&tensors, path).unwrap();
    }

    fn lora_record(path: &str) -> AnyModelConfig {
        AnyModelConfig::new(
            "lora1",
            "style",
            BaseModelType::StableDiffusion1,
            ModelType::Lora,
            ModelFormat::Diffusers,
            path,
        )
    }

    #[test]
    fn test_lora_dir_probe_order() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("style");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("pytorch_lora_weights.bin"), b"x").unwrap();

        let record = lora_record("style");
        assert_eq!(
            LoRAConstructor.model_path(&record, dir.path()),
            pkg.join("pytorch_lora_weights.bin")
        );

        fs::write(pkg.join("pytorch_lora_weights.safetensors"), b"x").unwrap();
        assert_eq!(
            LoRAConstructor.model_path(&record, dir.path()),
            pkg.join("pytorch_lora_weights.safetensors")
        );
    }

    #[test]
    fn test_lycoris_dir_path_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("style");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("pytorch_lora_weights.safetensors"), b"x").unwrap();

        let mut record = lora_record("style");
        record.format = ModelFormat::Lycoris;
        assert_eq!(LoRAConstructor.model_path(&record, dir.path()), pkg);
    }

    #[test]
    fn test_lora_rejects_submodel() {
        let err = LoRAConstructor
            .construct(
                &lora_record("x.safetensors"),
                Path::new("x.safetensors"),
                Some(SubModelType::Unet),
                &ctx(),
            )
            .unwrap_err();
        assert!(matches!(err, ModelManagerError::SubmodelNotSupported(_)));
    }

    #[test]
    fn test_lora_construct_casts_to_context_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("style.safetensors");
        save(
            &path,
            &[
                ("lora_unet_a.lora_up.weight", (4, 2)),
                ("lora_unet_a.lora_down.weight", (2, 4)),
            ],
        );
        let model = LoRAConstructor
            .construct(&lora_record("style.safetensors"), &path, None, &ctx())
            .unwrap();
        let lora = model.as_any().downcast_ref::<LoRAModelRaw>().unwrap();
        assert_eq!(lora.name(), "style");
        assert_eq!(model.size_in_bytes(), 16 * 2);
    }

    #[test]
    fn test_checkpoint_diffusers_submodel() {
        let dir = tempfile::tempdir().unwrap();
        let vae = dir.path().join("vae");
        fs::create_dir(&vae).unwrap();
        save(&vae.join("diffusion_pytorch_model.safetensors"), &[("w", (2, 2))]);
        save(
            &vae.join("diffusion_pytorch_model.fp16.safetensors"),
            &[("w", (2, 2)), ("b", (1, 2))],
        );

        let record = AnyModelConfig::new(
            "main1",
            "sd",
            BaseModelType::StableDiffusion1,
            ModelType::Main,
            ModelFormat::Diffusers,
            dir.path(),
        );
        let plain = CheckpointConstructor
            .construct(&record, dir.path(), Some(SubModelType::Vae), &ctx())
            .unwrap();
        let dict = plain.as_any().downcast_ref::<TensorStateDict>().unwrap();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.name(), "sd:vae");

        let record = record.with_repo_variant(crate::taxonomy::ModelRepoVariant::Fp16);
        let fp16 = CheckpointConstructor
            .construct(&record, dir.path(), Some(SubModelType::Vae), &ctx())
            .unwrap();
        assert_eq!(
            fp16.as_any().downcast_ref::<TensorStateDict>().unwrap().len(),
            2
        );
    }

    #[test]
    fn test_checkpoint_empty_folder() {
        let dir = tempfile::tempdir().unwrap();
        let record = AnyModelConfig::new(
            "main1",
            "sd",
            BaseModelType::StableDiffusion1,
            ModelType::Main,
            ModelFormat::Diffusers,
            dir.path(),
        );
        let err = CheckpointConstructor
            .construct(&record, dir.path(), None, &ctx())
            .unwrap_err();
        assert!(matches!(err, ModelManagerError::ModelFilesNotFound { .. }));
    }
}
