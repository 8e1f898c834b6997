//! Reading weight files from disk
//!
//! Two container formats are understood, both decoded onto the CPU:
//! - safetensors (`.safetensors`)
//! - PyTorch pickles (`.bin`, `.pt`, `.pth`, `.ckpt`)

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::error::{ModelManagerError, Result};
use crate::taxonomy::{ModelRepoVariant, SubModelType};

const PICKLE_EXTENSIONS: [&str; 4] = ["bin", "pt", "pth", "ckpt"];

/// Container format of a single weight file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Safetensors,
    Pickle,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if ext == "safetensors" {
            Some(CheckpointFormat::Safetensors)
        } else if PICKLE_EXTENSIONS.contains(&ext.as_str()) {
            Some(CheckpointFormat::Pickle)
        } else {
            None
        }
    }
}

/// Decode a weight file into a `name -> tensor` map on the CPU.
pub fn read_state_dict(path: &Path) -> Result<HashMap<String, Tensor>> {
    let format = CheckpointFormat::from_path(path)
        .ok_or_else(|| ModelManagerError::UnsupportedCheckpoint(path.to_path_buf()))?;
    // surface a missing file as an IO error rather than a decode error
    fs::metadata(path)?;

    let tensors = match format {
        CheckpointFormat::Safetensors => candle_core::safetensors::load(path, &Device::Cpu)?,
        CheckpointFormat::Pickle => candle_core::pickle::read_all(path)?.into_iter().collect(),
    };
    debug!(path = %path.display(), tensors = tensors.len(), "Read checkpoint");
    Ok(tensors)
}

/// Decode several weight files (shards) into one map.
pub fn read_state_dicts(paths: &[PathBuf]) -> Result<HashMap<String, Tensor>> {
    let mut merged = HashMap::new();
    for path in paths {
        merged.extend(read_state_dict(path)?);
    }
    Ok(merged)
}

fn is_variant_file(file_name: &str, infix: &str) -> bool {
    file_name.contains(&format!(".{infix}.")) || file_name.contains(&format!(".{infix}-"))
}

fn is_any_variant_file(file_name: &str) -> bool {
    ["fp16", "fp32", "onnx", "openvino", "flax", "8bit"]
        .iter()
        .any(|infix| is_variant_file(file_name, infix))
}

/// Regular files directly inside `dir`, sorted by name.
fn files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Select the files of `variant` among `files`, or the plain files when no
/// variant is requested or none of that variant exist.
fn select_variant(files: Vec<PathBuf>, variant: Option<ModelRepoVariant>) -> Vec<PathBuf> {
    let name = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    if let Some(infix) = variant.and_then(|v| v.infix()) {
        let chosen: Vec<PathBuf> = files
            .iter()
            .filter(|p| is_variant_file(&name(p), infix))
            .cloned()
            .collect();
        if !chosen.is_empty() {
            return chosen;
        }
    }
    files
        .into_iter()
        .filter(|p| !is_any_variant_file(&name(p)))
        .collect()
}

/// Weight files making up a diffusers (sub)folder.
///
/// Safetensors files are preferred over pickles when both are present.
pub fn weight_files(dir: &Path, variant: Option<ModelRepoVariant>) -> Result<Vec<PathBuf>> {
    let candidates: Vec<PathBuf> = files_in(dir)?
        .into_iter()
        .filter(|p| CheckpointFormat::from_path(p).is_some())
        .collect();
    let selected = select_variant(candidates, variant);

    let safetensors: Vec<PathBuf> = selected
        .iter()
        .filter(|p| CheckpointFormat::from_path(p) == Some(CheckpointFormat::Safetensors))
        .cloned()
        .collect();
    Ok(if safetensors.is_empty() {
        selected
    } else {
        safetensors
    })
}

/// Estimate a model's in-memory size from its files on disk.
///
/// A file path is its own size. For a folder the submodel's subfolder is
/// used when given, and only files of the requested repo variant are counted
/// (falling back to the plain files).
pub fn size_on_disk(
    path: &Path,
    submodel: Option<SubModelType>,
    variant: Option<ModelRepoVariant>,
) -> Result<u64> {
    let path = match submodel {
        Some(submodel) if path.is_dir() => path.join(submodel.as_str()),
        _ => path.to_path_buf(),
    };

    if path.is_file() {
        return Ok(fs::metadata(&path)?.len());
    }

    let mut total = 0;
    for file in select_variant(files_in(&path)?, variant) {
        total += fs::metadata(&file)?.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn write(path: &Path, bytes: usize) {
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            CheckpointFormat::from_path(Path::new("a.SafeTensors")),
            Some(CheckpointFormat::Safetensors)
        );
        assert_eq!(
            CheckpointFormat::from_path(Path::new("a.ckpt")),
            Some(CheckpointFormat::Pickle)
        );
        assert_eq!(CheckpointFormat::from_path(Path::new("a.gguf")), None);
    }

    #[test]
    fn test_read_unsupported_extension() {
        let err = read_state_dict(Path::new("weights.gguf")).unwrap_err();
        assert!(matches!(err, ModelManagerError::UnsupportedCheckpoint(_)));
    }

    #[test]
    fn test_read_missing_file_is_io_error() {
        let err = read_state_dict(Path::new("/nonexistent/w.safetensors")).unwrap_err();
        assert!(matches!(err, ModelManagerError::Io(_)));
    }

    #[test]
    fn test_safetensors_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "a.weight".to_string(),
            Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let loaded = read_state_dict(&path).unwrap();
        assert_eq!(loaded["a.weight"].dims(), &[2, 3]);
    }

    #[test]
    fn test_size_on_disk_file_and_submodel() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("m.safetensors");
        write(&file, 100);
        assert_eq!(size_on_disk(&file, None, None).unwrap(), 100);

        let unet = dir.path().join("unet");
        fs::create_dir(&unet).unwrap();
        write(&unet.join("diffusion_pytorch_model.safetensors"), 40);
        write(&unet.join("config.json"), 2);
        assert_eq!(
            size_on_disk(dir.path(), Some(SubModelType::Unet), None).unwrap(),
            42
        );
    }

    #[test]
    fn test_size_on_disk_prefers_variant() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("model.safetensors"), 80);
        write(&dir.path().join("model.fp16.safetensors"), 40);
        write(&dir.path().join("config.json"), 1);

        assert_eq!(size_on_disk(dir.path(), None, None).unwrap(), 81);
        assert_eq!(
            size_on_disk(dir.path(), None, Some(ModelRepoVariant::Fp16)).unwrap(),
            40
        );
        // no fp32 files: fall back to the plain ones
        assert_eq!(
            size_on_disk(dir.path(), None, Some(ModelRepoVariant::Fp32)).unwrap(),
            81
        );
    }

    #[test]
    fn test_weight_files_prefers_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("model.bin"), 1);
        write(&dir.path().join("model.safetensors"), 1);
        write(&dir.path().join("model.fp16.safetensors"), 1);

        let plain = weight_files(dir.path(), None).unwrap();
        assert_eq!(plain, vec![dir.path().join("model.safetensors")]);

        let fp16 = weight_files(dir.path(), Some(ModelRepoVariant::Fp16)).unwrap();
        assert_eq!(fp16, vec![dir.path().join("model.fp16.safetensors")]);
    }
}
