//! Execution device discovery and precision selection
//!
//! Devices come either from configuration (`"cpu"`, `"cuda:1"`, `"metal"`)
//! or from auto-detection in priority order:
//! CUDA (every ordinal that opens) → Metal → CPU
//!
//! Detection only succeeds for backends compiled into Candle (`cuda` / `metal`
//! features); a CPU-only build always resolves to the CPU device.

use candle_core::{DType, Device, DeviceLocation};
use serde::{Deserialize, Serialize};

use crate::config::Precision;
use crate::error::{ModelManagerError, Result};

/// Upper bound on CUDA ordinals probed during auto-detection
const MAX_CUDA_ORDINALS: usize = 16;

/// Kind of compute backend behind a [`Device`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DeviceKind {
    /// NVIDIA CUDA
    Cuda,
    /// Apple Metal
    Metal,
    /// CPU, always available
    Cpu,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cuda => write!(f, "CUDA"),
            DeviceKind::Metal => write!(f, "Metal"),
            DeviceKind::Cpu => write!(f, "CPU"),
        }
    }
}

impl DeviceKind {
    pub fn of(device: &Device) -> Self {
        match device.location() {
            DeviceLocation::Cpu => DeviceKind::Cpu,
            DeviceLocation::Cuda { .. } => DeviceKind::Cuda,
            DeviceLocation::Metal { .. } => DeviceKind::Metal,
        }
    }
}

/// Stable display name for a device, e.g. `cpu` or `cuda:1`.
pub fn device_name(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_string(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
    }
}

/// True for any device other than system RAM.
pub fn is_accelerator(device: &Device) -> bool {
    !matches!(device.location(), DeviceLocation::Cpu)
}

/// Parse and open a device string.
///
/// Accepts `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N` and `mps` (alias for
/// the first Metal device).
pub fn parse_device(name: &str) -> Result<Device> {
    let name = name.trim().to_lowercase();
    let (kind, index) = match name.split_once(':') {
        Some((kind, index)) => {
            let index = index
                .parse::<usize>()
                .map_err(|e| ModelManagerError::InvalidDevice {
                    device: name.clone(),
                    reason: format!("bad ordinal: {e}"),
                })?;
            (kind.to_string(), index)
        }
        None => (name.clone(), 0),
    };

    let device = match kind.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(index),
        "metal" | "mps" => Device::new_metal(index),
        other => {
            return Err(ModelManagerError::InvalidDevice {
                device: name.clone(),
                reason: format!("unknown device type '{other}'"),
            });
        }
    };

    device.map_err(|e| ModelManagerError::InvalidDevice {
        device: name,
        reason: e.to_string(),
    })
}

/// Resolve the execution devices, from configuration when given.
pub fn execution_devices(configured: Option<&[String]>) -> Result<Vec<Device>> {
    match configured {
        Some(specs) => specs.iter().map(|s| parse_device(s)).collect(),
        None => Ok(detect_execution_devices()),
    }
}

/// Auto-detect execution devices. Never empty: falls back to the CPU.
pub fn detect_execution_devices() -> Vec<Device> {
    if candle_core::utils::cuda_is_available() {
        let cuda: Vec<Device> = (0..MAX_CUDA_ORDINALS)
            .map_while(|ordinal| Device::new_cuda(ordinal).ok())
            .collect();
        if !cuda.is_empty() {
            return cuda;
        }
    }

    if candle_core::utils::metal_is_available() {
        if let Ok(device) = Device::new_metal(0) {
            return vec![device];
        }
    }

    vec![Device::Cpu]
}

/// Precision to load weights at for `device`.
///
/// CPU kernels are only fast in F32, so the CPU always gets F32 regardless of
/// the configured precision.
pub fn choose_dtype(device: &Device, precision: Precision) -> DType {
    if !is_accelerator(device) {
        return DType::F32;
    }
    match precision {
        Precision::Auto | Precision::Float16 => DType::F16,
        Precision::Float32 => DType::F32,
        Precision::Bfloat16 => DType::BF16,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        let device = parse_device("cpu").unwrap();
        assert!(!is_accelerator(&device));
        assert_eq!(device_name(&device), "cpu");
        assert_eq!(DeviceKind::of(&device), DeviceKind::Cpu);
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let err = parse_device("tpu:0").unwrap_err();
        assert!(matches!(err, ModelManagerError::InvalidDevice { .. }));
    }

    #[test]
    fn test_parse_rejects_bad_ordinal() {
        assert!(parse_device("cuda:x").is_err());
    }

    #[test]
    fn test_detect_never_empty() {
        let devices = detect_execution_devices();
        assert!(!devices.is_empty());
    }

    #[test]
    fn test_configured_devices() {
        let devices = execution_devices(Some(&["cpu".to_string()])).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].is_cpu());
    }

    #[test]
    fn test_cpu_always_f32() {
        assert_eq!(choose_dtype(&Device::Cpu, Precision::Float16), DType::F32);
        assert_eq!(choose_dtype(&Device::Cpu, Precision::Auto), DType::F32);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(DeviceKind::Cuda.to_string(), "CUDA");
        assert_eq!(DeviceKind::Metal.to_string(), "Metal");
        assert_eq!(DeviceKind::Cpu.to_string(), "CPU");
    }
}
