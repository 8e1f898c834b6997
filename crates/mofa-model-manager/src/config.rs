//! Configuration for the model manager
//!
//! [`ModelManagerConfig`] is what the application's configuration provider
//! hands to the cache and loaders. It can be built in code with the `with_*`
//! builders or loaded from any format the `config` crate understands, with
//! `MOFA_MODELS_*` environment variables layered on top.

use std::path::{Path, PathBuf};

use config::{Config as Cfg, Environment, File, FileFormat, Map};
use serde::{Deserialize, Serialize};

/// Size of a GiB in bytes.
pub const GIB: u64 = 1 << 30;

/// Default RAM cache: roughly three fp16 diffusion models.
pub const DEFAULT_RAM_CACHE_BYTES: u64 = 6 * GIB;

/// Default VRAM cache budget.
pub const DEFAULT_VRAM_CACHE_BYTES: u64 = GIB / 4;

/// Wait up to 10 minutes for an execution device to become free.
pub const DEFAULT_DEVICE_WAIT_SECS: u64 = 600;

/// Environment prefix for overrides, e.g. `MOFA_MODELS_RAM_CACHE_BYTES`.
pub const ENV_PREFIX: &str = "MOFA_MODELS";

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Floating point precision requested for loaded weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// F16 on accelerators, F32 on CPU
    #[default]
    Auto,
    Float32,
    Float16,
    Bfloat16,
}

/// Settings consumed by the model cache and the loaders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelManagerConfig {
    /// Root directory that model record paths are relative to
    pub models_path: PathBuf,

    /// Capacity of the RAM cache in bytes (advisory, see `ModelCache::make_room`)
    pub ram_cache_bytes: u64,

    /// VRAM budget in bytes, reported in cache diagnostics. Moves onto an
    /// accelerator are never refused against it.
    pub vram_cache_bytes: u64,

    /// Default tracing level, e.g. `info` or `mofa_model_manager=debug`
    pub log_level: String,

    /// Capture process memory snapshots around cache operations
    pub log_memory_usage: bool,

    /// Explicit execution devices (`"cpu"`, `"cuda:1"`, `"metal"`).
    /// Auto-detected when absent.
    pub devices: Option<Vec<String>>,

    /// Precision for loaded weights
    pub precision: Precision,

    /// Default bound on waiting for a free execution device
    pub device_wait_secs: u64,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            models_path: PathBuf::from("models"),
            ram_cache_bytes: DEFAULT_RAM_CACHE_BYTES,
            vram_cache_bytes: DEFAULT_VRAM_CACHE_BYTES,
            log_level: String::from("info"),
            log_memory_usage: false,
            devices: None,
            precision: Precision::Auto,
            device_wait_secs: DEFAULT_DEVICE_WAIT_SECS,
        }
    }
}

impl ModelManagerConfig {
    pub fn new(models_path: impl Into<PathBuf>) -> Self {
        Self {
            models_path: models_path.into(),
            ..Default::default()
        }
    }

    pub fn with_ram_cache_bytes(mut self, bytes: u64) -> Self {
        self.ram_cache_bytes = bytes;
        self
    }

    pub fn with_vram_cache_bytes(mut self, bytes: u64) -> Self {
        self.vram_cache_bytes = bytes;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_log_memory_usage(mut self, enabled: bool) -> Self {
        self.log_memory_usage = enabled;
        self
    }

    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = Some(devices.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_device_wait_secs(mut self, secs: u64) -> Self {
        self.device_wait_secs = secs;
        self
    }

    /// Reject settings the cache cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.ram_cache_bytes == 0 {
            return Err(ConfigError::Invalid("ram_cache_bytes must be > 0".into()));
        }
        if let Some(devices) = &self.devices {
            if devices.is_empty() {
                return Err(ConfigError::Invalid(
                    "devices must not be empty when set".into(),
                ));
            }
        }
        Ok(())
    }

    /// Load from a file, format detected from its extension, then apply
    /// `MOFA_MODELS_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        Self::build(Some((&content, format)), None)
    }

    /// Parse from a string in the given format, then apply environment overrides.
    pub fn from_str(content: &str, format: FileFormat) -> ConfigResult<Self> {
        Self::build(Some((content, format)), None)
    }

    /// Defaults plus environment overrides only.
    pub fn from_env() -> ConfigResult<Self> {
        Self::build(None, None)
    }

    /// Defaults plus overrides taken from `vars` instead of the process
    /// environment. Names follow the same `MOFA_MODELS_*` scheme.
    pub fn from_env_vars(vars: Map<String, String>) -> ConfigResult<Self> {
        Self::build(None, Some(vars))
    }

    fn build(
        source: Option<(&str, FileFormat)>,
        env: Option<Map<String, String>>,
    ) -> ConfigResult<Self> {
        let mut builder = Cfg::builder();
        if let Some((content, format)) = source {
            builder = builder.add_source(File::from_str(content, format));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let config: Self = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

// ============================================================================
// Tests
// ============================================================================
