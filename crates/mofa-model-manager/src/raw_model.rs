//! Opaque weight objects held by the cache
//!
//! The cache never looks inside a model. It needs three things from it: how
//! many bytes it occupies, a way to migrate it to another device or precision,
//! and a way to produce an independent copy so that moving to an accelerator
//! leaves the CPU-resident original untouched.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

/// Weight object that can live in the model cache
pub trait RawModel: Send + Sync + fmt::Debug {
    /// Bytes occupied by every tensor this model owns.
    fn size_in_bytes(&self) -> u64;

    /// Migrate every owned tensor in place. `None` leaves that axis unchanged.
    ///
    /// A failed migration leaves the model partially moved; it must not be
    /// reused afterwards.
    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()>;

    /// Independent copy whose migration does not affect `self`.
    ///
    /// Candle tensors share storage until an operation produces new storage,
    /// so this is cheap.
    fn clone_model(&self) -> Box<dyn RawModel>;

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a cached model
pub type AnyModel = Arc<dyn RawModel>;

/// Bytes a tensor occupies: element count times element width.
pub fn tensor_size_in_bytes(tensor: &Tensor) -> u64 {
    (tensor.elem_count() * tensor.dtype().size_in_bytes()) as u64
}

/// Move and/or cast a single tensor.
///
/// Integer and boolean tensors keep their dtype; only floating point weights
/// follow the requested precision.
pub fn migrate_tensor(
    tensor: &Tensor,
    device: Option<&Device>,
    dtype: Option<DType>,
) -> candle_core::Result<Tensor> {
    let mut out = match device {
        Some(device) => tensor.to_device(device)?,
        None => tensor.clone(),
    };
    if let Some(dtype) = dtype {
        if out.dtype().is_float() && out.dtype() != dtype {
            out = out.to_dtype(dtype)?;
        }
    }
    Ok(out)
}

/// Flat `name -> tensor` checkpoint, the generic cached model
#[derive(Debug, Clone)]
pub struct TensorStateDict {
    name: String,
    tensors: HashMap<String, Tensor>,
}

impl TensorStateDict {
    pub fn new(name: impl Into<String>, tensors: HashMap<String, Tensor>) -> Self {
        Self {
            name: name.into(),
            tensors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }
}

impl RawModel for TensorStateDict {
    fn size_in_bytes(&self) -> u64 {
        self.tensors.values().map(tensor_size_in_bytes).sum()
    }

    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        for tensor in self.tensors.values_mut() {
            *tensor = migrate_tensor(tensor, device, dtype)?;
        }
        Ok(())
    }

    fn clone_model(&self) -> Box<dyn RawModel> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
