//! LoRA-family adapter layers
//!
//! A checkpoint groups tensors per target module (`lora_unet_..._proj_in`)
//! and the suffixes present in a group decide which weight-delta formula the
//! group encodes:
//!
//! | Suffix present                 | Layer                           |
//! |--------------------------------|---------------------------------|
//! | `lora_up.weight`               | [`LowRankLayer`] (LoRA / LoCon) |
//! | `hada_w1_a`                    | [`HadamardLayer`] (LoHA)        |
//! | `lokr_w1` or `lokr_w1_a`       | [`KroneckerLayer`] (LoKR)       |
//! | `diff`                         | [`FullDiffLayer`]               |
//! | `on_input`                     | [`ChannelScaleLayer`] (IA3)     |
//!
//! The table is evaluated top to bottom; the first match wins.

use std::collections::{HashMap, HashSet};
use std::fmt;

use candle_core::{DType, Device, Tensor};
use tracing::warn;

use crate::error::{ModelManagerError, Result};
use crate::raw_model::{migrate_tensor, tensor_size_in_bytes};

/// Tensors of one layer group, keyed by suffix (`lora_up.weight`, `alpha`, ...)
pub type LayerTensors = HashMap<String, Tensor>;

/// Keys every layer understands regardless of its kind
const BASE_KEYS: [&str; 4] = ["alpha", "bias_indices", "bias_values", "bias_size"];

// ============================================================================
// Shared layer state
// ============================================================================

/// State common to every layer kind
#[derive(Debug, Clone)]
pub struct LayerBase {
    pub layer_key: String,
    /// Scalar scale numerator, if stored
    pub alpha: Option<f64>,
    /// Dense bias delta
    pub bias: Option<Tensor>,
    /// Factorization bottleneck; `None` for unscaled layers
    pub rank: Option<usize>,
}

impl LayerBase {
    fn parse(layer_key: &str, values: &mut LayerTensors) -> Result<Self> {
        let alpha = match values.remove("alpha") {
            Some(alpha) => read_scalar(&alpha)?,
            None => None,
        };

        let bias = match (
            values.remove("bias_indices"),
            values.remove("bias_values"),
            values.remove("bias_size"),
        ) {
            (Some(indices), Some(bias_values), Some(size)) => {
                Some(densify_sparse(&indices, &bias_values, &size)?)
            }
            _ => None,
        };

        Ok(Self {
            layer_key: layer_key.to_string(),
            alpha,
            bias,
            rank: None,
        })
    }

    fn size_in_bytes(&self) -> u64 {
        self.bias.as_ref().map(tensor_size_in_bytes).unwrap_or(0)
    }

    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        if let Some(bias) = &self.bias {
            self.bias = Some(migrate_tensor(bias, device, dtype)?);
        }
        Ok(())
    }
}

fn read_scalar(tensor: &Tensor) -> Result<Option<f64>> {
    let values = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok(values.first().copied())
}

/// Densify a COO tensor: `indices` is `(ndim, nnz)`, `values` is `(nnz,)`,
/// `size` holds the dense shape. Duplicate coordinates are summed.
fn densify_sparse(indices: &Tensor, values: &Tensor, size: &Tensor) -> Result<Tensor> {
    let shape: Vec<usize> = size
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1::<i64>()?
        .into_iter()
        .map(|d| d.max(0) as usize)
        .collect();
    let coords = indices.to_dtype(DType::I64)?.to_vec2::<i64>()?;
    let entries = values.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

    if coords.len() != shape.len() {
        return Err(candle_core::Error::Msg(format!(
            "sparse bias has {} index rows for a {}-d shape",
            coords.len(),
            shape.len()
        ))
        .into());
    }

    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }

    let mut dense = vec![0f32; shape.iter().product()];
    for (n, value) in entries.iter().enumerate() {
        let mut offset = 0usize;
        for (d, row) in coords.iter().enumerate() {
            let idx = row.get(n).copied().unwrap_or(-1);
            if idx < 0 || idx as usize >= shape[d] {
                return Err(candle_core::Error::Msg(format!(
                    "sparse bias index {idx} out of bounds for dim {d} of size {}",
                    shape[d]
                ))
                .into());
            }
            offset += idx as usize * strides[d];
        }
        dense[offset] += value;
    }

    Ok(Tensor::from_vec(dense, shape, values.device())?.to_dtype(values.dtype())?)
}

/// Keys of `values` handled by neither the layer kind nor [`LayerBase`].
pub fn unhandled_keys<'a>(
    values: impl IntoIterator<Item = &'a String>,
    known: &[&str],
) -> Vec<String> {
    let known: HashSet<&str> = known.iter().chain(BASE_KEYS.iter()).copied().collect();
    let mut unknown: Vec<String> = values
        .into_iter()
        .filter(|k| !known.contains(k.as_str()))
        .cloned()
        .collect();
    unknown.sort();
    unknown
}

fn warn_unhandled(layer_key: &str, values: &LayerTensors, known: &[&str]) {
    let unknown = unhandled_keys(values.keys(), known);
    if !unknown.is_empty() {
        warn!(
            layer = layer_key,
            keys = ?unknown,
            "Unexpected keys found in LoRA/LyCORIS layer, model might work incorrectly"
        );
    }
}

fn take(values: &mut LayerTensors, layer_key: &str, name: &str) -> Result<Tensor> {
    values
        .remove(name)
        .ok_or_else(|| ModelManagerError::MissingLayerTensor {
            layer_key: layer_key.to_string(),
            tensor: name.to_string(),
        })
}

fn migrate_opt(
    tensor: &mut Option<Tensor>,
    device: Option<&Device>,
    dtype: Option<DType>,
) -> candle_core::Result<()> {
    if let Some(t) = tensor.as_ref() {
        *tensor = Some(migrate_tensor(t, device, dtype)?);
    }
    Ok(())
}

fn opt_size(tensor: &Option<Tensor>) -> u64 {
    tensor.as_ref().map(tensor_size_in_bytes).unwrap_or(0)
}

// ============================================================================
// Tensor algebra
// ============================================================================

/// Tucker-style reconstruction `einsum("i j k l, i p, j r -> p r k l")`.
///
/// `core` is `(i, j, k, l)`, `left` is `(i, p)`, `right` is `(j, r)`; the
/// result is `(p, r, k, l)`.
pub fn rebuild_tucker(core: &Tensor, left: &Tensor, right: &Tensor) -> candle_core::Result<Tensor> {
    let (i, j, k, l) = core.dims4()?;
    let p = left.dim(1)?;
    let r = right.dim(1)?;

    // contract i: (p, i) @ (i, j*k*l)
    let x = left
        .t()?
        .contiguous()?
        .matmul(&core.contiguous()?.reshape((i, j * k * l))?)?;
    // move j last and contract it: (p*k*l, j) @ (j, r)
    let x = x
        .reshape((p, j, k, l))?
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((p * k * l, j))?
        .matmul(&right.contiguous()?)?;
    x.reshape((p, k, l, r))?.permute((0, 3, 1, 2))?.contiguous()
}

/// Kronecker product of two tensors of any rank.
///
/// The lower-rank operand is padded with leading unit dimensions, so
/// `(a0, a1) x (b0, b1)` gives `(a0 * b0, a1 * b1)`.
pub fn kron(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    let ndim = a.rank().max(b.rank());
    let pad = |t: &Tensor| -> Vec<usize> {
        let mut dims = vec![1usize; ndim - t.rank()];
        dims.extend_from_slice(t.dims());
        dims
    };
    let a_dims = pad(a);
    let b_dims = pad(b);

    let a_spread: Vec<usize> = a_dims.iter().flat_map(|&d| [d, 1]).collect();
    let b_spread: Vec<usize> = b_dims.iter().flat_map(|&d| [1, d]).collect();
    let out: Vec<usize> = a_dims.iter().zip(&b_dims).map(|(x, y)| x * y).collect();

    a.contiguous()?
        .reshape(a_spread)?
        .broadcast_mul(&b.contiguous()?.reshape(b_spread)?)?
        .reshape(out)
}

// ============================================================================
// Layer kinds
// ============================================================================

/// Classic LoRA / LoCon: `up @ down`, optionally through a `mid` core
#[derive(Debug, Clone)]
pub struct LowRankLayer {
    pub base: LayerBase,
    pub up: Tensor,
    pub mid: Option<Tensor>,
    pub down: Tensor,
}

impl LowRankLayer {
    const KEYS: [&'static str; 3] = ["lora_up.weight", "lora_down.weight", "lora_mid.weight"];

    pub fn parse(layer_key: &str, mut values: LayerTensors) -> Result<Self> {
        warn_unhandled(layer_key, &values, &Self::KEYS);
        let mut base = LayerBase::parse(layer_key, &mut values)?;
        let up = take(&mut values, layer_key, "lora_up.weight")?;
        let down = take(&mut values, layer_key, "lora_down.weight")?;
        let mid = values.remove("lora_mid.weight");
        base.rank = Some(down.dim(0)?);
        Ok(Self { base, up, mid, down })
    }

    fn get_weight(&self) -> candle_core::Result<Tensor> {
        match &self.mid {
            Some(mid) => {
                let up = self.up.reshape((self.up.dim(0)?, self.up.dim(1)?))?;
                let down = self.down.reshape((self.down.dim(0)?, self.down.dim(1)?))?;
                // einsum("m n w h, i m, n j -> i j w h", mid, up, down)
                rebuild_tucker(mid, &up.t()?, &down)
            }
            None => self
                .up
                .flatten_from(1)?
                .contiguous()?
                .matmul(&self.down.flatten_from(1)?.contiguous()?),
        }
    }

    fn size_in_bytes(&self) -> u64 {
        tensor_size_in_bytes(&self.up) + tensor_size_in_bytes(&self.down) + opt_size(&self.mid)
    }

    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        self.up = migrate_tensor(&self.up, device, dtype)?;
        self.down = migrate_tensor(&self.down, device, dtype)?;
        migrate_opt(&mut self.mid, device, dtype)
    }
}

/// LoHA: elementwise product of two low-rank reconstructions
#[derive(Debug, Clone)]
pub struct HadamardLayer {
    pub base: LayerBase,
    pub w1_a: Tensor,
    pub w1_b: Tensor,
    pub w2_a: Tensor,
    pub w2_b: Tensor,
    pub t1: Option<Tensor>,
    pub t2: Option<Tensor>,
}

impl HadamardLayer {
    const KEYS: [&'static str; 6] = [
        "hada_w1_a",
        "hada_w1_b",
        "hada_w2_a",
        "hada_w2_b",
        "hada_t1",
        "hada_t2",
    ];

    pub fn parse(layer_key: &str, mut values: LayerTensors) -> Result<Self> {
        warn_unhandled(layer_key, &values, &Self::KEYS);
        let mut base = LayerBase::parse(layer_key, &mut values)?;
        let w1_a = take(&mut values, layer_key, "hada_w1_a")?;
        let w1_b = take(&mut values, layer_key, "hada_w1_b")?;
        let w2_a = take(&mut values, layer_key, "hada_w2_a")?;
        let w2_b = take(&mut values, layer_key, "hada_w2_b")?;
        let t1 = values.remove("hada_t1");
        let t2 = values.remove("hada_t2");
        if t1.is_some() != t2.is_some() {
            return Err(ModelManagerError::MalformedLayer {
                layer_key: layer_key.to_string(),
                reason: "hada_t1 and hada_t2 must be given together".to_string(),
            });
        }
        base.rank = Some(w1_b.dim(0)?);
        Ok(Self {
            base,
            w1_a,
            w1_b,
            w2_a,
            w2_b,
            t1,
            t2,
        })
    }

    fn get_weight(&self) -> candle_core::Result<Tensor> {
        match (&self.t1, &self.t2) {
            (Some(t1), Some(t2)) => {
                let rebuild1 = rebuild_tucker(t1, &self.w1_a, &self.w1_b)?;
                let rebuild2 = rebuild_tucker(t2, &self.w2_a, &self.w2_b)?;
                rebuild1 * rebuild2
            }
            _ => {
                let w1 = self.w1_a.matmul(&self.w1_b)?;
                let w2 = self.w2_a.matmul(&self.w2_b)?;
                w1 * w2
            }
        }
    }

    fn size_in_bytes(&self) -> u64 {
        [&self.w1_a, &self.w1_b, &self.w2_a, &self.w2_b]
            .into_iter()
            .map(tensor_size_in_bytes)
            .sum::<u64>()
            + opt_size(&self.t1)
            + opt_size(&self.t2)
    }

    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        self.w1_a = migrate_tensor(&self.w1_a, device, dtype)?;
        self.w1_b = migrate_tensor(&self.w1_b, device, dtype)?;
        migrate_opt(&mut self.t1, device, dtype)?;
        self.w2_a = migrate_tensor(&self.w2_a, device, dtype)?;
        self.w2_b = migrate_tensor(&self.w2_b, device, dtype)?;
        migrate_opt(&mut self.t2, device, dtype)
    }
}

/// One Kronecker factor: stored whole or as a low-rank pair
#[derive(Debug, Clone)]
pub enum KronFactor {
    Full(Tensor),
    LowRank { a: Tensor, b: Tensor },
}

impl KronFactor {
    fn parse(values: &mut LayerTensors, layer_key: &str, prefix: &str) -> Result<Self> {
        match values.remove(prefix) {
            Some(full) => Ok(KronFactor::Full(full)),
            None => Ok(KronFactor::LowRank {
                a: take(values, layer_key, &format!("{prefix}_a"))?,
                b: take(values, layer_key, &format!("{prefix}_b"))?,
            }),
        }
    }

    fn low_rank_b(&self) -> Option<&Tensor> {
        match self {
            KronFactor::Full(_) => None,
            KronFactor::LowRank { b, .. } => Some(b),
        }
    }

    fn size_in_bytes(&self) -> u64 {
        match self {
            KronFactor::Full(t) => tensor_size_in_bytes(t),
            KronFactor::LowRank { a, b } => tensor_size_in_bytes(a) + tensor_size_in_bytes(b),
        }
    }

    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        match self {
            KronFactor::Full(t) => *t = migrate_tensor(t, device, dtype)?,
            KronFactor::LowRank { a, b } => {
                *a = migrate_tensor(a, device, dtype)?;
                *b = migrate_tensor(b, device, dtype)?;
            }
        }
        Ok(())
    }
}

/// LoKR: Kronecker product of two (possibly factorized) matrices
#[derive(Debug, Clone)]
pub struct KroneckerLayer {
    pub base: LayerBase,
    pub w1: KronFactor,
    pub w2: KronFactor,
    pub t2: Option<Tensor>,
}

impl KroneckerLayer {
    const KEYS: [&'static str; 7] = [
        "lokr_w1",
        "lokr_w1_a",
        "lokr_w1_b",
        "lokr_w2",
        "lokr_w2_a",
        "lokr_w2_b",
        "lokr_t2",
    ];

    pub fn parse(layer_key: &str, mut values: LayerTensors) -> Result<Self> {
        warn_unhandled(layer_key, &values, &Self::KEYS);
        let mut base = LayerBase::parse(layer_key, &mut values)?;
        let w1 = KronFactor::parse(&mut values, layer_key, "lokr_w1")?;
        let w2 = KronFactor::parse(&mut values, layer_key, "lokr_w2")?;
        let t2 = values.remove("lokr_t2");

        base.rank = match w1.low_rank_b().or_else(|| w2.low_rank_b()) {
            Some(b) => Some(b.dim(0)?),
            None => None,
        };
        Ok(Self { base, w1, w2, t2 })
    }

    fn get_weight(&self) -> candle_core::Result<Tensor> {
        let mut w1 = match &self.w1 {
            KronFactor::Full(t) => t.clone(),
            KronFactor::LowRank { a, b } => a.matmul(b)?,
        };
        let w2 = match (&self.w2, &self.t2) {
            (KronFactor::Full(t), _) => t.clone(),
            (KronFactor::LowRank { a, b }, Some(t2)) => rebuild_tucker(t2, a, b)?,
            (KronFactor::LowRank { a, b }, None) => a.matmul(b)?,
        };
        if w2.rank() == 4 {
            w1 = w1.unsqueeze(2)?.unsqueeze(2)?;
        }
        kron(&w1, &w2)
    }

    fn size_in_bytes(&self) -> u64 {
        self.w1.size_in_bytes() + self.w2.size_in_bytes() + opt_size(&self.t2)
    }

    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        self.w1.to(device, dtype)?;
        self.w2.to(device, dtype)?;
        migrate_opt(&mut self.t2, device, dtype)
    }
}

/// Stored dense delta, optionally with its own bias delta
#[derive(Debug, Clone)]
pub struct FullDiffLayer {
    pub base: LayerBase,
    pub weight: Tensor,
}

impl FullDiffLayer {
    const KEYS: [&'static str; 2] = ["diff", "diff_b"];

    pub fn parse(layer_key: &str, mut values: LayerTensors) -> Result<Self> {
        warn_unhandled(layer_key, &values, &Self::KEYS);
        let mut base = LayerBase::parse(layer_key, &mut values)?;
        let weight = take(&mut values, layer_key, "diff")?;
        // diff_b replaces any sparse bias
        base.bias = values.remove("diff_b");
        Ok(Self { base, weight })
    }

    fn size_in_bytes(&self) -> u64 {
        tensor_size_in_bytes(&self.weight)
    }

    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        self.weight = migrate_tensor(&self.weight, device, dtype)?;
        Ok(())
    }
}

/// IA3: per-channel multiplicative scale of the original weight
#[derive(Debug, Clone)]
pub struct ChannelScaleLayer {
    pub base: LayerBase,
    pub weight: Tensor,
    pub on_input: Tensor,
    scale_input: bool,
}

impl ChannelScaleLayer {
    const KEYS: [&'static str; 2] = ["weight", "on_input"];

    pub fn parse(layer_key: &str, mut values: LayerTensors) -> Result<Self> {
        warn_unhandled(layer_key, &values, &Self::KEYS);
        let base = LayerBase::parse(layer_key, &mut values)?;
        let weight = take(&mut values, layer_key, "weight")?;
        let on_input = take(&mut values, layer_key, "on_input")?;
        let scale_input = on_input
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .any(|v| *v != 0.0);
        Ok(Self {
            base,
            weight,
            on_input,
            scale_input,
        })
    }

    /// True when the scale applies to input channels.
    pub fn on_input(&self) -> bool {
        self.scale_input
    }

    fn get_weight(&self, orig_weight: &Tensor) -> candle_core::Result<Tensor> {
        let mut weight = self.weight.to_dtype(orig_weight.dtype())?;
        if !self.scale_input {
            weight = weight.reshape((weight.elem_count(), 1))?;
        }
        orig_weight.broadcast_mul(&weight)
    }

    fn size_in_bytes(&self) -> u64 {
        tensor_size_in_bytes(&self.weight) + tensor_size_in_bytes(&self.on_input)
    }

    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        self.weight = migrate_tensor(&self.weight, device, dtype)?;
        self.on_input = migrate_tensor(&self.on_input, device, dtype)?;
        Ok(())
    }
}

// ============================================================================
// AdapterLayer
// ============================================================================

/// Which formula a layer group encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    LowRank,
    Hadamard,
    Kronecker,
    FullDiff,
    ChannelScale,
}

impl LayerKind {
    /// Pick the layer kind for a group from its suffix set.
    pub fn detect<S: AsRef<str>>(keys: &[S]) -> Option<Self> {
        let has = |k: &str| keys.iter().any(|key| key.as_ref() == k);
        if has("lora_up.weight") {
            Some(LayerKind::LowRank)
        } else if has("hada_w1_a") {
            Some(LayerKind::Hadamard)
        } else if has("lokr_w1") || has("lokr_w1_a") {
            Some(LayerKind::Kronecker)
        } else if has("diff") {
            Some(LayerKind::FullDiff)
        } else if has("on_input") {
            Some(LayerKind::ChannelScale)
        } else {
            None
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerKind::LowRank => "LoRA",
            LayerKind::Hadamard => "LoHA",
            LayerKind::Kronecker => "LoKR",
            LayerKind::FullDiff => "Full",
            LayerKind::ChannelScale => "IA3",
        };
        f.write_str(name)
    }
}

/// One parsed adapter layer
#[derive(Debug, Clone)]
pub enum AdapterLayer {
    LowRank(LowRankLayer),
    Hadamard(HadamardLayer),
    Kronecker(KroneckerLayer),
    FullDiff(FullDiffLayer),
    ChannelScale(ChannelScaleLayer),
}

impl AdapterLayer {
    /// Parse a layer group. `model` only appears in the error for an
    /// unrecognised group.
    pub fn parse(model: &str, layer_key: &str, values: LayerTensors) -> Result<Self> {
        let keys: Vec<&str> = values.keys().map(String::as_str).collect();
        let Some(kind) = LayerKind::detect(&keys) else {
            let mut keys: Vec<String> = values.keys().cloned().collect();
            keys.sort();
            return Err(ModelManagerError::UnknownLayerFormat {
                model: model.to_string(),
                layer_key: layer_key.to_string(),
                keys,
            });
        };

        Ok(match kind {
            LayerKind::LowRank => AdapterLayer::LowRank(LowRankLayer::parse(layer_key, values)?),
            LayerKind::Hadamard => AdapterLayer::Hadamard(HadamardLayer::parse(layer_key, values)?),
            LayerKind::Kronecker => {
                AdapterLayer::Kronecker(KroneckerLayer::parse(layer_key, values)?)
            }
            LayerKind::FullDiff => AdapterLayer::FullDiff(FullDiffLayer::parse(layer_key, values)?),
            LayerKind::ChannelScale => {
                AdapterLayer::ChannelScale(ChannelScaleLayer::parse(layer_key, values)?)
            }
        })
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            AdapterLayer::LowRank(_) => LayerKind::LowRank,
            AdapterLayer::Hadamard(_) => LayerKind::Hadamard,
            AdapterLayer::Kronecker(_) => LayerKind::Kronecker,
            AdapterLayer::FullDiff(_) => LayerKind::FullDiff,
            AdapterLayer::ChannelScale(_) => LayerKind::ChannelScale,
        }
    }

    pub fn base(&self) -> &LayerBase {
        match self {
            AdapterLayer::LowRank(l) => &l.base,
            AdapterLayer::Hadamard(l) => &l.base,
            AdapterLayer::Kronecker(l) => &l.base,
            AdapterLayer::FullDiff(l) => &l.base,
            AdapterLayer::ChannelScale(l) => &l.base,
        }
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        match self {
            AdapterLayer::LowRank(l) => &mut l.base,
            AdapterLayer::Hadamard(l) => &mut l.base,
            AdapterLayer::Kronecker(l) => &mut l.base,
            AdapterLayer::FullDiff(l) => &mut l.base,
            AdapterLayer::ChannelScale(l) => &mut l.base,
        }
    }

    pub fn layer_key(&self) -> &str {
        &self.base().layer_key
    }

    pub fn rank(&self) -> Option<usize> {
        self.base().rank
    }

    pub fn alpha(&self) -> Option<f64> {
        self.base().alpha
    }

    /// `alpha / rank` when both are known, otherwise 1.0.
    pub fn scale(&self) -> f64 {
        match (self.alpha(), self.rank()) {
            (Some(alpha), Some(rank)) if alpha != 0.0 && rank != 0 => alpha / rank as f64,
            _ => 1.0,
        }
    }

    /// The scale replaces, rather than adds to, the original weight.
    pub fn is_multiplicative(&self) -> bool {
        matches!(self, AdapterLayer::ChannelScale(_))
    }

    /// Dense weight delta for `orig_weight`.
    ///
    /// The result may need a reshape to `orig_weight`'s shape (LoRA deltas on
    /// conv layers come back 2-D). For [`ChannelScaleLayer`] the result is the
    /// scaled original weight, not a delta.
    pub fn get_weight(&self, orig_weight: &Tensor) -> Result<Tensor> {
        let weight = match self {
            AdapterLayer::LowRank(l) => l.get_weight()?,
            AdapterLayer::Hadamard(l) => l.get_weight()?,
            AdapterLayer::Kronecker(l) => l.get_weight()?,
            AdapterLayer::FullDiff(l) => l.weight.clone(),
            AdapterLayer::ChannelScale(l) => l.get_weight(orig_weight)?,
        };
        Ok(weight)
    }

    /// Stored bias delta. Every variant's bias is independent of the
    /// original bias.
    pub fn get_bias(&self) -> Option<Tensor> {
        self.base().bias.clone()
    }

    /// `{"weight"}` plus `"bias"` when the layer carries one.
    pub fn get_parameters(&self, orig_weight: &Tensor) -> Result<HashMap<&'static str, Tensor>> {
        let mut params = HashMap::new();
        params.insert("weight", self.get_weight(orig_weight)?);
        if let Some(bias) = self.get_bias() {
            params.insert("bias", bias);
        }
        Ok(params)
    }

    pub fn size_in_bytes(&self) -> u64 {
        let own = match self {
            AdapterLayer::LowRank(l) => l.size_in_bytes(),
            AdapterLayer::Hadamard(l) => l.size_in_bytes(),
            AdapterLayer::Kronecker(l) => l.size_in_bytes(),
            AdapterLayer::FullDiff(l) => l.size_in_bytes(),
            AdapterLayer::ChannelScale(l) => l.size_in_bytes(),
        };
        own + self.base().size_in_bytes()
    }

    /// Migrate every owned tensor. After an error the layer is unusable.
    pub fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        self.base_mut().to(device, dtype)?;
        match self {
            AdapterLayer::LowRank(l) => l.to(device, dtype),
            AdapterLayer::Hadamard(l) => l.to(device, dtype),
            AdapterLayer::Kronecker(l) => l.to(device, dtype),
            AdapterLayer::FullDiff(l) => l.to(device, dtype),
            AdapterLayer::ChannelScale(l) => l.to(device, dtype),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
