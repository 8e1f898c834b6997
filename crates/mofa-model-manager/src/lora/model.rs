//! Assembled adapter model

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

use crate::error::Result;
use crate::load::checkpoint::read_state_dict;
use crate::lora::layer::{AdapterLayer, LayerTensors};
use crate::lora::sdxl::convert_sdxl_keys_to_diffusers_format;
use crate::raw_model::RawModel;
use crate::taxonomy::BaseModelType;

/// A parsed LoRA-family adapter: one layer per target module
#[derive(Debug, Clone)]
pub struct LoRAModelRaw {
    name: String,
    layers: HashMap<String, AdapterLayer>,
}

impl LoRAModelRaw {
    pub fn new(name: impl Into<String>, layers: HashMap<String, AdapterLayer>) -> Self {
        Self {
            name: name.into(),
            layers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &HashMap<String, AdapterLayer> {
        &self.layers
    }

    pub fn layer(&self, layer_key: &str) -> Option<&AdapterLayer> {
        self.layers.get(layer_key)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Read and parse an adapter file. The model is named after the file stem.
    pub fn from_checkpoint(
        path: &Path,
        device: &Device,
        dtype: DType,
        base_model: Option<BaseModelType>,
    ) -> Result<Self> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let state_dict = read_state_dict(path)?;
        Self::from_state_dict(name, state_dict, device, dtype, base_model)
    }

    /// Build from a flat `name -> tensor` mapping.
    ///
    /// Each group is parsed and moved to `device`/`dtype` before the next is
    /// touched, and the raw group is dropped as soon as its layer exists.
    pub fn from_state_dict(
        name: impl Into<String>,
        state_dict: HashMap<String, Tensor>,
        device: &Device,
        dtype: DType,
        base_model: Option<BaseModelType>,
    ) -> Result<Self> {
        let name = name.into();
        let mut grouped = group_state(state_dict);

        if base_model == Some(BaseModelType::StableDiffusionXL) {
            grouped = convert_sdxl_keys_to_diffusers_format(grouped)?;
        }

        let mut layers = HashMap::with_capacity(grouped.len());
        for (layer_key, values) in grouped {
            let mut layer = AdapterLayer::parse(&name, &layer_key, values)?;
            layer.to(Some(device), Some(dtype))?;
            layers.insert(layer_key, layer);
        }

        debug!(model = %name, layers = layers.len(), "Parsed adapter model");
        Ok(Self { name, layers })
    }
}

/// Split `stem.leaf` keys at the first dot and group leaves by stem.
pub fn group_state(state_dict: HashMap<String, Tensor>) -> HashMap<String, LayerTensors> {
    let mut grouped: HashMap<String, LayerTensors> = HashMap::new();
    for (key, value) in state_dict {
        match key.split_once('.') {
            Some((stem, leaf)) => {
                grouped
                    .entry(stem.to_string())
                    .or_default()
                    .insert(leaf.to_string(), value);
            }
            None => warn!(key = %key, "Skipping adapter tensor without a layer prefix"),
        }
    }
    grouped
}

impl RawModel for LoRAModelRaw {
    fn size_in_bytes(&self) -> u64 {
        self.layers.values().map(AdapterLayer::size_in_bytes).sum()
    }

    fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> candle_core::Result<()> {
        for layer in self.layers.values_mut() {
            layer.to(device, dtype)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelManagerError;
    use crate::lora::layer::LayerKind;

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape.to_vec(), DType::F32, &Device::Cpu).unwrap()
    }

    fn sd(entries: &[(&str, &[usize])]) -> HashMap<String, Tensor> {
        entries
            .iter()
            .map(|(k, shape)| (k.to_string(), zeros(shape)))
            .collect()
    }

    #[test]
    fn test_group_state_splits_at_first_dot() {
        let grouped = group_state(sd(&[
            ("lora_unet_a.lora_up.weight", &[2, 1]),
            ("lora_unet_a.lora_down.weight", &[1, 2]),
            ("lora_unet_a.alpha", &[]),
            ("lora_te1_b.diff", &[2, 2]),
            ("orphan", &[1]),
        ]));
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["lora_unet_a"].len(), 3);
        assert!(grouped["lora_unet_a"].contains_key("lora_up.weight"));
        assert!(grouped["lora_te1_b"].contains_key("diff"));
    }

    #[test]
    fn test_mixed_layer_kinds() {
        let model = LoRAModelRaw::from_state_dict(
            "mixed",
            sd(&[
                ("lora_unet_a.lora_up.weight", &[4, 2]),
                ("lora_unet_a.lora_down.weight", &[2, 4]),
                ("lora_unet_b.hada_w1_a", &[4, 2]),
                ("lora_unet_b.hada_w1_b", &[2, 4]),
                ("lora_unet_b.hada_w2_a", &[4, 2]),
                ("lora_unet_b.hada_w2_b", &[2, 4]),
                ("lora_unet_c.diff", &[4, 4]),
            ]),
            &Device::Cpu,
            DType::F16,
            None,
        )
        .unwrap();
        assert_eq!(model.len(), 3);
        assert_eq!(model.layer("lora_unet_a").unwrap().kind(), LayerKind::LowRank);
        assert_eq!(model.layer("lora_unet_b").unwrap().kind(), LayerKind::Hadamard);
        assert_eq!(model.layer("lora_unet_c").unwrap().kind(), LayerKind::FullDiff);
        // every tensor was converted to F16 during construction
        assert_eq!(model.size_in_bytes(), (16 + 32 + 16) * 2);
    }

    #[test]
    fn test_unknown_group_aborts_whole_model() {
        let err = LoRAModelRaw::from_state_dict(
            "broken",
            sd(&[
                ("lora_unet_a.lora_up.weight", &[4, 2]),
                ("lora_unet_a.lora_down.weight", &[2, 4]),
                ("lora_unet_b.mystery", &[4]),
            ]),
            &Device::Cpu,
            DType::F32,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ModelManagerError::UnknownLayerFormat { .. }));
    }

    #[test]
    fn test_sdxl_keys_are_remapped() {
        let model = LoRAModelRaw::from_state_dict(
            "sdxl",
            sd(&[
                ("lora_unet_input_blocks_4_1_proj_in.lora_up.weight", &[4, 2]),
                ("lora_unet_input_blocks_4_1_proj_in.lora_down.weight", &[2, 4]),
            ]),
            &Device::Cpu,
            DType::F32,
            Some(BaseModelType::StableDiffusionXL),
        )
        .unwrap();
        assert!(
            model
                .layer("lora_unet_down_blocks_1_attentions_0_proj_in")
                .is_some()
        );
    }

    #[test]
    fn test_non_sdxl_keys_untouched() {
        let model = LoRAModelRaw::from_state_dict(
            "sd1",
            sd(&[
                ("lora_unet_input_blocks_4_1_proj_in.lora_up.weight", &[4, 2]),
                ("lora_unet_input_blocks_4_1_proj_in.lora_down.weight", &[2, 4]),
            ]),
            &Device::Cpu,
            DType::F32,
            Some(BaseModelType::StableDiffusion1),
        )
        .unwrap();
        assert!(model.layer("lora_unet_input_blocks_4_1_proj_in").is_some());
    }

    #[test]
    fn test_clone_model_migrates_independently() {
        let model = LoRAModelRaw::from_state_dict(
            "m",
            sd(&[("lora_unet_c.diff", &[4, 4])]),
            &Device::Cpu,
            DType::F32,
            None,
        )
        .unwrap();
        let mut copy = model.clone_model();
        copy.to(None, Some(DType::F16)).unwrap();
        assert_eq!(model.size_in_bytes(), 64);
        assert_eq!(copy.size_in_bytes(), 32);
    }
}
