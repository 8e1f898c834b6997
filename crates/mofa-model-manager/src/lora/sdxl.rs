//! Stability AI → diffusers key conversion for SDXL adapters
//!
//! Kohya-style SDXL adapters name UNet layers after the original Stability
//! block layout (`lora_unet_input_blocks_4_1_proj_in`), while the diffusers
//! UNet the adapter is patched into uses `down_blocks_1_attentions_0_proj_in`.
//! The prefix table below maps one onto the other.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{ModelManagerError, Result};

const UNET_PREFIX: &str = "lora_unet_";
const TEXT_ENCODER_PREFIXES: [&str; 2] = ["lora_te1_", "lora_te2_"];

/// Stability prefix → diffusers prefix, underscore-separated, sorted by key
pub static SDXL_UNET_STABILITY_TO_DIFFUSERS: Lazy<BTreeMap<String, String>> = Lazy::new(|| {
    sdxl_unet_conversion_map()
        .into_iter()
        .map(|(sd, hf)| (underscored(&sd), underscored(&hf)))
        .collect()
});

fn underscored(prefix: &str) -> String {
    prefix.trim_end_matches('.').replace('.', "_")
}

/// Dotted `(stability, diffusers)` prefix pairs for the SDXL UNet.
pub fn sdxl_unet_conversion_map() -> Vec<(String, String)> {
    let mut layers: Vec<(String, String)> = Vec::new();

    // SDXL has three down/up block levels
    for i in 0..3 {
        for j in 0..2 {
            layers.push((
                format!("input_blocks.{}.0.", 3 * i + j + 1),
                format!("down_blocks.{i}.resnets.{j}."),
            ));
            layers.push((
                format!("input_blocks.{}.1.", 3 * i + j + 1),
                format!("down_blocks.{i}.attentions.{j}."),
            ));
        }

        for j in 0..3 {
            layers.push((
                format!("output_blocks.{}.0.", 3 * i + j),
                format!("up_blocks.{i}.resnets.{j}."),
            ));
            layers.push((
                format!("output_blocks.{}.1.", 3 * i + j),
                format!("up_blocks.{i}.attentions.{j}."),
            ));
        }

        layers.push((
            format!("input_blocks.{}.0.op.", 3 * (i + 1)),
            format!("down_blocks.{i}.downsamplers.0.conv."),
        ));
        layers.push((
            format!("output_blocks.{}.2.", 3 * i + 2),
            format!("up_blocks.{i}.upsamplers.0."),
        ));
    }

    layers.push(("middle_block.1.".into(), "mid_block.attentions.0.".into()));
    for j in 0..2 {
        layers.push((
            format!("middle_block.{}.", 2 * j),
            format!("mid_block.resnets.{j}."),
        ));
    }

    const RESNET: [(&str, &str); 6] = [
        ("in_layers.0.", "norm1."),
        ("in_layers.2.", "conv1."),
        ("out_layers.0.", "norm2."),
        ("out_layers.3.", "conv2."),
        ("emb_layers.1.", "time_emb_proj."),
        ("skip_connection.", "conv_shortcut."),
    ];

    let mut map = Vec::new();
    for (sd, hf) in layers {
        if hf.contains("resnets") {
            for (sd_res, hf_res) in RESNET {
                map.push((format!("{sd}{sd_res}"), format!("{hf}{hf_res}")));
            }
        } else {
            map.push((sd, hf));
        }
    }

    for j in 0..2 {
        map.push((
            format!("time_embed.{}.", 2 * j),
            format!("time_embedding.linear_{}.", j + 1),
        ));
    }
    for j in 0..2 {
        map.push((
            format!("label_emb.0.{}.", 2 * j),
            format!("add_embedding.linear_{}.", j + 1),
        ));
    }

    map.push(("input_blocks.0.0.".into(), "conv_in.".into()));
    map.push(("out.0.".into(), "conv_norm_out.".into()));
    map.push(("out.2.".into(), "conv_out.".into()));
    map
}

/// Longest table prefix that `search_key` actually starts with, as found by
/// a sorted-order search.
fn lookup<'a>(keys: &[&'a str], search_key: &str) -> Option<&'a str> {
    let pos = keys.partition_point(|k| *k <= search_key);
    if pos == 0 {
        return None;
    }
    let candidate = keys[pos - 1];
    search_key.starts_with(candidate).then_some(candidate)
}

/// Rewrite SDXL adapter keys from Stability AI to diffusers naming.
///
/// Keys already in diffusers format pass through, so applying this twice is
/// the same as applying it once. Text encoder keys are identical in both
/// formats. The `lora_unet_` namespace converts all-or-nothing.
pub fn convert_sdxl_keys_to_diffusers_format<V>(
    state_dict: HashMap<String, V>,
) -> Result<HashMap<String, V>> {
    let table = &*SDXL_UNET_STABILITY_TO_DIFFUSERS;
    let keys: Vec<&str> = table.keys().map(String::as_str).collect();

    let mut converted = 0usize;
    let mut not_converted = 0usize;
    let mut out = HashMap::with_capacity(state_dict.len());

    for (full_key, value) in state_dict {
        if let Some(search_key) = full_key.strip_prefix(UNET_PREFIX) {
            match lookup(&keys, search_key).and_then(|k| table.get(k).map(|v| (k, v))) {
                Some((map_key, mapped)) => {
                    let rest = &search_key[map_key.len()..];
                    out.insert(format!("{UNET_PREFIX}{mapped}{rest}"), value);
                    converted += 1;
                }
                None => {
                    out.insert(full_key, value);
                    not_converted += 1;
                }
            }
        } else if TEXT_ENCODER_PREFIXES
            .iter()
            .any(|prefix| full_key.starts_with(prefix))
        {
            out.insert(full_key, value);
        } else {
            return Err(ModelManagerError::UnrecognizedKeyPrefix(full_key));
        }
    }

    if converted > 0 && not_converted > 0 {
        return Err(ModelManagerError::PartialConversion {
            converted,
            not_converted,
        });
    }

    debug!(converted, "Converted SDXL adapter keys to diffusers format");
    Ok(out)
}
