//! LoRA weight merger
//!
//! Folds adapter weights into the extracted submodule permanently:
//! `W_new = W_base + scaling * (B @ A)`, after which the adapter is no longer
//! needed. Arithmetic runs in f32 and the result is stored back in the base
//! tensor's dtype.

use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::apply::loader::Submodule;
use crate::error::{MergeError, Result};
use crate::lora::{LayerKind, LoraAdapter, LoraLayer};
use crate::utils::tensor::{is_float, RawTensor};

/// Outcome of a merge
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    /// LoRA layers folded into base weights
    pub merged_layers: usize,
    /// Base tensors replaced by fully trained adapter tensors
    pub replaced_tensors: usize,
    /// Adapter tensors with no counterpart in the submodule
    pub skipped_tensors: Vec<String>,
}

/// Merge an adapter into a submodule and unload it
///
/// Every LoRA layer must target an existing floating point weight of matching
/// shape; otherwise the submodule is left partially merged and an error is
/// returned, so callers should discard it.
pub fn merge_and_unload(
    submodule: &mut Submodule,
    adapter: &LoraAdapter,
    device: &Device,
) -> Result<MergeReport> {
    info!(
        "Merging {} LoRA layers into submodule '{}'",
        adapter.layers.len(),
        submodule.name
    );

    if adapter.config.use_dora && adapter.config.fan_in_fan_out {
        return Err(MergeError::incompatible(
            "DoRA adapters with fan_in_fan_out are not supported",
        ));
    }

    let missing = missing_targets(submodule, adapter);
    if !missing.is_empty() {
        let preview = missing.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
        return Err(MergeError::incompatible(format!(
            "{} of {} target weights not found in submodule '{}': {}{}",
            missing.len(),
            adapter.layers.len(),
            submodule.name,
            preview,
            if missing.len() > 5 { ", ..." } else { "" }
        )));
    }

    let mut report = MergeReport::default();

    for layer in adapter.layers.values() {
        let weight_name = layer.weight_name();
        let base = submodule.tensors.get(&weight_name).ok_or_else(|| {
            MergeError::incompatible(format!(
                "target weight '{}' not found in submodule '{}'",
                weight_name, submodule.name
            ))
        })?;

        let scaling = adapter.config.scaling_for(&layer.module);
        let merged = merge_layer(&weight_name, base, layer, scaling, adapter.config.fan_in_fan_out, device)?;
        debug!(
            "Merged {} (rank {}, scaling {:.4}, {:?})",
            weight_name,
            layer.rank(),
            scaling,
            layer.kind
        );

        submodule.tensors.insert(weight_name, merged);
        report.merged_layers += 1;
    }

    for (name, tensor) in &adapter.saved_tensors {
        match submodule.tensors.get(name) {
            Some(base) => {
                let replacement = replacement_tensor(name, base, tensor)?;
                submodule.tensors.insert(name.clone(), replacement);
                report.replaced_tensors += 1;
                debug!("Replaced {} with adapter copy", name);
            }
            None => {
                warn!(
                    "Adapter tensor '{}' has no counterpart in submodule '{}', skipping",
                    name, submodule.name
                );
                report.skipped_tensors.push(name.clone());
            }
        }
    }

    info!(
        "Merge complete: {} layers merged, {} tensors replaced, {} skipped",
        report.merged_layers,
        report.replaced_tensors,
        report.skipped_tensors.len()
    );

    Ok(report)
}

/// Weight names the adapter targets that the submodule does not have
pub fn missing_targets(submodule: &Submodule, adapter: &LoraAdapter) -> Vec<String> {
    adapter
        .layers
        .values()
        .map(LoraLayer::weight_name)
        .filter(|name| !submodule.tensors.contains_key(name))
        .collect()
}

/// Merge a single LoRA layer into its base weight
pub fn merge_layer(
    name: &str,
    base: &RawTensor,
    layer: &LoraLayer,
    scaling: f64,
    fan_in_fan_out: bool,
    device: &Device,
) -> Result<RawTensor> {
    let weight = base.to_candle_f32(name, device)?;
    let delta = lora_delta(name, layer, scaling, fan_in_fan_out, device)?;

    if weight.dims() != delta.dims() {
        return Err(MergeError::ShapeMismatch {
            name: name.to_string(),
            expected: weight.dims().to_vec(),
            actual: delta.dims().to_vec(),
        });
    }

    let mut merged = weight.add(&delta)?;

    if let Some(magnitude) = &layer.magnitude {
        merged = apply_dora(name, &merged, magnitude, device)?;
    }

    RawTensor::from_candle(name, &merged, base.dtype)
}

/// Compute `scaling * (B @ A)` laid out like the base weight
fn lora_delta(
    name: &str,
    layer: &LoraLayer,
    scaling: f64,
    fan_in_fan_out: bool,
    device: &Device,
) -> Result<Tensor> {
    let a = layer.lora_a.to_candle_f32(name, device)?;
    let b = layer.lora_b.to_candle_f32(name, device)?;
    let delta = b.matmul(&a)?.affine(scaling, 0.0)?;

    let delta = match layer.kind {
        LayerKind::Linear if fan_in_fan_out => delta.t()?.contiguous()?,
        LayerKind::Linear => delta,
        LayerKind::Embedding => delta.t()?.contiguous()?,
    };
    Ok(delta)
}

/// DoRA: rescale each output row to the learned magnitude
fn apply_dora(name: &str, merged: &Tensor, magnitude: &RawTensor, device: &Device) -> Result<Tensor> {
    let rows = merged.dims()[0];
    let magnitude = magnitude.to_candle_f32(name, device)?.reshape((rows, 1))?;
    let norm = merged.sqr()?.sum_keepdim(1)?.sqrt()?;
    let factor = magnitude.broadcast_div(&norm)?;
    Ok(merged.broadcast_mul(&factor)?)
}

/// Adapter copy of a fully trained tensor, cast to the base dtype
fn replacement_tensor(name: &str, base: &RawTensor, tensor: &RawTensor) -> Result<RawTensor> {
    if base.shape != tensor.shape {
        return Err(MergeError::ShapeMismatch {
            name: name.to_string(),
            expected: base.shape.clone(),
            actual: tensor.shape.clone(),
        });
    }

    if base.dtype == tensor.dtype || !is_float(base.dtype) || !is_float(tensor.dtype) {
        return Ok(tensor.clone());
    }

    let candle = tensor.to_candle(name, &Device::Cpu)?;
    RawTensor::from_candle(name, &candle, base.dtype)
}
