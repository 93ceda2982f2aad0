//! LoRA adapter weights loaded from a PEFT checkpoint directory

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{MergeError, Result};
use crate::lora::config::AdapterConfig;
use crate::utils::tensor::{read_safetensors, RawTensor};

/// Adapter weights file inside a PEFT checkpoint
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Pickled adapter weights, recognised only to report them as unsupported
const ADAPTER_PICKLE_FILE: &str = "adapter_model.bin";

/// Prefix PEFT puts in front of every parameter of the wrapped module
const PEFT_PREFIX: &str = "base_model.model.";

/// Kind of module the adapter layer was attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// `nn.Linear`: A is `[r, in]`, B is `[out, r]`
    Linear,
    /// `nn.Embedding`: A is `[r, num_embeddings]`, B is `[dim, r]`
    Embedding,
}

/// LoRA parameters for a single module
#[derive(Debug, Clone)]
pub struct LoraLayer {
    /// Module path relative to the submodule, e.g. `model.layers.0.self_attn.q_proj`
    pub module: String,
    /// Linear or embedding layer
    pub kind: LayerKind,
    /// Down projection
    pub lora_a: RawTensor,
    /// Up projection
    pub lora_b: RawTensor,
    /// DoRA magnitude vector (one entry per output row)
    pub magnitude: Option<RawTensor>,
}

impl LoraLayer {
    /// Adapter rank
    pub fn rank(&self) -> usize {
        self.lora_a.shape[0]
    }

    /// Name of the base weight the layer merges into
    pub fn weight_name(&self) -> String {
        format!("{}.weight", self.module)
    }

    /// Get total number of parameters
    pub fn num_parameters(&self) -> usize {
        self.lora_a.numel()
            + self.lora_b.numel()
            + self.magnitude.as_ref().map_or(0, RawTensor::numel)
    }

    /// Validate parameter dimensions
    pub fn validate(&self) -> Result<()> {
        if self.lora_a.shape.len() != 2 || self.lora_b.shape.len() != 2 {
            return Err(MergeError::adapter_loading(format!(
                "{}: LoRA matrices must be 2-D, got A {:?} and B {:?}",
                self.module, self.lora_a.shape, self.lora_b.shape
            )));
        }

        let rank = self.rank();
        if rank == 0 || self.lora_b.shape[1] != rank {
            return Err(MergeError::adapter_loading(format!(
                "{}: rank mismatch between A {:?} and B {:?}",
                self.module, self.lora_a.shape, self.lora_b.shape
            )));
        }

        if let Some(magnitude) = &self.magnitude {
            if self.kind == LayerKind::Embedding {
                return Err(MergeError::adapter_loading(format!(
                    "{}: DoRA magnitude vectors on embedding layers are not supported, \
                     only linear layers can be merged with DoRA",
                    self.module
                )));
            }
            if magnitude.numel() != self.lora_b.shape[0] {
                return Err(MergeError::adapter_loading(format!(
                    "{}: magnitude vector has {} entries, expected {}",
                    self.module,
                    magnitude.numel(),
                    self.lora_b.shape[0]
                )));
            }
        }

        Ok(())
    }
}

/// A loaded PEFT adapter
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Adapter configuration
    pub config: AdapterConfig,
    /// LoRA layers by module path
    pub layers: BTreeMap<String, LoraLayer>,
    /// Full tensors that replace submodule tensors on merge (`modules_to_save`, trained biases)
    pub saved_tensors: BTreeMap<String, RawTensor>,
}

/// Summary statistics for an adapter
#[derive(Debug, Clone, Serialize)]
pub struct AdapterSummary {
    /// Number of LoRA layers
    pub num_layers: usize,
    /// Layers applied to linear weights
    pub linear_layers: usize,
    /// Layers applied to embedding tables
    pub embedding_layers: usize,
    /// Layers carrying a DoRA magnitude vector
    pub dora_layers: usize,
    /// Full tensors stored alongside the LoRA weights
    pub saved_tensors: usize,
    /// Parameters across layers and saved tensors
    pub total_parameters: usize,
    /// Default rank from the config
    pub rank: usize,
    /// Default alpha from the config
    pub lora_alpha: f64,
    /// Whether scaling is rank-stabilised
    pub use_rslora: bool,
}

impl LoraAdapter {
    /// Load an adapter from a PEFT checkpoint directory
    pub async fn load(dir: &Path) -> Result<Self> {
        info!("Loading LoRA adapter from: {}", dir.display());

        if !dir.is_dir() {
            return Err(MergeError::adapter_loading(format!(
                "adapter directory does not exist: {}",
                dir.display()
            )));
        }

        let config = AdapterConfig::from_dir(dir).await?;

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        if !weights_path.exists() {
            if dir.join(ADAPTER_PICKLE_FILE).exists() {
                return Err(MergeError::UnsupportedFormat(format!(
                    "{} is a pickled checkpoint; re-save the adapter with safe_serialization=True",
                    ADAPTER_PICKLE_FILE
                )));
            }
            return Err(MergeError::adapter_loading(format!(
                "{} not found in {}",
                ADAPTER_WEIGHTS_FILE,
                dir.display()
            )));
        }

        let tensors = read_safetensors(&weights_path)?;
        let adapter = Self::from_tensors(config, tensors)?;

        info!(
            "Loaded adapter with {} LoRA layers and {} saved tensors (r={}, alpha={})",
            adapter.layers.len(),
            adapter.saved_tensors.len(),
            adapter.config.r,
            adapter.config.lora_alpha
        );
        Ok(adapter)
    }

    /// Group raw adapter tensors into LoRA layers and saved tensors
    pub fn from_tensors(
        config: AdapterConfig,
        tensors: impl IntoIterator<Item = (String, RawTensor)>,
    ) -> Result<Self> {
        let mut partial: BTreeMap<String, PartialLayer> = BTreeMap::new();
        let mut saved_tensors = BTreeMap::new();

        for (key, tensor) in tensors {
            match AdapterKey::parse(&key) {
                AdapterKey::Lora { module, part } => {
                    debug!("Adapter tensor {} -> {} ({:?})", key, module, part);
                    partial.entry(module).or_default().set(part, tensor, &key)?;
                }
                AdapterKey::Saved { name } => {
                    debug!("Saved tensor {} -> {}", key, name);
                    if saved_tensors.insert(name.clone(), tensor).is_some() {
                        return Err(MergeError::adapter_loading(format!(
                            "duplicate saved tensor: {}",
                            name
                        )));
                    }
                }
            }
        }

        let mut layers = BTreeMap::new();
        for (module, parts) in partial {
            let layer = parts.finish(&module)?;
            layer.validate()?;

            let expected_rank = config.rank_for(&module);
            if layer.rank() != expected_rank {
                return Err(MergeError::adapter_loading(format!(
                    "{}: weights have rank {} but the adapter config declares {}",
                    module,
                    layer.rank(),
                    expected_rank
                )));
            }
            layers.insert(module, layer);
        }

        if layers.is_empty() && saved_tensors.is_empty() {
            return Err(MergeError::adapter_loading("adapter contains no tensors"));
        }

        Ok(Self {
            config,
            layers,
            saved_tensors,
        })
    }

    /// Get total number of parameters
    pub fn total_parameters(&self) -> usize {
        self.layers.values().map(LoraLayer::num_parameters).sum::<usize>()
            + self.saved_tensors.values().map(RawTensor::numel).sum::<usize>()
    }

    /// Get summary statistics
    pub fn summary(&self) -> AdapterSummary {
        let count = |kind| self.layers.values().filter(|l| l.kind == kind).count();
        AdapterSummary {
            num_layers: self.layers.len(),
            linear_layers: count(LayerKind::Linear),
            embedding_layers: count(LayerKind::Embedding),
            dora_layers: self.layers.values().filter(|l| l.magnitude.is_some()).count(),
            saved_tensors: self.saved_tensors.len(),
            total_parameters: self.total_parameters(),
            rank: self.config.r,
            lora_alpha: self.config.lora_alpha,
            use_rslora: self.config.use_rslora,
        }
    }
}

/// Which LoRA tensor a key holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraPart {
    A,
    B,
    EmbeddingA,
    EmbeddingB,
    Magnitude,
}

impl LoraPart {
    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "lora_A" => Some(Self::A),
            "lora_B" => Some(Self::B),
            "lora_embedding_A" => Some(Self::EmbeddingA),
            "lora_embedding_B" => Some(Self::EmbeddingB),
            "lora_magnitude_vector" => Some(Self::Magnitude),
            _ => None,
        }
    }
}

/// Parsed adapter state-dict key
#[derive(Debug, Clone, PartialEq, Eq)]
enum AdapterKey {
    Lora { module: String, part: LoraPart },
    Saved { name: String },
}

impl AdapterKey {
    fn parse(key: &str) -> Self {
        let stripped = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
        let segments: Vec<&str> = stripped.split('.').collect();

        if let Some((idx, part)) = segments
            .iter()
            .enumerate()
            .find_map(|(i, s)| LoraPart::from_segment(s).map(|p| (i, p)))
        {
            return AdapterKey::Lora {
                module: segments[..idx].join("."),
                part,
            };
        }

        // `<module>.modules_to_save.<adapter>.<param>` -> `<module>.<param>`
        let name = match segments.iter().position(|s| *s == "modules_to_save") {
            Some(idx) if idx + 2 < segments.len() => segments[..idx]
                .iter()
                .chain(&segments[idx + 2..])
                .copied()
                .collect::<Vec<_>>()
                .join("."),
            _ => stripped.to_string(),
        };
        AdapterKey::Saved { name }
    }
}

#[derive(Debug, Default)]
struct PartialLayer {
    a: Option<RawTensor>,
    b: Option<RawTensor>,
    embedding_a: Option<RawTensor>,
    embedding_b: Option<RawTensor>,
    magnitude: Option<RawTensor>,
}

impl PartialLayer {
    fn set(&mut self, part: LoraPart, tensor: RawTensor, key: &str) -> Result<()> {
        let slot = match part {
            LoraPart::A => &mut self.a,
            LoraPart::B => &mut self.b,
            LoraPart::EmbeddingA => &mut self.embedding_a,
            LoraPart::EmbeddingB => &mut self.embedding_b,
            LoraPart::Magnitude => &mut self.magnitude,
        };
        if slot.replace(tensor).is_some() {
            return Err(MergeError::adapter_loading(format!(
                "duplicate adapter tensor: {}",
                key
            )));
        }
        Ok(())
    }

    fn finish(self, module: &str) -> Result<LoraLayer> {
        let (kind, lora_a, lora_b) = match (self.a, self.b, self.embedding_a, self.embedding_b) {
            (Some(a), Some(b), None, None) => (LayerKind::Linear, a, b),
            (None, None, Some(a), Some(b)) => (LayerKind::Embedding, a, b),
            _ => {
                return Err(MergeError::adapter_loading(format!(
                    "{}: adapter must contain exactly one matching A/B pair",
                    module
                )))
            }
        };

        Ok(LoraLayer {
            module: module.to_string(),
            kind,
            lora_a,
            lora_b,
            magnitude: self.magnitude,
        })
    }
}
