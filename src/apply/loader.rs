//! Base model loader and submodule extraction
//!
//! A base model is a Hugging Face checkpoint directory: `config.json` plus
//! safetensors weights, either a single `model.safetensors` or shards listed
//! in `model.safetensors.index.json`. A submodule is every tensor whose name
//! starts with `<name>.`.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{MergeError, Result};
use crate::utils::tensor::{read_safetensors, RawTensor};

/// Model configuration file
pub const CONFIG_FILE: &str = "config.json";
/// Single-file weights
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// Index of sharded weights
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
/// Pickled weights, recognised only to report them as unsupported
const PICKLE_WEIGHTS_FILE: &str = "pytorch_model.bin";

/// `model.safetensors.index.json`
#[derive(Debug, Clone, Deserialize)]
pub struct WeightIndex {
    /// Tensor name to shard file name
    pub weight_map: HashMap<String, String>,
}

impl WeightIndex {
    /// Distinct shard files, sorted
    pub fn shard_files(&self) -> Vec<String> {
        self.weight_map
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// A loaded base model
#[derive(Debug, Clone)]
pub struct BaseModel {
    /// Directory the model was loaded from
    pub source_dir: PathBuf,
    /// Contents of `config.json`
    pub config: serde_json::Value,
    /// All weights by full name
    pub tensors: BTreeMap<String, RawTensor>,
}

/// Tensors of one submodule, with the `<name>.` prefix removed
#[derive(Debug, Clone)]
pub struct Submodule {
    /// Submodule name
    pub name: String,
    /// Tensors by name relative to the submodule
    pub tensors: BTreeMap<String, RawTensor>,
}

impl Submodule {
    /// Total number of parameters
    pub fn num_parameters(&self) -> usize {
        self.tensors.values().map(RawTensor::numel).sum()
    }
}

impl BaseModel {
    /// Create a model from already loaded parts
    pub fn new(source_dir: PathBuf, config: serde_json::Value, tensors: BTreeMap<String, RawTensor>) -> Self {
        Self {
            source_dir,
            config,
            tensors,
        }
    }

    /// Get the model architecture name from the config
    pub fn architecture_name(&self) -> &str {
        self.config["architectures"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|v| v.as_str())
            .or_else(|| self.config["model_type"].as_str())
            .unwrap_or("unknown")
    }

    /// First name component of every tensor, sorted
    pub fn submodule_names(&self) -> Vec<String> {
        self.tensors
            .keys()
            .filter_map(|name| name.split_once('.').map(|(head, _)| head.to_string()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether a submodule with this name exists
    pub fn has_submodule(&self, name: &str) -> bool {
        let prefix = format!("{}.", name);
        self.tensors
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    /// Number of tensors and parameters under a submodule
    pub fn submodule_stats(&self, name: &str) -> (usize, usize) {
        let prefix = format!("{}.", name);
        self.tensors
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .fold((0, 0), |(count, params), (_, t)| (count + 1, params + t.numel()))
    }

    /// Remove a submodule's tensors from the model
    pub fn take_submodule(&mut self, name: &str) -> Result<Submodule> {
        validate_submodule_name(name)?;

        if !self.has_submodule(name) {
            return Err(MergeError::SubmoduleNotFound {
                name: name.to_string(),
                available: self.submodule_names(),
            });
        }

        let prefix = format!("{}.", name);
        let keys: Vec<String> = self
            .tensors
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();

        let mut tensors = BTreeMap::new();
        for key in keys {
            if let Some(tensor) = self.tensors.remove(&key) {
                tensors.insert(key[prefix.len()..].to_string(), tensor);
            }
        }

        debug!("Extracted {} tensors for submodule {}", tensors.len(), name);
        Ok(Submodule {
            name: name.to_string(),
            tensors,
        })
    }

    /// Put a submodule's tensors back under its prefix
    pub fn insert_submodule(&mut self, submodule: Submodule) {
        let prefix = format!("{}.", submodule.name);
        self.tensors.retain(|key, _| !key.starts_with(&prefix));
        for (key, tensor) in submodule.tensors {
            self.tensors.insert(format!("{}{}", prefix, key), tensor);
        }
    }

    /// Total size of all weights in bytes
    pub fn total_bytes(&self) -> u64 {
        self.tensors.values().map(|t| t.byte_len() as u64).sum()
    }
}

fn validate_submodule_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(MergeError::invalid_input("submodule name cannot be empty"));
    }
    if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return Err(MergeError::invalid_input(format!(
            "invalid submodule name: '{}'",
            name
        )));
    }
    Ok(())
}

/// Load a base model from a checkpoint directory
pub async fn load_base_model(model_dir: &Path) -> Result<BaseModel> {
    info!("Loading base model from: {}", model_dir.display());

    if !model_dir.is_dir() {
        return Err(MergeError::model_loading(format!(
            "model directory does not exist: {}",
            model_dir.display()
        )));
    }

    let config = load_config(model_dir).await?;
    let weight_files = find_weight_files(model_dir).await?;

    let mut tensors = BTreeMap::new();
    for file in &weight_files {
        for (name, tensor) in read_safetensors(file)? {
            if tensors.insert(name.clone(), tensor).is_some() {
                return Err(MergeError::model_loading(format!(
                    "tensor '{}' appears in more than one weight file",
                    name
                )));
            }
        }
    }

    if tensors.is_empty() {
        return Err(MergeError::model_loading(format!(
            "no weights could be loaded from {}",
            model_dir.display()
        )));
    }

    let model = BaseModel::new(model_dir.to_path_buf(), config, tensors);
    info!(
        "Loaded {} ({} tensors from {} files, {:.2} GB)",
        model.architecture_name(),
        model.tensors.len(),
        weight_files.len(),
        model.total_bytes() as f64 / 1e9
    );
    Ok(model)
}

/// Load `config.json`
async fn load_config(model_dir: &Path) -> Result<serde_json::Value> {
    let config_path = model_dir.join(CONFIG_FILE);
    debug!("Checking for config file at: {}", config_path.display());

    if !config_path.exists() {
        return Err(MergeError::model_loading(format!(
            "no {} found in model directory: {}",
            CONFIG_FILE,
            model_dir.display()
        )));
    }

    let config_str = fs::read_to_string(&config_path).await?;
    let config: serde_json::Value = serde_json::from_str(&config_str).map_err(|e| {
        MergeError::model_loading(format!("failed to parse {}: {}", config_path.display(), e))
    })?;

    if !config.is_object() {
        return Err(MergeError::model_loading(format!(
            "{} must contain a JSON object",
            config_path.display()
        )));
    }
    Ok(config)
}

/// Resolve the list of safetensors files that make up the checkpoint
async fn find_weight_files(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = model_dir.join(WEIGHTS_INDEX_FILE);
    if index_path.exists() {
        let index_str = fs::read_to_string(&index_path).await?;
        let index: WeightIndex = serde_json::from_str(&index_str).map_err(|e| {
            MergeError::model_loading(format!("failed to parse {}: {}", index_path.display(), e))
        })?;

        let shards = index.shard_files();
        info!("Loading weights from {} shards", shards.len());
        let mut files = Vec::with_capacity(shards.len());
        for shard in shards {
            let path = model_dir.join(&shard);
            if !path.exists() {
                return Err(MergeError::model_loading(format!(
                    "shard listed in index is missing: {}",
                    path.display()
                )));
            }
            files.push(path);
        }
        return Ok(files);
    }

    let single = model_dir.join(WEIGHTS_FILE);
    if single.exists() {
        info!("Loading weights from safetensors format");
        return Ok(vec![single]);
    }

    let mut files = Vec::new();
    let mut entries = fs::read_dir(model_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        if model_dir.join(PICKLE_WEIGHTS_FILE).exists() {
            return Err(MergeError::UnsupportedFormat(
                "PyTorch pickle weights are not supported, convert the model to safetensors".to_string(),
            ));
        }
        return Err(MergeError::model_loading(format!(
            "no model weight files found in {}",
            model_dir.display()
        )));
    }

    warn!(
        "No {} or {} found, loading {} safetensors files from directory",
        WEIGHTS_FILE,
        WEIGHTS_INDEX_FILE,
        files.len()
    );
    Ok(files)
}
