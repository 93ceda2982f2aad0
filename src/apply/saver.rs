//! Model saver for merged checkpoints
//!
//! Writes the merged weights as safetensors (sharded when they exceed the
//! shard limit) together with `config.json` and, when the base checkpoint
//! has one, `generation_config.json`.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::apply::loader::{BaseModel, CONFIG_FILE, WEIGHTS_FILE, WEIGHTS_INDEX_FILE};
use crate::error::Result;
use crate::utils::tensor::{write_safetensors, RawTensor};

/// Generation defaults shipped next to some checkpoints
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// Default upper bound for a single weight file
pub const DEFAULT_MAX_SHARD_SIZE: &str = "5GB";

/// Tensors assigned to one output file
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    /// Tensor names in write order
    pub names: Vec<String>,
    /// Payload size in bytes
    pub size: u64,
}

/// What was written by [`save_model`]
#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    /// Weight files, in shard order
    pub weight_files: Vec<PathBuf>,
    /// Total tensor payload in bytes
    pub total_size: u64,
    /// Whether `generation_config.json` was carried over
    pub generation_config: bool,
}

#[derive(Serialize)]
struct IndexMetadata {
    total_size: u64,
}

#[derive(Serialize)]
struct ShardIndex<'a> {
    metadata: IndexMetadata,
    weight_map: BTreeMap<&'a str, String>,
}

/// Split tensors into shards of at most `max_shard_size` bytes
///
/// Tensors are taken in name order. A tensor larger than the limit gets a
/// shard of its own.
pub fn plan_shards(tensors: &BTreeMap<String, RawTensor>, max_shard_size: u64) -> Vec<Shard> {
    let mut shards: Vec<Shard> = Vec::new();
    let mut current = Shard { names: Vec::new(), size: 0 };

    for (name, tensor) in tensors {
        let size = tensor.byte_len() as u64;
        if !current.names.is_empty() && current.size + size > max_shard_size {
            shards.push(std::mem::replace(&mut current, Shard { names: Vec::new(), size: 0 }));
        }
        current.names.push(name.clone());
        current.size += size;
    }

    if !current.names.is_empty() || shards.is_empty() {
        shards.push(current);
    }
    shards
}

/// File name for shard `index` (zero based) out of `total`
pub fn shard_file_name(index: usize, total: usize) -> String {
    if total <= 1 {
        WEIGHTS_FILE.to_string()
    } else {
        format!("model-{:05}-of-{:05}.safetensors", index + 1, total)
    }
}

/// Save a merged model into `output_dir`
pub async fn save_model(
    model: &BaseModel,
    output_dir: &Path,
    max_shard_size: u64,
) -> Result<SaveReport> {
    info!(
        "Saving {} model ({} tensors) to {}",
        model.architecture_name(),
        model.tensors.len(),
        output_dir.display()
    );

    fs::create_dir_all(output_dir).await?;
    remove_stale_weights(output_dir).await?;

    let shards = plan_shards(&model.tensors, max_shard_size);
    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    let total_size = model.total_bytes();

    let mut weight_files = Vec::with_capacity(shards.len());
    let mut weight_map = BTreeMap::new();

    for (index, shard) in shards.iter().enumerate() {
        let file_name = shard_file_name(index, shards.len());
        let path = output_dir.join(&file_name);

        let tensors = shard
            .names
            .iter()
            .filter_map(|name| model.tensors.get_key_value(name));
        write_safetensors(&path, tensors, metadata.clone())?;
        debug!(
            "Wrote {} ({} tensors, {})",
            path.display(),
            shard.names.len(),
            format_file_size(shard.size)
        );

        for name in &shard.names {
            weight_map.insert(name.as_str(), file_name.clone());
        }
        weight_files.push(path);
    }

    if shards.len() > 1 {
        let index = ShardIndex {
            metadata: IndexMetadata { total_size },
            weight_map,
        };
        let index_path = output_dir.join(WEIGHTS_INDEX_FILE);
        fs::write(&index_path, serde_json::to_string_pretty(&index)?).await?;
        debug!("Wrote shard index to {}", index_path.display());
    }

    let config_path = output_dir.join(CONFIG_FILE);
    fs::write(&config_path, serde_json::to_string_pretty(&model.config)?).await?;

    let generation_config = copy_if_present(&model.source_dir, output_dir, GENERATION_CONFIG_FILE).await?;

    info!(
        "Saved {} in {} file(s) to {}",
        format_file_size(total_size),
        weight_files.len(),
        output_dir.display()
    );

    Ok(SaveReport {
        weight_files,
        total_size,
        generation_config,
    })
}

/// Remove weight files left by an earlier save so they cannot shadow the new ones
async fn remove_stale_weights(output_dir: &Path) -> Result<()> {
    let mut entries = fs::read_dir(output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let stale = name == WEIGHTS_FILE
            || name == WEIGHTS_INDEX_FILE
            || (name.starts_with("model-") && name.ends_with(".safetensors"));
        if stale && entry.file_type().await?.is_file() {
            debug!("Removing stale weight file {}", name);
            fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

/// Copy `file_name` from `src_dir` to `dst_dir` if it exists
pub(crate) async fn copy_if_present(src_dir: &Path, dst_dir: &Path, file_name: &str) -> Result<bool> {
    let src = src_dir.join(file_name);
    if !fs::try_exists(&src).await? {
        return Ok(false);
    }
    let dst = dst_dir.join(file_name);
    if src != dst {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&src, &dst).await?;
    }
    Ok(true)
}

/// Format file size in human readable format
pub fn format_file_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
