//! Hugging Face Hub resolution for model and adapter arguments
//!
//! A path argument that is not an existing local path but looks like
//! `owner/name` is fetched into the local Hub cache, and the snapshot
//! directory is used in its place.

use hf_hub::api::tokio::{Api, ApiRepo};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::apply::assets::{PROCESSOR_FILES, TOKENIZER_AUX_FILES, TOKENIZER_FILE};
use crate::apply::loader::{WeightIndex, CONFIG_FILE, WEIGHTS_FILE, WEIGHTS_INDEX_FILE};
use crate::apply::saver::GENERATION_CONFIG_FILE;
use crate::error::{MergeError, Result};
use crate::lora::{ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};

/// Whether `value` has the shape of a Hub repository id (`owner/name`)
pub fn looks_like_repo_id(value: &str) -> bool {
    let mut parts = value.split('/');
    let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };

    let valid = |part: &str| {
        !part.is_empty()
            && !part.starts_with('.')
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    valid(owner) && valid(name)
}

/// Resolve a base model argument to a local checkpoint directory
///
/// `extra_file` is fetched alongside the checkpoint when the model comes
/// from the Hub, so the auxiliary copy step can find it.
pub async fn resolve_model_dir(location: &str, extra_file: &str) -> Result<PathBuf> {
    if let Some(local) = local_dir(location) {
        return Ok(local);
    }
    if !looks_like_repo_id(location) {
        return Err(MergeError::model_loading(format!(
            "model path '{}' does not exist",
            location
        )));
    }

    info!("Fetching model {} from the Hugging Face Hub", location);
    let repo = Api::new().map_err(hub_error)?.model(location.to_string());

    let config_path = fetch_required(&repo, location, CONFIG_FILE).await?;

    match repo.get(WEIGHTS_INDEX_FILE).await {
        Ok(index_path) => {
            let content = tokio::fs::read_to_string(&index_path).await?;
            let index: WeightIndex = serde_json::from_str(&content)?;
            for shard in index.shard_files() {
                fetch_required(&repo, location, &shard).await?;
            }
        }
        Err(_) => {
            fetch_required(&repo, location, WEIGHTS_FILE).await?;
        }
    }

    let optional = std::iter::once(TOKENIZER_FILE)
        .chain(TOKENIZER_AUX_FILES.iter().copied())
        .chain(PROCESSOR_FILES.iter().copied())
        .chain([GENERATION_CONFIG_FILE, extra_file]);
    for file in optional {
        fetch_optional(&repo, file).await;
    }

    snapshot_dir(&config_path)
}

/// Resolve an adapter argument to a local adapter directory
pub async fn resolve_adapter_dir(location: &str) -> Result<PathBuf> {
    if let Some(local) = local_dir(location) {
        return Ok(local);
    }
    if !looks_like_repo_id(location) {
        return Err(MergeError::adapter_loading(format!(
            "adapter path '{}' does not exist",
            location
        )));
    }

    info!("Fetching adapter {} from the Hugging Face Hub", location);
    let repo = Api::new().map_err(hub_error)?.model(location.to_string());
    let config_path = fetch_required(&repo, location, ADAPTER_CONFIG_FILE).await?;
    fetch_required(&repo, location, ADAPTER_WEIGHTS_FILE).await?;

    snapshot_dir(&config_path)
}

fn local_dir(location: &str) -> Option<PathBuf> {
    let path = Path::new(location);
    path.exists().then(|| path.to_path_buf())
}

async fn fetch_required(repo: &ApiRepo, repo_id: &str, file: &str) -> Result<PathBuf> {
    debug!("Downloading {} from {}", file, repo_id);
    repo.get(file)
        .await
        .map_err(|e| MergeError::hub(format!("failed to fetch {} from {}: {}", file, repo_id, e)))
}

async fn fetch_optional(repo: &ApiRepo, file: &str) {
    match repo.get(file).await {
        Ok(path) => debug!("Downloaded {}", path.display()),
        Err(e) => debug!("Optional file {} not available: {}", file, e),
    }
}

fn snapshot_dir(file: &Path) -> Result<PathBuf> {
    file.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| MergeError::hub(format!("no snapshot directory for {}", file.display())))
}

fn hub_error(e: hf_hub::api::tokio::ApiError) -> MergeError {
    MergeError::hub(e.to_string())
}
