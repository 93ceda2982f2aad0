//! Submodule LoRA merge
//!
//! Loads a base checkpoint, pulls out one named submodule, folds a LoRA
//! adapter into it, puts it back and writes the merged checkpoint together
//! with its tokenizer, processor configuration and one auxiliary file.

pub mod assets;
pub mod loader;
pub mod merger;
pub mod saver;

use candle_core::Device;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{MergeError, Result};
use crate::lora::LoraAdapter;
use crate::utils::tensor::parse_size;
use assets::{ProcessorAssets, TokenizerAssets};
use merger::MergeReport;
use saver::{SaveReport, DEFAULT_MAX_SHARD_SIZE};

/// Auxiliary file copied next to the merged weights by default
pub const DEFAULT_EXTRA_FILE: &str = "spk_dict.pt";
/// Submodule the adapter is merged into by default
pub const DEFAULT_SUBMODULE_NAME: &str = "thinker";
/// Output directory used when none is given
pub const DEFAULT_SAVE_PATH: &str = "./merged_model_checkpoint";

/// Parameters of one merge run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeRequest {
    /// Base checkpoint directory or Hub repo id
    pub base_model_path: String,
    /// Adapter directory or Hub repo id
    pub lora_checkpoint_path: String,
    /// File copied verbatim from the base checkpoint when present
    pub extra_file: String,
    /// Submodule the adapter was trained on
    pub submodule_name: String,
    /// Output directory
    pub save_path: PathBuf,
    /// Upper bound for one weight file, in bytes
    pub max_shard_size: u64,
}

impl MergeRequest {
    /// Request with default extra file, submodule, output path and shard size
    pub fn new(base_model_path: impl Into<String>, lora_checkpoint_path: impl Into<String>) -> Self {
        Self {
            base_model_path: base_model_path.into(),
            lora_checkpoint_path: lora_checkpoint_path.into(),
            extra_file: DEFAULT_EXTRA_FILE.to_string(),
            submodule_name: DEFAULT_SUBMODULE_NAME.to_string(),
            save_path: PathBuf::from(DEFAULT_SAVE_PATH),
            // 5 GB
            max_shard_size: 5_000_000_000,
        }
    }

    /// Auxiliary file name
    pub fn with_extra_file(mut self, extra_file: impl Into<String>) -> Self {
        self.extra_file = extra_file.into();
        self
    }

    /// Submodule name
    pub fn with_submodule_name(mut self, name: impl Into<String>) -> Self {
        self.submodule_name = name.into();
        self
    }

    /// Output directory
    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = path.into();
        self
    }

    /// Set the shard limit from a human readable size such as `2GB`
    pub fn with_max_shard_size(mut self, size: &str) -> Result<Self> {
        self.max_shard_size = parse_size(size)?;
        Ok(self)
    }

    /// Check the parameters before any file is touched
    pub fn validate(&self) -> Result<()> {
        if self.base_model_path.trim().is_empty() {
            return Err(MergeError::invalid_input("base model path cannot be empty"));
        }
        if self.lora_checkpoint_path.trim().is_empty() {
            return Err(MergeError::invalid_input("LoRA checkpoint path cannot be empty"));
        }
        if self.extra_file.is_empty() || Path::new(&self.extra_file).is_absolute() {
            return Err(MergeError::invalid_input(format!(
                "extra file must be a path relative to the base model, got '{}'",
                self.extra_file
            )));
        }
        if self.save_path.as_os_str().is_empty() {
            return Err(MergeError::invalid_input("save path cannot be empty"));
        }
        if self.max_shard_size == 0 {
            return Err(MergeError::invalid_input("max shard size must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for MergeRequest {
    fn default() -> Self {
        Self::new(String::new(), String::new())
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    /// Local base checkpoint directory
    pub base_model_dir: PathBuf,
    /// Local adapter directory
    pub adapter_dir: PathBuf,
    /// Merged submodule
    pub submodule: String,
    /// Tensors in the merged submodule
    pub submodule_tensors: usize,
    /// Merge statistics
    pub merge: MergeReport,
    /// Written weight files
    pub save: SaveReport,
    /// Tokenizer files written
    pub tokenizer_files: Vec<String>,
    /// Vocabulary size, when `tokenizer.json` was present
    pub vocab_size: Option<usize>,
    /// Processor files written; empty when the base had none
    pub processor_files: Vec<String>,
    /// Whether the auxiliary file was copied
    pub extra_file_copied: bool,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

/// Runs a submodule merge on a compute device
pub struct SubmoduleMerger {
    device: Device,
}

impl SubmoduleMerger {
    /// Create a merger that does its arithmetic on `device`
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Merge the adapter into the submodule and save the result
    pub async fn run(&self, request: &MergeRequest) -> Result<MergeSummary> {
        request.validate()?;
        let start = std::time::Instant::now();

        let base_dir =
            crate::hub::resolve_model_dir(&request.base_model_path, &request.extra_file).await?;
        let adapter_dir = crate::hub::resolve_adapter_dir(&request.lora_checkpoint_path).await?;

        // 1. Base model, tokenizer and optional processor
        let mut model = loader::load_base_model(&base_dir).await?;
        let tokenizer = TokenizerAssets::load(&base_dir).await?;
        let processor = match ProcessorAssets::load(&base_dir).await {
            Ok(processor) => Some(processor),
            Err(e) => {
                tracing::debug!("Processor load failed: {}", e);
                info!("Processor configuration not found, skipping processor load.");
                None
            }
        };
        info!("Successfully loaded the original model, tokenizer, and processor (if available).");

        // 2. Submodule
        let mut submodule = model.take_submodule(&request.submodule_name)?;
        info!("Successfully extracted submodule: {}.", request.submodule_name);

        // 3. Adapter
        let adapter = LoraAdapter::load(&adapter_dir).await?;
        info!("LoRA weights loaded successfully.");

        // 4. Merge and drop the adapter
        let report = merger::merge_and_unload(&mut submodule, &adapter, &self.device)?;
        drop(adapter);
        info!("LoRA weights merged successfully.");

        // 5. Substitute back
        let submodule_tensors = submodule.tensors.len();
        model.insert_submodule(submodule);

        // 6. Save
        let save = saver::save_model(&model, &request.save_path, request.max_shard_size).await?;
        let tokenizer_files = tokenizer.save(&request.save_path).await?;
        let processor_files = match &processor {
            Some(processor) => processor.save(&request.save_path).await?,
            None => Vec::new(),
        };
        info!(
            "Merged model and configuration saved to {}.",
            request.save_path.display()
        );

        // 7. Auxiliary file
        let extra_file_copied =
            assets::copy_extra_file(&base_dir, &request.save_path, &request.extra_file).await?;

        Ok(MergeSummary {
            base_model_dir: base_dir,
            adapter_dir,
            submodule: request.submodule_name.clone(),
            submodule_tensors,
            merge: report,
            save,
            tokenizer_files,
            vocab_size: tokenizer.vocab_size(),
            processor_files,
            extra_file_copied,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Parse the default shard limit
pub fn default_max_shard_size() -> Result<u64> {
    parse_size(DEFAULT_MAX_SHARD_SIZE)
}
