//! Non-weight checkpoint assets: tokenizer, processor and auxiliary files

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::apply::saver::copy_if_present;
use crate::error::{MergeError, Result};

/// Serialized fast tokenizer
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Tokenizer settings
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Tokenizer files carried over verbatim when present
pub const TOKENIZER_AUX_FILES: &[&str] = &[
    TOKENIZER_CONFIG_FILE,
    "special_tokens_map.json",
    "added_tokens.json",
    "vocab.json",
    "merges.txt",
    "vocab.txt",
    "tokenizer.model",
    "chat_template.jinja",
];

/// Processor configuration files
pub const PROCESSOR_FILES: &[&str] = &[
    "preprocessor_config.json",
    "processor_config.json",
    "video_preprocessor_config.json",
    "chat_template.json",
];

/// Tokenizer of the base checkpoint
pub struct TokenizerAssets {
    source_dir: PathBuf,
    tokenizer: Option<tokenizers::Tokenizer>,
    files: Vec<&'static str>,
}

impl std::fmt::Debug for TokenizerAssets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerAssets")
            .field("source_dir", &self.source_dir)
            .field("fast_tokenizer", &self.tokenizer.is_some())
            .field("files", &self.files)
            .finish()
    }
}

impl TokenizerAssets {
    /// Load the tokenizer found in a checkpoint directory
    pub async fn load(dir: &Path) -> Result<Self> {
        let tokenizer_path = dir.join(TOKENIZER_FILE);
        let has_fast = fs::try_exists(&tokenizer_path).await?;
        let has_config = fs::try_exists(dir.join(TOKENIZER_CONFIG_FILE)).await?;

        if !has_fast && !has_config {
            return Err(MergeError::tokenizer(format!(
                "neither {} nor {} found in {}",
                TOKENIZER_FILE,
                TOKENIZER_CONFIG_FILE,
                dir.display()
            )));
        }

        let tokenizer = if has_fast {
            let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| {
                MergeError::tokenizer(format!("failed to parse {}: {}", tokenizer_path.display(), e))
            })?;
            debug!(
                "Loaded tokenizer with vocabulary size {}",
                tokenizer.get_vocab_size(true)
            );
            Some(tokenizer)
        } else {
            None
        };

        if has_config {
            let content = fs::read_to_string(dir.join(TOKENIZER_CONFIG_FILE)).await?;
            serde_json::from_str::<serde_json::Value>(&content).map_err(|e| {
                MergeError::tokenizer(format!("invalid {}: {}", TOKENIZER_CONFIG_FILE, e))
            })?;
        }

        let mut files = Vec::new();
        for file in TOKENIZER_AUX_FILES {
            if fs::try_exists(dir.join(file)).await? {
                files.push(*file);
            }
        }

        Ok(Self {
            source_dir: dir.to_path_buf(),
            tokenizer,
            files,
        })
    }

    /// Vocabulary size including added tokens, when a fast tokenizer is present
    pub fn vocab_size(&self) -> Option<usize> {
        self.tokenizer.as_ref().map(|t| t.get_vocab_size(true))
    }

    /// Write the tokenizer into `output_dir`, returning the file names written
    pub async fn save(&self, output_dir: &Path) -> Result<Vec<String>> {
        let mut written = Vec::new();

        if let Some(tokenizer) = &self.tokenizer {
            let path = output_dir.join(TOKENIZER_FILE);
            tokenizer
                .save(&path, false)
                .map_err(|e| MergeError::tokenizer(format!("failed to save {}: {}", path.display(), e)))?;
            written.push(TOKENIZER_FILE.to_string());
        }

        for file in &self.files {
            if copy_if_present(&self.source_dir, output_dir, file).await? {
                written.push(file.to_string());
            }
        }

        debug!("Saved tokenizer files: {:?}", written);
        Ok(written)
    }
}

/// Processor configuration of a multimodal checkpoint
#[derive(Debug, Clone)]
pub struct ProcessorAssets {
    files: Vec<(&'static str, serde_json::Value)>,
}

impl ProcessorAssets {
    /// Load processor configuration
    ///
    /// Fails when the directory has no preprocessor or processor config, or
    /// when any processor file is not valid JSON.
    pub async fn load(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        for file in PROCESSOR_FILES {
            let path = dir.join(file);
            if !fs::try_exists(&path).await? {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            let value: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
                MergeError::model_loading(format!("invalid {}: {}", path.display(), e))
            })?;
            files.push((*file, value));
        }

        let has_processor = files
            .iter()
            .any(|(name, _)| *name == "preprocessor_config.json" || *name == "processor_config.json");
        if !has_processor {
            return Err(MergeError::model_loading(format!(
                "no processor configuration in {}",
                dir.display()
            )));
        }

        Ok(Self { files })
    }

    /// File names that will be written
    pub fn file_names(&self) -> Vec<&'static str> {
        self.files.iter().map(|(name, _)| *name).collect()
    }

    /// Write processor files into `output_dir`
    pub async fn save(&self, output_dir: &Path) -> Result<Vec<String>> {
        let mut written = Vec::with_capacity(self.files.len());
        for (name, value) in &self.files {
            fs::write(output_dir.join(name), serde_json::to_string_pretty(value)?).await?;
            written.push(name.to_string());
        }
        Ok(written)
    }
}

/// Copy the auxiliary file from the base checkpoint into the output directory
///
/// Returns whether the file existed and was copied.
pub async fn copy_extra_file(base_dir: &Path, save_dir: &Path, file_name: &str) -> Result<bool> {
    let copied = copy_if_present(base_dir, save_dir, file_name).await?;
    if copied {
        info!(
            "File '{}' copied from {} to {}.",
            file_name,
            base_dir.display(),
            save_dir.display()
        );
    } else {
        info!(
            "File '{}' not found in {}, skipping copy.",
            file_name,
            base_dir.display()
        );
    }
    Ok(copied)
}
