use colored::*;
use thiserror::Error;

use crate::error::MergeError;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("CUDA not available")]
    CudaNotAvailable,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Print a user-friendly error message
    pub fn print_error(&self) {
        eprintln!("{} {}", "Error:".red().bold(), self);

        match self {
            CliError::Config(msg) if msg.contains("already exists") => {
                eprintln!(
                    "\n{} Run {} to overwrite it",
                    "Hint:".yellow(),
                    "lora-merge config init --force".cyan()
                );
            }
            CliError::FileNotFound(path) => {
                eprintln!(
                    "\n{} Make sure the file exists and the path is correct: {}",
                    "Hint:".yellow(),
                    path.cyan()
                );
            }
            CliError::InvalidArgument(_) => {
                eprintln!(
                    "\n{} Use {} for more information",
                    "Hint:".yellow(),
                    "lora-merge --help".cyan()
                );
            }
            CliError::CudaNotAvailable => {
                eprintln!(
                    "\n{} Rebuild with {} or pass {}",
                    "Hint:".yellow(),
                    "--features cuda".cyan(),
                    "--device cpu".cyan()
                );
            }
            CliError::Merge(err) => print_merge_hint(err),
            _ => {}
        }
    }
}

fn print_merge_hint(err: &MergeError) {
    match err {
        MergeError::SubmoduleNotFound { available, .. } if !available.is_empty() => {
            eprintln!(
                "\n{} Available submodules: {}",
                "Hint:".yellow(),
                available.join(", ").cyan()
            );
        }
        MergeError::IncompatibleAdapter(_) | MergeError::ShapeMismatch { .. } => {
            eprintln!(
                "\n{} Check that {} names the module the adapter was trained on. {} lists what the checkpoint contains",
                "Hint:".yellow(),
                "--submodule-name".cyan(),
                "lora-merge inspect".cyan()
            );
        }
        MergeError::Tokenizer(_) => {
            eprintln!(
                "\n{} The base model directory needs tokenizer.json or tokenizer_config.json",
                "Hint:".yellow()
            );
        }
        MergeError::UnsupportedFormat(_) => {
            eprintln!(
                "\n{} Convert pickle checkpoints to safetensors before merging",
                "Hint:".yellow()
            );
        }
        _ => {}
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CliError {
    fn from(err: serde_yaml::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CliError {
    fn from(err: toml::de::Error) -> Self {
        CliError::Config(err.to_string())
    }
}
