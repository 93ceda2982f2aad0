//! Error types for submodule LoRA merging

use thiserror::Error;

/// Main error type for merge operations
#[derive(Error, Debug)]
pub enum MergeError {
    /// The requested submodule prefix does not exist in the base model
    #[error("The model does not have a submodule named '{name}'.")]
    SubmoduleNotFound {
        /// Requested submodule name
        name: String,
        /// Top-level submodules that do exist
        available: Vec<String>,
    },

    /// Base model could not be loaded
    #[error("Model loading error: {0}")]
    ModelLoading(String),

    /// Adapter checkpoint could not be loaded
    #[error("Adapter loading error: {0}")]
    AdapterLoading(String),

    /// Tokenizer files missing or unreadable
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Adapter does not fit the extracted submodule
    #[error("Incompatible adapter: {0}")]
    IncompatibleAdapter(String),

    /// Tensor shapes disagree
    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor name
        name: String,
        /// Shape required by the base weight
        expected: Vec<usize>,
        /// Shape produced or found
        actual: Vec<usize>,
    },

    /// Tensor dtype cannot take part in the operation
    #[error("Unsupported dtype {dtype} for tensor '{name}'")]
    UnsupportedDtype {
        /// Tensor name
        name: String,
        /// Offending dtype, as written in the safetensors header
        dtype: String,
    },

    /// Checkpoint file format not handled
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Hugging Face Hub download failure
    #[error("Hub error: {0}")]
    Hub(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// SafeTensors encode/decode error
    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for merge operations
pub type Result<T> = std::result::Result<T, MergeError>;

impl MergeError {
    /// Create a model loading error
    pub fn model_loading(msg: impl Into<String>) -> Self {
        Self::ModelLoading(msg.into())
    }

    /// Create an adapter loading error
    pub fn adapter_loading(msg: impl Into<String>) -> Self {
        Self::AdapterLoading(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Self::Tokenizer(msg.into())
    }

    /// Create an incompatible adapter error
    pub fn incompatible(msg: impl Into<String>) -> Self {
        Self::IncompatibleAdapter(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a hub error
    pub fn hub(msg: impl Into<String>) -> Self {
        Self::Hub(msg.into())
    }
}
