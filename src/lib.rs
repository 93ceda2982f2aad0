//! lora-merge - fold a PEFT LoRA adapter into one submodule of a checkpoint
//!
//! Multimodal checkpoints nest several models under named prefixes
//! (`thinker.`, `talker.`, ...). An adapter trained on one of them only knows
//! that submodule's parameter names. This crate:
//! - Loads a safetensors checkpoint with its tokenizer and processor files
//! - Extracts the named submodule and merges the adapter into it
//! - Writes the merged checkpoint plus an auxiliary file such as `spk_dict.pt`

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod apply;
pub mod cli;
pub mod error;
pub mod hub;
pub mod lora;
pub mod utils;

// Re-exports
pub use apply::{MergeRequest, MergeSummary, SubmoduleMerger};
pub use error::{MergeError, Result};
pub use lora::{AdapterConfig, LoraAdapter};

/// Current version of lora-merge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
