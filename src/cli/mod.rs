//! Command-line interface for `lora-merge`
#![allow(missing_docs)]

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod progress;

// Re-export command structures
pub use commands::{inspect::InspectCommand, merge::MergeCommand};

// Re-export error types
pub use error::{CliError, CliResult};
