//! LoRA (Low-Rank Adaptation) adapters in PEFT layout
//!
//! An adapter directory holds `adapter_config.json` and
//! `adapter_model.safetensors`. Parameter names are relative to the module the
//! adapter was trained on, so an adapter trained on a submodule merges into
//! that submodule only.

pub mod adapter;
pub mod config;

pub use adapter::{AdapterSummary, LayerKind, LoraAdapter, LoraLayer, ADAPTER_WEIGHTS_FILE};
pub use config::{AdapterConfig, TargetModules, ADAPTER_CONFIG_FILE};
