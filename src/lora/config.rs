//! PEFT adapter configuration (`adapter_config.json`)

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{MergeError, Result};

/// File name of the adapter configuration inside a PEFT checkpoint
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Adapter configuration as written by PEFT
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    /// Adapter type; only `LORA` is mergeable here
    #[serde(default)]
    pub peft_type: Option<String>,
    /// Default LoRA rank
    pub r: usize,
    /// Default LoRA alpha
    pub lora_alpha: f64,
    /// Modules the adapter was attached to
    #[serde(default)]
    pub target_modules: Option<TargetModules>,
    /// Whether base weights are stored transposed (Conv1D style)
    #[serde(default)]
    pub fan_in_fan_out: bool,
    /// Rank-stabilised scaling
    #[serde(default)]
    pub use_rslora: bool,
    /// Weight-decomposed LoRA
    #[serde(default)]
    pub use_dora: bool,
    /// Per-module rank overrides
    #[serde(default)]
    pub rank_pattern: HashMap<String, usize>,
    /// Per-module alpha overrides
    #[serde(default)]
    pub alpha_pattern: HashMap<String, f64>,
    /// Fully trained modules stored alongside the adapter
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
    /// Bias handling (`none`, `all`, `lora_only`)
    #[serde(default = "default_bias")]
    pub bias: String,
    /// Model the adapter was trained against
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    /// Task type recorded by PEFT
    #[serde(default)]
    pub task_type: Option<String>,
}

/// `target_modules` is either a list of names or a single pattern string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TargetModules {
    /// Explicit module names
    List(Vec<String>),
    /// A single name or regex
    Pattern(String),
}

fn default_bias() -> String {
    "none".to_string()
}

impl AdapterConfig {
    /// Load and validate `adapter_config.json` from an adapter directory
    pub async fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        if !path.exists() {
            return Err(MergeError::adapter_loading(format!(
                "{} not found in {}",
                ADAPTER_CONFIG_FILE,
                dir.display()
            )));
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            MergeError::adapter_loading(format!("invalid {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(peft_type) = &self.peft_type {
            if !peft_type.eq_ignore_ascii_case("lora") {
                return Err(MergeError::adapter_loading(format!(
                    "unsupported peft_type '{}', only LORA adapters can be merged",
                    peft_type
                )));
            }
        }

        if self.r == 0 {
            return Err(MergeError::adapter_loading("LoRA rank cannot be zero"));
        }

        if let Some((key, _)) = self.rank_pattern.iter().find(|(_, r)| **r == 0) {
            return Err(MergeError::adapter_loading(format!(
                "rank_pattern entry '{}' has rank zero",
                key
            )));
        }

        for key in self.rank_pattern.keys().chain(self.alpha_pattern.keys()) {
            pattern_regex(key).map_err(|e| {
                MergeError::adapter_loading(format!("invalid pattern key '{}': {}", key, e))
            })?;
        }

        Ok(())
    }

    /// Rank for a module, after applying `rank_pattern`
    pub fn rank_for(&self, module: &str) -> usize {
        best_match(&self.rank_pattern, module)
            .copied()
            .unwrap_or(self.r)
    }

    /// Alpha for a module, after applying `alpha_pattern`
    pub fn alpha_for(&self, module: &str) -> f64 {
        best_match(&self.alpha_pattern, module)
            .copied()
            .unwrap_or(self.lora_alpha)
    }

    /// Scaling applied to `B @ A` for a module
    pub fn scaling_for(&self, module: &str) -> f64 {
        let rank = self.rank_for(module) as f64;
        let alpha = self.alpha_for(module);
        if self.use_rslora {
            alpha / rank.sqrt()
        } else {
            alpha / rank
        }
    }

    /// Human readable list of target modules
    pub fn target_summary(&self) -> String {
        match &self.target_modules {
            Some(TargetModules::List(modules)) => modules.join(", "),
            Some(TargetModules::Pattern(pattern)) => pattern.clone(),
            None => "<unspecified>".to_string(),
        }
    }
}

/// Compile a `rank_pattern` / `alpha_pattern` key.
///
/// Keys are regexes matched against the whole module path, optionally
/// preceded by any dotted prefix.
fn pattern_regex(key: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!(r"^(?:.*\.)?(?:{})$", key))
}

/// Longest pattern key that matches the module path
///
/// Keys that fail to compile never match; `validate` reports them.
fn best_match<'a, V>(patterns: &'a HashMap<String, V>, module: &str) -> Option<&'a V> {
    patterns
        .iter()
        .filter(|(key, _)| pattern_regex(key).is_ok_and(|re| re.is_match(module)))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, value)| value)
}
