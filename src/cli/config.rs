use crate::apply::{DEFAULT_EXTRA_FILE, DEFAULT_SAVE_PATH, DEFAULT_SUBMODULE_NAME};
use crate::apply::saver::DEFAULT_MAX_SHARD_SIZE;
use crate::cli::error::{CliError, CliResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub merge: MergeConfig,
    pub logging: LoggingConfig,
}

/// Defaults for `lora-merge merge`; command-line flags take precedence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub extra_file: String,
    pub submodule_name: String,
    pub save_path: PathBuf,
    pub max_shard_size: String,
    pub device: DeviceType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[value(name = "cuda")]
    Cuda,
    #[value(name = "cpu")]
    Cpu,
    #[value(name = "auto")]
    Auto,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            extra_file: DEFAULT_EXTRA_FILE.to_string(),
            submodule_name: DEFAULT_SUBMODULE_NAME.to_string(),
            save_path: PathBuf::from(DEFAULT_SAVE_PATH),
            max_shard_size: DEFAULT_MAX_SHARD_SIZE.to_string(),
            device: DeviceType::Cpu,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> CliResult<()> {
        if self.merge.submodule_name.trim().is_empty() {
            return Err(CliError::Config("merge.submodule_name cannot be empty".to_string()));
        }

        if self.merge.extra_file.is_empty() {
            return Err(CliError::Config("merge.extra_file cannot be empty".to_string()));
        }

        crate::utils::parse_size(&self.merge.max_shard_size)
            .map_err(|e| CliError::Config(format!("merge.max_shard_size: {}", e)))?;

        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(CliError::Config(format!(
                "logging.level must be one of error, warn, info, debug, trace; got '{}'",
                self.logging.level
            )));
        }

        Ok(())
    }
}

pub fn get_default_config_path() -> CliResult<PathBuf> {
    let proj_dirs = ProjectDirs::from("ai", "lorax", "lora-merge")
        .ok_or_else(|| CliError::Config("Failed to determine config directory".to_string()))?;

    Ok(proj_dirs.config_dir().join("config.yaml"))
}

/// Load configuration from `config_path`, or the default location
///
/// A missing file yields the defaults.
pub fn load_config(config_path: Option<&str>) -> CliResult<Config> {
    let config_file = match config_path {
        Some(path) => PathBuf::from(path),
        None => get_default_config_path()?,
    };

    if !config_file.exists() {
        if config_path.is_some() {
            return Err(CliError::FileNotFound(config_file.display().to_string()));
        }
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&config_file)
        .map_err(|e| CliError::Config(format!("Failed to read config file: {}", e)))?;

    let config: Config = match ConfigFormat::of(&config_file) {
        ConfigFormat::Yaml => serde_yaml::from_str(&content)?,
        ConfigFormat::Toml => toml::from_str(&content)?,
        ConfigFormat::Json => serde_json::from_str(&content)?,
    };

    config.validate()?;
    Ok(config)
}

pub fn save_config(config: &Config, config_file: &Path) -> CliResult<()> {
    if let Some(parent) = config_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = match ConfigFormat::of(config_file) {
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
        ConfigFormat::Toml => toml::to_string(config)
            .map_err(|e| CliError::Config(format!("TOML serialization error: {}", e)))?,
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
    };

    fs::write(config_file, content)
        .map_err(|e| CliError::Config(format!("Failed to write config file: {}", e)))?;

    Ok(())
}

pub fn show_config(config: &Config, json: bool) -> CliResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        println!("{}", serde_yaml::to_string(config)?);
    }
    Ok(())
}

pub fn init_config(config_path: Option<&str>, force: bool) -> CliResult<PathBuf> {
    let config_file = match config_path {
        Some(path) => PathBuf::from(path),
        None => get_default_config_path()?,
    };

    if config_file.exists() && !force {
        return Err(CliError::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_file.display()
        )));
    }

    save_config(&Config::default(), &config_file)?;
    Ok(config_file)
}

enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::Yaml,
            Some("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}
