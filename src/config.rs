//! Application configuration module
//!
//! Settings are layered: built-in defaults, then an optional config file
//! (`CONFIGFLOW_CONFIG` or `configflow.{yaml,toml,json}`), then environment
//! variables such as `CONFIGFLOW_LOADER__WORKER_COUNT=8`.

use crate::pipeline::types::PipelineOptions;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load environment file: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(e: validator::ValidationErrors) -> Self {
        ConfigError::InvalidValue(e.to_string())
    }
}

/// Loader configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoaderSettings {
    /// Maximum number of concurrent file reads
    #[validate(range(min = 1, max = 64))]
    pub worker_count: usize,
    #[validate(range(min = 1))]
    pub read_timeout_ms: u64,
    /// Globs applied to every source, relative to the source root
    pub ignore: Vec<String>,
    /// File extensions treated as configuration documents
    pub extensions: Vec<String>,
    /// Binary used for git sources
    pub git_binary: String,
}

impl LoaderSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            read_timeout_ms: 10_000,
            ignore: Vec::new(),
            extensions: vec!["yaml".to_string(), "yml".to_string(), "json".to_string()],
            git_binary: "git".to_string(),
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ExecutorSettings {
    pub shell: String,
    pub ssh_binary: String,
    pub service_manager: String,
    #[validate(range(min = 1))]
    pub command_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub remote_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub http_timeout_ms: u64,
}

impl ExecutorSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            ssh_binary: "ssh".to_string(),
            service_manager: "systemctl".to_string(),
            command_timeout_ms: 60_000,
            remote_timeout_ms: 120_000,
            http_timeout_ms: 30_000,
        }
    }
}

/// Where evidence chains and artifacts are persisted (memory-only when unset)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_dir: Option<PathBuf>,
}

/// Complete application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    #[validate(nested)]
    pub pipeline: PipelineOptions,
    #[validate(nested)]
    pub loader: LoaderSettings,
    #[validate(nested)]
    pub executor: ExecutorSettings,
    pub storage: StorageSettings,
}

impl Settings {
    /// Load settings from `.env`, the optional config file and the environment
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let file = std::env::var("CONFIGFLOW_CONFIG").ok().map(PathBuf::from);
        Self::load_with(file.as_deref())
    }

    /// Load settings with an explicit config file path
    pub fn load_with(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        builder = match file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("configflow").required(false)),
        };

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("CONFIGFLOW")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("loader.ignore")
                    .with_list_parse_key("loader.extensions"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }
}
