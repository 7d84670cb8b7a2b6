//! Endpoint fleet configuration and orchestrator settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-item retry budget (retries, not attempts).
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default interval between periodic run-summary writes.
pub const DEFAULT_RUN_SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

/// Default throttle after a successful summary write.
pub const DEFAULT_SUMMARY_WRITE_THROTTLE: Duration = Duration::from_secs(3);

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),
    #[error("Configuration defines no usable endpoints")]
    Empty,
}

/// Configuration for a single endpoint.
///
/// Compared by value during hot-swap: a manager survives a reconfiguration
/// only if its stored config equals the new one. Keys the orchestrator does
/// not understand are retained in `extra` and passed through to the work
/// item processor untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Language this endpoint serves. Work items carrying a different
    /// language tag are never handed to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Number of concurrent worker tasks for this endpoint.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Remaining keys, opaque to the orchestrator.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            language: None,
            concurrency: default_concurrency(),
            extra: BTreeMap::new(),
        }
    }
}

impl EndpointConfig {
    fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Load the endpoint configuration file (a YAML mapping of endpoint name
/// to [`EndpointConfig`]).
///
/// With `strict` set, any invalid endpoint entry fails the whole load;
/// otherwise invalid entries are skipped with a warning so a partially
/// broken file can still drive the fleet.
pub fn load_configuration(
    path: &Path,
    strict: bool,
) -> Result<BTreeMap<String, EndpointConfig>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

    let mut endpoints = BTreeMap::new();
    for (name, value) in raw {
        let parsed: Result<EndpointConfig, String> = serde_yaml::from_value(value)
            .map_err(|e| e.to_string())
            .and_then(|config: EndpointConfig| config.validate().map(|_| config));
        match parsed {
            Ok(config) => {
                endpoints.insert(name, config);
            }
            Err(reason) if strict => {
                return Err(ConfigError::InvalidEndpoint(name, reason));
            }
            Err(reason) => {
                tracing::warn!("Skipping invalid endpoint '{}': {}", name, reason);
            }
        }
    }

    if endpoints.is_empty() {
        return Err(ConfigError::Empty);
    }
    Ok(endpoints)
}

/// Settings for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Endpoint configuration file; watched for changes while running.
    pub config_file: PathBuf,
    /// Fail configuration loads on any invalid endpoint entry.
    pub strict_config: bool,
    /// Folder offered to processors for their own log artifacts.
    pub log_folder: PathBuf,
    /// Directories processors may search for cached prior results.
    pub cache_search_dirs: Vec<PathBuf>,
    /// When set, summaries go to this single path instead of the status
    /// provider, and per-item results accumulate across batches.
    pub singleton_run_summary_path: Option<PathBuf>,
    /// Per-item retry budget, counted across all endpoint managers.
    pub max_retries: u32,
    pub run_summary_interval: Duration,
    pub summary_write_throttle: Duration,
    /// Enables the periodic introspection dump when set.
    pub debug_loop_interval: Option<Duration>,
}

impl OrchestratorSettings {
    pub fn new(config_file: impl Into<PathBuf>, log_folder: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            strict_config: false,
            log_folder: log_folder.into(),
            cache_search_dirs: Vec::new(),
            singleton_run_summary_path: None,
            max_retries: DEFAULT_MAX_RETRIES,
            run_summary_interval: DEFAULT_RUN_SUMMARY_INTERVAL,
            summary_write_throttle: DEFAULT_SUMMARY_WRITE_THROTTLE,
            debug_loop_interval: None,
        }
    }
}
