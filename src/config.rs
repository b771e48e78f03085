//! Run configuration
//!
//! Loaded from a YAML file. Every field has a default, so a missing or
//! empty file yields a usable configuration. Backend selection is turned
//! into an immutable, priority-ordered list once at startup.

use crate::backend::{
    BackendDescriptor, CommandBackend, CommandBackendConfig, DispatchOptions, Dispatcher,
    QuotaClassifier, DEFAULT_QUOTA_PATTERNS,
};
use crate::checkpoint::RetryConfig;
use crate::classify::Thresholds;
use crate::pacing::FixedPacing;
use crate::packer::PackingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Base directory for the database, checkpoints and review output
/// (`~/.local/share/concord` on Linux).
pub fn default_data_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    data_dir.join("concord")
}

/// Default database path
pub fn default_db_path() -> PathBuf {
    default_data_dir().join("concord.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub stop_on_quota: bool,
    /// Case handling is up to each pattern, e.g. `(?i)quota`
    pub quota_patterns: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            stop_on_quota: true,
            quota_patterns: DEFAULT_QUOTA_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub enabled: bool,
    pub attempts: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 1,
        }
    }
}

fn default_timeout() -> u64 {
    120
}

fn default_enabled() -> bool {
    true
}

/// A subprocess backend entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// Lower runs first
    pub priority: u32,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub checkpoint_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            checkpoint_dir: base.join("checkpoints"),
            output_dir: base.join("output"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub packing: PackingConfig,
    pub thresholds: Thresholds,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub repair: RepairConfig,
    pub pacing: FixedPacing,
    pub backends: Vec<BackendConfig>,
    pub paths: PathsConfig,
}

impl Config {
    /// Parse and validate YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Load `path`, or `config.yaml` in the data dir if present, or defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let fallback = default_data_dir().join("config.yaml");
                if fallback.exists() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.packing;
        if p.max_units_per_batch == 0 || p.max_items_per_batch == 0 {
            return Err(ConfigError::Invalid("packing caps must be positive".to_string()));
        }
        for (name, value) in [
            ("exact_min", self.thresholds.exact_min),
            ("likely_min", self.thresholds.likely_min),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "threshold {} must be within 0-100, got {}",
                    name, value
                )));
            }
        }
        if self.retry.sub_batch_size == 0 {
            return Err(ConfigError::Invalid("retry.sub_batch_size must be positive".to_string()));
        }
        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
        }
        QuotaClassifier::new(&self.dispatch.quota_patterns)
            .map_err(|e| ConfigError::Invalid(format!("bad quota pattern: {}", e)))?;
        Ok(())
    }

    pub fn dispatcher(&self) -> Result<Dispatcher, ConfigError> {
        let classifier = QuotaClassifier::new(&self.dispatch.quota_patterns)
            .map_err(|e| ConfigError::Invalid(format!("bad quota pattern: {}", e)))?;
        Ok(Dispatcher::new(classifier))
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            stop_on_quota: self.dispatch.stop_on_quota,
        }
    }

    /// Backends selected for this run, in dispatch order.
    ///
    /// With `only` empty, every enabled backend is used in configured
    /// priority order. Otherwise exactly the named backends are used, in the
    /// order given.
    pub fn backend_selection(&self, only: &[String]) -> Result<Vec<BackendConfig>, ConfigError> {
        if only.is_empty() {
            let mut selected: Vec<BackendConfig> =
                self.backends.iter().filter(|b| b.enabled).cloned().collect();
            selected.sort_by_key(|b| b.priority);
            return Ok(selected);
        }

        only.iter()
            .enumerate()
            .map(|(rank, name)| {
                self.backends
                    .iter()
                    .find(|b| &b.name == name)
                    .map(|b| BackendConfig {
                        priority: rank as u32 + 1,
                        ..b.clone()
                    })
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown backend '{}'", name)))
            })
            .collect()
    }

    /// Build the immutable descriptor list for the selected subprocess backends.
    pub fn backend_descriptors(&self, only: &[String]) -> Result<Vec<BackendDescriptor>, ConfigError> {
        let descriptors = self
            .backend_selection(only)?
            .into_iter()
            .map(|b| {
                let backend = CommandBackend::new(
                    CommandBackendConfig::new(b.command)
                        .with_args(b.args)
                        .with_timeout(b.timeout_secs),
                );
                BackendDescriptor::new(b.name, b.priority, Arc::new(backend))
            })
            .collect();
        Ok(BackendDescriptor::ordered(descriptors))
    }
}
