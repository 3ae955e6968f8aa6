use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::metrics::StorageMetrics;

/// Relationship count at which a sparse node is converted to dense.
pub const DEFAULT_DENSE_NODE_THRESHOLD: u64 = 50;
/// Sub-chain degree at which a group starts tracking its degree in the
/// counts store.
pub const DEFAULT_EXTERNAL_DEGREES_THRESHOLD: u64 = 10;

/// Configuration options supplied when building a [`super::RecordStorageEngine`].
#[derive(Clone)]
pub struct EngineOptions {
    /// Degree at which a node's relationships are split into groups.
    pub dense_node_threshold: u64,
    /// Sub-chain degree after which groups keep their degree externally.
    pub external_degrees_threshold: u64,
    /// Whether to run the consistency checking applier on every batch.
    pub consistency_check_on_apply: bool,
    /// Whether lock acquisition is checked for ascending order.
    pub verify_lock_order: bool,
    /// Whether recovery runs the chain verifier after replay.
    pub verify_after_recovery: bool,
    /// Whether every commit syncs the command log before applying.
    pub sync_log_on_commit: bool,
    /// Optional metrics collection implementation
    pub metrics: Option<Arc<dyn StorageMetrics>>,
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("dense_node_threshold", &self.dense_node_threshold)
            .field("external_degrees_threshold", &self.external_degrees_threshold)
            .field("consistency_check_on_apply", &self.consistency_check_on_apply)
            .field("verify_lock_order", &self.verify_lock_order)
            .field("verify_after_recovery", &self.verify_after_recovery)
            .field("sync_log_on_commit", &self.sync_log_on_commit)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self {
            dense_node_threshold: DEFAULT_DENSE_NODE_THRESHOLD,
            external_degrees_threshold: DEFAULT_EXTERNAL_DEGREES_THRESHOLD,
            consistency_check_on_apply: false,
            verify_lock_order: false,
            verify_after_recovery: true,
            sync_log_on_commit: true,
            metrics: None,
        }
    }

    /// Sets the dense node threshold.
    pub fn dense_node_threshold(mut self, threshold: u64) -> Self {
        self.dense_node_threshold = threshold;
        self
    }

    /// Sets the external degrees threshold.
    pub fn external_degrees_threshold(mut self, threshold: u64) -> Self {
        self.external_degrees_threshold = threshold;
        self
    }

    /// Enables or disables chain consistency checks during apply.
    pub fn consistency_check_on_apply(mut self, enabled: bool) -> Self {
        self.consistency_check_on_apply = enabled;
        self
    }

    /// Enables or disables lock order verification.
    pub fn verify_lock_order(mut self, enabled: bool) -> Self {
        self.verify_lock_order = enabled;
        self
    }

    /// Enables or disables the chain verifier after recovery.
    pub fn verify_after_recovery(mut self, enabled: bool) -> Self {
        self.verify_after_recovery = enabled;
        self
    }

    /// Enables or disables the command log sync on commit.
    pub fn sync_log_on_commit(mut self, enabled: bool) -> Self {
        self.sync_log_on_commit = enabled;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn StorageMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Engine settings read from a TOML file.
///
/// ```toml
/// [engine]
/// dense_node_threshold = 50
/// verify_lock_order = true
/// log_path = "/var/lib/graph/commands.log"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// See [`EngineOptions::dense_node_threshold`].
    pub dense_node_threshold: Option<u64>,
    /// See [`EngineOptions::external_degrees_threshold`].
    pub external_degrees_threshold: Option<u64>,
    /// See [`EngineOptions::consistency_check_on_apply`].
    pub consistency_check_on_apply: Option<bool>,
    /// See [`EngineOptions::verify_lock_order`].
    pub verify_lock_order: Option<bool>,
    /// See [`EngineOptions::verify_after_recovery`].
    pub verify_after_recovery: Option<bool>,
    /// See [`EngineOptions::sync_log_on_commit`].
    pub sync_log_on_commit: Option<bool>,
    /// File backing the command log; in memory when unset.
    pub log_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Reads and validates the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        convert(raw.engine)
    }

    /// Parses config text that did not come from a file.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        convert(raw.engine)
    }

    /// Applies the configured values over `base`.
    pub fn apply_to(&self, mut base: EngineOptions) -> EngineOptions {
        if let Some(v) = self.dense_node_threshold {
            base = base.dense_node_threshold(v);
        }
        if let Some(v) = self.external_degrees_threshold {
            base = base.external_degrees_threshold(v);
        }
        if let Some(v) = self.consistency_check_on_apply {
            base = base.consistency_check_on_apply(v);
        }
        if let Some(v) = self.verify_lock_order {
            base = base.verify_lock_order(v);
        }
        if let Some(v) = self.verify_after_recovery {
            base = base.verify_after_recovery(v);
        }
        if let Some(v) = self.sync_log_on_commit {
            base = base.sync_log_on_commit(v);
        }
        base
    }

    /// Options with the file's settings over the defaults.
    pub fn to_options(&self) -> EngineOptions {
        self.apply_to(EngineOptions::new())
    }

    /// Serializes the config back to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let raw = RawConfig {
            engine: EngineSection {
                dense_node_threshold: self.dense_node_threshold,
                external_degrees_threshold: self.external_degrees_threshold,
                consistency_check_on_apply: self.consistency_check_on_apply,
                verify_lock_order: self.verify_lock_order,
                verify_after_recovery: self.verify_after_recovery,
                sync_log_on_commit: self.sync_log_on_commit,
                log_path: self.log_path.clone(),
            },
        };
        toml::to_string_pretty(&raw).map_err(|source| ConfigError::Serialize { source })
    }
}

fn convert(raw: EngineSection) -> Result<EngineConfig, ConfigError> {
    for (field, value) in [
        ("dense_node_threshold", raw.dense_node_threshold),
        ("external_degrees_threshold", raw.external_degrees_threshold),
    ] {
        if value == Some(0) {
            return Err(ConfigError::InvalidValue {
                field,
                value: "0".to_string(),
            });
        }
    }
    Ok(EngineConfig {
        dense_node_threshold: raw.dense_node_threshold,
        external_degrees_threshold: raw.external_degrees_threshold,
        consistency_check_on_apply: raw.consistency_check_on_apply,
        verify_lock_order: raw.verify_lock_order,
        verify_after_recovery: raw.verify_after_recovery,
        sync_log_on_commit: raw.sync_log_on_commit,
        log_path: raw.log_path,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    engine: EngineSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct EngineSection {
    dense_node_threshold: Option<u64>,
    external_degrees_threshold: Option<u64>,
    consistency_check_on_apply: Option<bool>,
    verify_lock_order: Option<bool>,
    verify_after_recovery: Option<bool>,
    sync_log_on_commit: Option<bool>,
    log_path: Option<PathBuf>,
}

/// Failure to read, parse, validate or write an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read engine config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this config.
    #[error("failed to parse engine config {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// The config could not be rendered as TOML.
    #[error("failed to serialize engine config: {source}")]
    Serialize {
        /// Underlying TOML error.
        source: toml::ser::Error,
    },
    /// A setting is out of range.
    #[error("engine setting '{field}' has invalid value '{value}'")]
    InvalidValue {
        /// Setting name.
        field: &'static str,
        /// Rejected value as written.
        value: String,
    },
}
