//! Node configuration with layered loading.
//!
//! Sources, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. `conclave.toml` in the base directory
//! 3. Environment variables (`CONCLAVE_*`)

use std::path::{Path, PathBuf};

use conclave_consensus::MonitorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to assemble configuration: {0}")]
    Merge(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Hash store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashStoreKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HashStoreConfig {
    pub kind: HashStoreKind,
}

/// Full node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Base directory; node data lives under `data/nodes/<name>/`.
    pub base_dir: PathBuf,

    /// Primary storage backend selector. `None` selects the built-in
    /// Merkle-committed ledger.
    pub primary_storage: Option<String>,

    /// Secondary storage backend selector. `None` selects the built-in
    /// in-memory reply store.
    pub secondary_storage: Option<String>,

    pub hash_store: HashStoreConfig,

    pub monitor: MonitorConfig,

    /// Seconds between master-performance checks.
    pub perf_check_freq_secs: u64,

    /// Seconds the key-sharing window stays open before reverting.
    pub key_sharing_timeout_secs: u64,

    /// Seconds `stop` waits for in-flight reads to drain.
    pub stop_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".conclave"),
            primary_storage: None,
            secondary_storage: None,
            hash_store: HashStoreConfig::default(),
            monitor: MonitorConfig::default(),
            perf_check_freq_secs: 10,
            key_sharing_timeout_secs: 60,
            stop_timeout_secs: 5,
        }
    }
}

impl NodeConfig {
    /// An in-memory configuration rooted at `base_dir`, as used by tests
    /// and ephemeral deployments.
    pub fn ephemeral(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            hash_store: HashStoreConfig {
                kind: HashStoreKind::Memory,
            },
            ..Self::default()
        }
    }

    /// Loads configuration for a base directory, merging the defaults,
    /// `conclave.toml` (if present) and `CONCLAVE_*` environment
    /// variables.
    pub fn load_from_dir(base_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = base_dir.as_ref();
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&NodeConfig {
                base_dir: dir.to_path_buf(),
                ..NodeConfig::default()
            })?);

        let file = dir.join("conclave.toml");
        if file.exists() {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONCLAVE")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        let cfg: NodeConfig = merged.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.perf_check_freq_secs == 0 {
            return Err(ConfigError::Validation(
                "perf_check_freq_secs must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.monitor.delta) {
            return Err(ConfigError::Validation(format!(
                "monitor.delta must be within [0, 1], got {}",
                self.monitor.delta
            )));
        }
        Ok(())
    }

    /// Data directory of one node: `<base_dir>/data/nodes/<name>`.
    pub fn data_dir(&self, node_name: &str) -> PathBuf {
        self.base_dir.join("data").join("nodes").join(node_name)
    }

    /// Directory holding long-term transport keys.
    pub fn keep_dir(&self, node_name: &str) -> PathBuf {
        self.base_dir.join("keep").join(node_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.perf_check_freq_secs, 10);
        assert_eq!(cfg.key_sharing_timeout_secs, 60);
        assert_eq!(cfg.stop_timeout_secs, 5);
        assert_eq!(cfg.hash_store.kind, HashStoreKind::File);
        assert!((cfg.monitor.delta - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn loads_defaults_from_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NodeConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(cfg.base_dir, dir.path());
        assert_eq!(cfg.perf_check_freq_secs, 10);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("conclave.toml"),
            r#"
perf_check_freq_secs = 3

[hash_store]
kind = "memory"

[monitor]
delta = 0.5
lambda_secs = 30.0
omega = 7
"#,
        )
        .unwrap();

        let cfg = NodeConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(cfg.perf_check_freq_secs, 3);
        assert_eq!(cfg.hash_store.kind, HashStoreKind::Memory);
        assert!((cfg.monitor.delta - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.monitor.omega, 7);
    }

    #[test]
    fn invalid_delta_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("conclave.toml"),
            "[monitor]\ndelta = 1.5\n",
        )
        .unwrap();
        assert!(matches!(
            NodeConfig::load_from_dir(dir.path()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn data_dir_layout() {
        let cfg = NodeConfig::default();
        assert_eq!(
            cfg.data_dir("Alpha"),
            PathBuf::from(".conclave/data/nodes/Alpha")
        );
    }
}
