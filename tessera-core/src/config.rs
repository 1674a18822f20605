//! Cluster configuration
//!
//! Supports loading from TOML files with environment overrides. The loaded
//! configuration is validated once and then shared immutably by every
//! component.

use crate::codec::{CodecKind, SecretSharing};
use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete cluster configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Agreement protocol settings
    #[serde(default)]
    pub agreement: AgreementSettings,

    /// Participating replicas, in primary rotation order
    #[serde(default)]
    pub replicas: Vec<ReplicaSettings>,

    /// Secret sharing and storage node settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Timeouts for fragment I/O
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

/// Byzantine agreement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgreementSettings {
    /// Number of tolerated faulty replicas (f)
    #[serde(default = "default_faulty")]
    pub faulty: usize,

    /// Executed sequences between checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Sequence numbers accepted above the stable checkpoint
    #[serde(default = "default_log_window")]
    pub log_window: u64,

    /// Evidence count at which a replica is reported as suspect
    #[serde(default = "default_suspicion_threshold")]
    pub suspicion_threshold: u32,

    /// How long a client waits for a committed result
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for AgreementSettings {
    fn default() -> Self {
        Self {
            faulty: default_faulty(),
            checkpoint_interval: default_checkpoint_interval(),
            log_window: default_log_window(),
            suspicion_threshold: default_suspicion_threshold(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// One agreement replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSettings {
    pub id: u32,

    /// Network address (informational for the in-process transport)
    pub address: String,

    /// Hex-encoded ed25519 verifying key; generated at startup when absent
    #[serde(default)]
    pub public_key: Option<String>,

    /// Storage node this replica serves
    pub storage_node: String,
}

/// Fragment store backing a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sled,
}

/// One storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub backend: BackendKind,

    /// Data directory for persistent backends
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Secret sharing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub codec: CodecKind,

    /// Reconstruction threshold (K)
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    #[serde(default)]
    pub nodes: Vec<NodeSettings>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            codec: CodecKind::default(),
            threshold: default_threshold(),
            nodes: Vec::new(),
        }
    }
}

/// Timeouts for fragment I/O, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,

    #[serde(default = "default_node_timeout_ms")]
    pub node_ms: u64,

    #[serde(default = "default_quorum_timeout_ms")]
    pub quorum_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout_ms(),
            node_ms: default_node_timeout_ms(),
            quorum_ms: default_quorum_timeout_ms(),
        }
    }
}

impl TimeoutSettings {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn node(&self) -> Duration {
        Duration::from_millis(self.node_ms)
    }

    pub fn quorum(&self) -> Duration {
        Duration::from_millis(self.quorum_ms)
    }
}

fn default_faulty() -> usize {
    1
}

fn default_checkpoint_interval() -> u64 {
    16
}

fn default_log_window() -> u64 {
    256
}

fn default_suspicion_threshold() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_threshold() -> usize {
    3
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_node_timeout_ms() -> u64 {
    2_000
}

fn default_quorum_timeout_ms() -> u64 {
    5_000
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClusterConfig = toml::from_str(content)
            .map_err(|e| TesseraError::Configuration(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// An all-in-memory cluster: `replicas` replicas, each serving one
    /// storage node, with `faulty` tolerated faults and threshold `threshold`
    pub fn local(replicas: usize, faulty: usize, threshold: usize) -> Self {
        let nodes: Vec<NodeSettings> = (0..replicas)
            .map(|i| NodeSettings {
                id: format!("node-{i}"),
                address: format!("memory://node-{i}"),
                backend: BackendKind::Memory,
                data_dir: None,
            })
            .collect();
        let replicas = (0..replicas)
            .map(|i| ReplicaSettings {
                id: i as u32,
                address: format!("127.0.0.1:{}", 7100 + i),
                public_key: None,
                storage_node: format!("node-{i}"),
            })
            .collect();

        Self {
            agreement: AgreementSettings {
                faulty,
                ..Default::default()
            },
            replicas,
            storage: StorageSettings {
                codec: CodecKind::Threshold,
                threshold,
                nodes,
            },
            timeouts: TimeoutSettings::default(),
        }
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(k) = std::env::var("TESSERA_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.storage.threshold = k;
        }
        if let Some(ms) = std::env::var("TESSERA_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.agreement.request_timeout_ms = ms;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let n = self.replicas.len();
        let f = self.agreement.faulty;
        if n > 0 && n < 3 * f + 1 {
            return Err(TesseraError::Configuration(format!(
                "{n} replicas cannot tolerate {f} faults (need at least {})",
                3 * f + 1
            )));
        }

        let mut ids: Vec<u32> = self.replicas.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != n {
            return Err(TesseraError::Configuration(
                "replica ids must be unique".to_string(),
            ));
        }

        let mut node_ids: Vec<&str> = self.storage.nodes.iter().map(|n| n.id.as_str()).collect();
        node_ids.sort_unstable();
        node_ids.dedup();
        if node_ids.len() != self.storage.nodes.len() {
            return Err(TesseraError::Configuration(
                "storage node ids must be unique".to_string(),
            ));
        }

        for replica in &self.replicas {
            if !node_ids.contains(&replica.storage_node.as_str()) {
                return Err(TesseraError::Configuration(format!(
                    "replica {} serves unknown storage node {}",
                    replica.id, replica.storage_node
                )));
            }
        }

        let total = self.storage.nodes.len();
        let k = self.storage.threshold;
        if k == 0 || (total > 0 && k > total) {
            return Err(TesseraError::Configuration(format!(
                "threshold {k} must be within 1..={total}"
            )));
        }

        for node in &self.storage.nodes {
            if node.backend == BackendKind::Sled && node.data_dir.is_none() {
                return Err(TesseraError::Configuration(format!(
                    "sled node {} needs a data_dir",
                    node.id
                )));
            }
        }

        if self.agreement.checkpoint_interval == 0
            || self.agreement.log_window < self.agreement.checkpoint_interval
        {
            return Err(TesseraError::Configuration(
                "log_window must be at least one non-zero checkpoint_interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Agreement quorum size (2f+1)
    pub fn quorum(&self) -> usize {
        2 * self.agreement.faulty + 1
    }

    /// Build the configured codec
    pub fn codec(&self) -> Result<SecretSharing> {
        SecretSharing::new(self.storage.codec, self.storage.threshold)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.agreement.request_timeout_ms)
    }
}
