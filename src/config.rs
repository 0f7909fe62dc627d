//! Driver configuration
//!
//! YAML document describing cluster identity, snapshot limits, topology
//! categories, task polling, the static datastore/policy/node inventory used
//! in standalone mode, ledger storage and the storage-pool syncer.

use crate::domain::ports::DatastoreInfo;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default maximum number of snapshots per block volume
pub const DEFAULT_MAX_SNAPSHOTS_PER_BLOCK_VOLUME: u32 = 3;

/// Capacity used when a create request leaves it unset (1 GiB)
pub const DEFAULT_VOLUME_CAPACITY_BYTES: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Driver Configuration
// =============================================================================

/// Top-level driver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    pub global: GlobalConfig,
    /// Topology category names; empty disables topology-aware placement
    pub topology_categories: Vec<String>,
    pub task: TaskConfig,
    pub datastores: Vec<DatastoreInfo>,
    pub policies: Vec<PolicyConfig>,
    pub nodes: Vec<NodeConfig>,
    pub ledger: LedgerConfig,
    pub syncer: SyncerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub cluster_id: String,
    pub global_max_snapshots_per_block_volume: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            cluster_id: "kubernetes".to_string(),
            global_max_snapshots_per_block_volume: DEFAULT_MAX_SNAPSHOTS_PER_BLOCK_VOLUME,
        }
    }
}

/// Backend task submission and polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    pub submit_initial_interval_ms: u64,
    pub submit_max_interval_ms: u64,
    pub submit_max_elapsed_ms: u64,
    pub poll_initial_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub poll_timeout_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            submit_initial_interval_ms: 500,
            submit_max_interval_ms: 5_000,
            submit_max_elapsed_ms: 30_000,
            poll_initial_interval_ms: 250,
            poll_max_interval_ms: 5_000,
            poll_timeout_secs: 300,
        }
    }
}

impl TaskConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    pub name: String,
    pub id: String,
    /// Datastore URLs satisfying the policy; empty means all
    #[serde(default)]
    pub compatible_datastores: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub node_id: String,
    pub vm_uuid: String,
    #[serde(default)]
    pub topology: BTreeMap<String, String>,
}

/// Where operation records are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    File,
    Kubernetes,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// Record directory for the file backend
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncerConfig {
    pub enabled: bool,
    /// Delay before the supervisor relaunches a failed loop
    pub restart_cooldown_secs: u64,
    /// Number of full reconciles scheduled after a topology change
    pub reconcile_all_iterations: u32,
    pub reconcile_all_frequency_secs: u64,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_cooldown_secs: 60,
            reconcile_all_iterations: 5,
            reconcile_all_frequency_secs: 60,
        }
    }
}

impl DriverConfig {
    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: DriverConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.global.cluster_id.trim().is_empty() {
            return Err(Error::Configuration("global.clusterId must not be empty".into()));
        }
        if self.global.global_max_snapshots_per_block_volume == 0 {
            return Err(Error::Configuration(
                "global.globalMaxSnapshotsPerBlockVolume must be at least 1".into(),
            ));
        }
        if self.task.poll_initial_interval_ms == 0
            || self.task.poll_initial_interval_ms > self.task.poll_max_interval_ms
        {
            return Err(Error::Configuration(
                "task.pollInitialIntervalMs must be non-zero and not exceed pollMaxIntervalMs".into(),
            ));
        }
        if self.task.poll_timeout_secs == 0 {
            return Err(Error::Configuration("task.pollTimeoutSecs must be non-zero".into()));
        }

        let mut urls = HashSet::new();
        for datastore in &self.datastores {
            if !urls.insert(datastore.url.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate datastore url {}",
                    datastore.url
                )));
            }
        }

        let mut policies = HashSet::new();
        for policy in &self.policies {
            if !policies.insert(policy.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate storage policy {}",
                    policy.name
                )));
            }
        }

        let mut nodes = HashSet::new();
        for node in &self.nodes {
            if !nodes.insert(node.node_id.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate node {}",
                    node.node_id
                )));
            }
        }

        if self.ledger.backend == LedgerBackend::File && self.ledger.directory.is_none() {
            return Err(Error::Configuration(
                "ledger.directory is required for the file ledger backend".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.global.global_max_snapshots_per_block_volume, 3);
        assert_eq!(config.syncer.restart_cooldown_secs, 60);
        assert_eq!(config.syncer.reconcile_all_iterations, 5);
        assert_eq!(config.ledger.backend, LedgerBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let raw = r#"
global:
  clusterId: cluster-a
  globalMaxSnapshotsPerBlockVolume: 5
topologyCategories: ["k8s-zone"]
datastores:
  - name: vsanDatastore
    url: ds:///vmfs/volumes/vsan:1/
    capacityBytes: 1099511627776
    freeBytes: 549755813888
policies:
  - name: gold
    id: policy-gold
nodes:
  - nodeId: node-1
    vmUuid: 4201-aaaa
    topology:
      k8s-zone: zone-a
ledger:
  backend: file
  directory: /var/lib/csi/ledger
"#;
        let config = DriverConfig::from_yaml(raw).unwrap();
        assert_eq!(config.global.cluster_id, "cluster-a");
        assert_eq!(config.global.global_max_snapshots_per_block_volume, 5);
        assert_eq!(config.topology_categories, vec!["k8s-zone".to_string()]);
        assert_eq!(config.datastores.len(), 1);
        assert!(config.datastores[0].accessible_nodes.is_empty());
        assert_eq!(config.nodes[0].topology.get("k8s-zone").unwrap(), "zone-a");
        assert_eq!(config.ledger.backend, LedgerBackend::File);
        assert_eq!(config.task.poll_timeout_secs, 300);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = DriverConfig::default();
        config.global.global_max_snapshots_per_block_volume = 0;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = DriverConfig::default();
        config.ledger.backend = LedgerBackend::File;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = DriverConfig::default();
        config.policies = vec![
            PolicyConfig {
                name: "gold".into(),
                id: "p1".into(),
                compatible_datastores: Vec::new(),
            },
            PolicyConfig {
                name: "gold".into(),
                id: "p2".into(),
                compatible_datastores: Vec::new(),
            },
        ];
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        assert_matches!(
            DriverConfig::from_yaml("global: [not, a, map]"),
            Err(Error::YamlParse(_))
        );
    }
}
