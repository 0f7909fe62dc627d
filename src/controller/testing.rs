//! Controller fixture over the in-memory backend and static inventory

use super::{ControllerConfig, ControllerDeps, ControllerService};
use crate::backend::{InMemoryBackend, TaskClient, TaskClientConfig};
use crate::config::{NodeConfig, PolicyConfig};
use crate::domain::ports::DatastoreInfo;
use crate::domain::requests::*;
use crate::error::Result;
use crate::inventory::{NodeRegistry, StaticPolicyResolver, StaticTopology};
use crate::ledger::{
    MemoryOperationStore, OperationLedger, OperationRecord, OperationStatus, OperationStoreRef,
};
use crate::metrics::ControllerMetrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Datastore reachable from every node
pub const SHARED_DATASTORE: &str = "ds:///vmfs/volumes/vsanDatastore/";

/// Datastore reachable from node-1 only
pub const LOCAL_DATASTORE: &str = "ds:///vmfs/volumes/local-node-1/";

pub const ZONE_KEY: &str = "topology.csi.vmware.com/k8s-zone";

pub struct Harness {
    pub service: Arc<ControllerService>,
    pub backend: Arc<InMemoryBackend>,
    pub topology: Arc<StaticTopology>,
    pub nodes: Arc<NodeRegistry>,
    pub cancel: CancellationToken,
    config: ControllerConfig,
    policies: Arc<StaticPolicyResolver>,
}

fn fast_tasks() -> TaskClientConfig {
    TaskClientConfig {
        submit_initial_interval: Duration::from_millis(1),
        submit_max_interval: Duration::from_millis(5),
        submit_max_elapsed: Duration::from_millis(200),
        poll_initial_interval: Duration::from_millis(1),
        poll_max_interval: Duration::from_millis(5),
        poll_timeout: Duration::from_secs(5),
    }
}

fn datastores() -> Vec<DatastoreInfo> {
    vec![
        DatastoreInfo {
            name: "vsanDatastore".into(),
            url: SHARED_DATASTORE.into(),
            capacity_bytes: 1024 * GIB,
            free_bytes: 512 * GIB,
            accessible_nodes: Vec::new(),
            topology: BTreeMap::new(),
        },
        DatastoreInfo {
            name: "local-node-1".into(),
            url: LOCAL_DATASTORE.into(),
            capacity_bytes: 2048 * GIB,
            free_bytes: 2048 * GIB,
            accessible_nodes: vec!["node-1".into()],
            topology: BTreeMap::new(),
        },
    ]
}

fn policies() -> Vec<PolicyConfig> {
    vec![
        PolicyConfig {
            name: "vSAN Default Storage Policy".into(),
            id: "aa6d5a82-1c88-45da-85d3-3d74b91a5bad".into(),
            compatible_datastores: vec![SHARED_DATASTORE.into()],
        },
        PolicyConfig {
            name: "nfs-only".into(),
            id: "4d5f673c-536f-11e6-beb8-9e71128cae77".into(),
            compatible_datastores: vec!["ds:///vmfs/volumes/nfs-01/".into()],
        },
    ]
}

fn nodes() -> Vec<NodeConfig> {
    ["node-1", "node-2"]
        .iter()
        .enumerate()
        .map(|(i, node_id)| NodeConfig {
            node_id: node_id.to_string(),
            vm_uuid: format!("4204c4b5-0000-0000-0000-00000000000{}", i + 1),
            topology: BTreeMap::from([(ZONE_KEY.to_string(), "zone-a".to_string())]),
        })
        .collect()
}

impl Harness {
    pub fn new() -> Self {
        Self::build(ControllerConfig::default(), Arc::new(MemoryOperationStore::new()))
    }

    pub fn with_topology_categories() -> Self {
        let config = ControllerConfig {
            topology_categories: vec!["k8s-zone".into()],
            ..Default::default()
        };
        Self::build(config, Arc::new(MemoryOperationStore::new()))
    }

    pub fn with_store(store: OperationStoreRef) -> Self {
        Self::build(ControllerConfig::default(), store)
    }

    fn build(config: ControllerConfig, store: OperationStoreRef) -> Self {
        let nodes = nodes();
        let topology = Arc::new(StaticTopology::new(
            datastores(),
            nodes.iter().map(|n| (n.node_id.clone(), n.topology.clone())).collect(),
        ));
        let backend = Arc::new(InMemoryBackend::new());
        let registry = Arc::new(NodeRegistry::from_config(&nodes));
        let policies = Arc::new(StaticPolicyResolver::new(&policies()));

        let service = Self::service(&config, store, &backend, &topology, &policies, &registry);
        Self {
            service,
            backend,
            topology,
            nodes: registry,
            cancel: CancellationToken::new(),
            config,
            policies,
        }
    }

    fn service(
        config: &ControllerConfig,
        store: OperationStoreRef,
        backend: &Arc<InMemoryBackend>,
        topology: &Arc<StaticTopology>,
        policies: &Arc<StaticPolicyResolver>,
        nodes: &Arc<NodeRegistry>,
    ) -> Arc<ControllerService> {
        let deps = ControllerDeps {
            ledger: OperationLedger::new(store),
            tasks: Arc::new(TaskClient::new(backend.clone(), fast_tasks())),
            topology: topology.clone(),
            policies: policies.clone(),
            nodes: nodes.clone(),
            metrics: Arc::new(ControllerMetrics::new().unwrap()),
        };
        ControllerService::new(config.clone(), deps)
    }

    /// A fresh controller over `store`, sharing this backend and inventory
    pub fn restart_with_store(&self, store: OperationStoreRef) -> Harness {
        Harness {
            service: Self::service(
                &self.config,
                store,
                &self.backend,
                &self.topology,
                &self.policies,
                &self.nodes,
            ),
            backend: self.backend.clone(),
            topology: self.topology.clone(),
            nodes: self.nodes.clone(),
            cancel: CancellationToken::new(),
            config: self.config.clone(),
            policies: self.policies.clone(),
        }
    }

    pub fn zone_requirement(zone: &str) -> TopologyRequirement {
        TopologyRequirement {
            requisite: vec![Topology {
                segments: BTreeMap::from([(ZONE_KEY.to_string(), zone.to_string())]),
            }],
            preferred: Vec::new(),
        }
    }

    pub fn create_request(&self, name: &str, bytes: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_range: Some(CapacityRange::required(bytes)),
            volume_capabilities: vec![VolumeCapability::single_writer_mount()],
            ..Default::default()
        }
    }

    pub async fn create_volume(&self, name: &str, bytes: u64) -> Result<CreateVolumeResponse> {
        self.service
            .create_volume(self.create_request(name, bytes), &self.cancel)
            .await
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let request = DeleteVolumeRequest {
            volume_id: volume_id.into(),
        };
        self.service.delete_volume(request, &self.cancel).await
    }

    pub async fn expand_volume(&self, volume_id: &str, bytes: u64) -> Result<ControllerExpandVolumeResponse> {
        let request = ControllerExpandVolumeRequest {
            volume_id: volume_id.into(),
            capacity_range: Some(CapacityRange::required(bytes)),
            volume_capability: None,
        };
        self.service.controller_expand_volume(request, &self.cancel).await
    }

    pub async fn publish(&self, volume_id: &str, node_id: &str) -> Result<ControllerPublishVolumeResponse> {
        let request = ControllerPublishVolumeRequest {
            volume_id: volume_id.into(),
            node_id: node_id.into(),
            volume_capability: Some(VolumeCapability::single_writer_mount()),
            ..Default::default()
        };
        self.service.controller_publish_volume(request, &self.cancel).await
    }

    pub async fn unpublish(&self, volume_id: &str, node_id: &str) -> Result<()> {
        let request = ControllerUnpublishVolumeRequest {
            volume_id: volume_id.into(),
            node_id: node_id.into(),
        };
        self.service.controller_unpublish_volume(request, &self.cancel).await
    }

    pub async fn create_snapshot(&self, name: &str, volume_id: &str) -> Result<CreateSnapshotResponse> {
        let request = CreateSnapshotRequest {
            source_volume_id: volume_id.into(),
            name: name.into(),
            ..Default::default()
        };
        self.service.create_snapshot(request, &self.cancel).await
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let request = DeleteSnapshotRequest {
            snapshot_id: snapshot_id.into(),
        };
        self.service.delete_snapshot(request, &self.cancel).await
    }

    pub async fn record(&self, instance_name: &str) -> Option<OperationRecord> {
        self.service.operation(instance_name).await.unwrap()
    }

    /// Poll the ledger until `instance_name` reaches `status`
    pub async fn wait_for_status(&self, instance_name: &str, status: OperationStatus) {
        for _ in 0..500 {
            if self.record(instance_name).await.map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("{} never reached {:?}", instance_name, status);
    }
}
