//! Domain Ports - Core trait definitions for the volume controller
//!
//! These traits define the boundaries between the lifecycle controllers and
//! external systems: the task-based storage backend, datastore topology,
//! storage policy management and node identity resolution.

use crate::domain::requests::TopologyRequirement;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Operation Kinds
// =============================================================================

/// Kind of backend mutation tracked in the operation ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    CreateVolume,
    DeleteVolume,
    ExpandVolume,
    AttachVolume,
    DetachVolume,
    CreateSnapshot,
    DeleteSnapshot,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateVolume => "create-volume",
            OperationKind::DeleteVolume => "delete-volume",
            OperationKind::ExpandVolume => "expand-volume",
            OperationKind::AttachVolume => "attach-volume",
            OperationKind::DetachVolume => "detach-volume",
            OperationKind::CreateSnapshot => "create-snapshot",
            OperationKind::DeleteSnapshot => "delete-snapshot",
        }
    }

    /// Creates are the only kinds whose `Success` record is replayed as the answer
    pub fn is_create(&self) -> bool {
        matches!(self, OperationKind::CreateVolume | OperationKind::CreateSnapshot)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Backend Entities
// =============================================================================

/// Backend handle of the virtual machine backing a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmHandle {
    /// Instance UUID of the VM
    pub vm_uuid: String,
    /// Cluster node the VM backs
    pub node_name: String,
}

impl std::fmt::Display for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.node_name, self.vm_uuid)
    }
}

/// Block volume as held by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendVolume {
    pub volume_id: String,
    pub name: String,
    pub capacity_bytes: u64,
    pub policy_id: Option<String>,
    pub datastore_url: String,
    /// Disk identifier reported to the node after attach
    pub disk_uuid: String,
    pub attached_to: Option<VmHandle>,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time snapshot as held by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    pub volume_id: String,
    pub snapshot_id: String,
    /// Snapshot name supplied at creation
    pub description: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub ready: bool,
}

/// Filter for snapshot queries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub volume_id: Option<String>,
    pub snapshot_id: Option<String>,
}

impl SnapshotFilter {
    pub fn for_volume(volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: Some(volume_id.into()),
            snapshot_id: None,
        }
    }

    pub fn matches(&self, snapshot: &BackendSnapshot) -> bool {
        self.volume_id
            .as_deref()
            .map_or(true, |v| v == snapshot.volume_id)
            && self
                .snapshot_id
                .as_deref()
                .map_or(true, |s| s == snapshot.snapshot_id)
    }
}

// =============================================================================
// Backend Tasks
// =============================================================================

/// Opaque handle of an asynchronous backend task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the snapshot a volume is restored from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    pub volume_id: String,
    pub snapshot_id: String,
}

/// Parameters of a volume creation task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCreateSpec {
    pub name: String,
    pub cluster_id: String,
    pub capacity_bytes: u64,
    pub policy_id: Option<String>,
    pub datastore_url: String,
    pub source: Option<SnapshotSource>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Mutation submitted to the backend as an asynchronous task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskRequest {
    CreateVolume(VolumeCreateSpec),
    DeleteVolume { volume_id: String },
    ExpandVolume { volume_id: String, capacity_bytes: u64 },
    AttachVolume { volume_id: String, vm: VmHandle },
    DetachVolume { volume_id: String, vm: VmHandle },
    CreateSnapshot { volume_id: String, description: String },
    DeleteSnapshot { volume_id: String, snapshot_id: String },
}

impl TaskRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            TaskRequest::CreateVolume(_) => OperationKind::CreateVolume,
            TaskRequest::DeleteVolume { .. } => OperationKind::DeleteVolume,
            TaskRequest::ExpandVolume { .. } => OperationKind::ExpandVolume,
            TaskRequest::AttachVolume { .. } => OperationKind::AttachVolume,
            TaskRequest::DetachVolume { .. } => OperationKind::DetachVolume,
            TaskRequest::CreateSnapshot { .. } => OperationKind::CreateSnapshot,
            TaskRequest::DeleteSnapshot { .. } => OperationKind::DeleteSnapshot,
        }
    }
}

/// Result payload of a successful task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskOutcome {
    Volume(BackendVolume),
    Expanded { capacity_bytes: u64 },
    Attached { disk_uuid: String },
    Detached,
    Deleted,
    Snapshot(BackendSnapshot),
}

/// Classification of a backend task failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FaultKind {
    /// Parameters rejected by the backend
    InvalidArgument,
    /// Subject of the task does not exist
    NotFound,
    /// Subject is in use (snapshots present, attached elsewhere)
    ResourceInUse,
    /// Snapshot exists on the backend but post-processing failed
    PostProcessingFailed { snapshot_id: String },
    Other,
}

/// Failure cause reported by a finished task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFault {
    pub kind: FaultKind,
    pub message: String,
}

impl BackendFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BackendFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// State of a task as reported by a single poll
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    Succeeded(TaskOutcome),
    Failed(BackendFault),
    /// Unknown task handle: either lost with an expired session or stale
    NotFound,
}

// =============================================================================
// Backend Task Port
// =============================================================================

/// Port for the asynchronous, task-based storage backend
#[async_trait]
pub trait BackendTaskClient: Send + Sync {
    /// Submit a mutation; the backend runs it asynchronously
    async fn submit(&self, request: TaskRequest) -> Result<TaskId>;

    /// Report the current state of a task
    async fn poll(&self, task_id: &TaskId) -> Result<TaskState>;

    /// Look up a volume by ID
    async fn query_volume(&self, volume_id: &str) -> Result<Option<BackendVolume>>;

    /// Look up a volume by the name it was created with
    async fn find_volume_by_name(&self, name: &str) -> Result<Option<BackendVolume>>;

    /// List snapshots matching a filter
    async fn query_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<BackendSnapshot>>;

    /// Check backend connectivity
    async fn health_check(&self) -> Result<bool>;

    /// Backend name for logging and errors
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Collaborator Ports
// =============================================================================

/// Datastore known to the topology provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreInfo {
    pub name: String,
    pub url: String,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    /// Nodes that can reach this datastore; empty means every node
    #[serde(default)]
    pub accessible_nodes: Vec<String>,
    /// Topology segments of the datastore's location
    #[serde(default)]
    pub topology: BTreeMap<String, String>,
}

/// Port for datastore and topology selection
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Shared datastores satisfying the placement constraints, best first
    async fn get_shared_candidates(
        &self,
        requirement: Option<&TopologyRequirement>,
    ) -> Result<Vec<DatastoreInfo>>;

    /// Every datastore currently known
    async fn list_datastores(&self) -> Result<Vec<DatastoreInfo>>;
}

/// Port for storage-policy management
#[async_trait]
pub trait PolicyResolver: Send + Sync {
    /// Resolve a policy name to its ID
    async fn resolve_policy_id(&self, name: &str) -> Result<String>;

    /// Check whether a datastore can satisfy a policy
    async fn check_compatibility(&self, policy_id: &str, datastore: &DatastoreInfo) -> Result<bool>;
}

/// Port for node identity resolution
#[async_trait]
pub trait NodeResolver: Send + Sync {
    /// Map a cluster node ID to its backend VM; `None` when the VM is gone
    async fn resolve_node(&self, node_id: &str) -> Result<Option<VmHandle>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type BackendTaskClientRef = Arc<dyn BackendTaskClient>;
pub type TopologyProviderRef = Arc<dyn TopologyProvider>;
pub type PolicyResolverRef = Arc<dyn PolicyResolver>;
pub type NodeResolverRef = Arc<dyn NodeResolver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_kind_display() {
        assert_eq!(OperationKind::CreateSnapshot.to_string(), "create-snapshot");
        assert_eq!(OperationKind::ExpandVolume.to_string(), "expand-volume");
        assert!(OperationKind::CreateVolume.is_create());
        assert!(!OperationKind::DeleteSnapshot.is_create());
    }

    #[test]
    fn test_task_request_kind() {
        let request = TaskRequest::DeleteSnapshot {
            volume_id: "vol-1".into(),
            snapshot_id: "snap-1".into(),
        };
        assert_eq!(request.kind(), OperationKind::DeleteSnapshot);
    }

    #[test]
    fn test_snapshot_filter() {
        let snapshot = BackendSnapshot {
            volume_id: "vol-1".into(),
            snapshot_id: "snap-1".into(),
            description: "daily".into(),
            size_bytes: 1024,
            created_at: Utc::now(),
            ready: true,
        };

        assert!(SnapshotFilter::default().matches(&snapshot));
        assert!(SnapshotFilter::for_volume("vol-1").matches(&snapshot));
        assert!(!SnapshotFilter::for_volume("vol-2").matches(&snapshot));

        let by_id = SnapshotFilter {
            volume_id: None,
            snapshot_id: Some("snap-2".into()),
        };
        assert!(!by_id.matches(&snapshot));
    }
}
