//! Volume & Snapshot Lifecycle Controllers
//!
//! Every mutating verb follows the same ledger-driven state machine:
//!
//! ```text
//!   request ──▶ instance name ──▶ acquire ledger entry
//!                                      │
//!         ┌────────────────────────────┼─────────────────────────────┐
//!         ▼                            ▼                             ▼
//!   terminal record              InProgress record               no record / Failed
//!   replay cached result         resume polling task             guards ─▶ submit ─▶
//!                                                                persist InProgress ─▶ poll
//!                                      │                             │
//!                                      └──────────▶ persist terminal ◀┘
//! ```
//!
//! A task the backend no longer knows is reconciled against observed backend
//! state: creates must find their subject or fail, deletes converge toward
//! absence.

pub mod guards;
pub mod pagination;
mod snapshot;
mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use snapshot::SnapshotController;
pub use volume::VolumeController;

use crate::backend::{TaskClient, TaskCompletion};
use crate::config::{DriverConfig, DEFAULT_MAX_SNAPSHOTS_PER_BLOCK_VOLUME, DEFAULT_VOLUME_CAPACITY_BYTES};
use crate::domain::ports::{
    BackendFault, BackendTaskClientRef, FaultKind, NodeResolverRef, OperationKind,
    PolicyResolverRef, TaskId, TaskRequest, TopologyProviderRef,
};
use crate::domain::requests::*;
use crate::error::{Error, Result};
use crate::ledger::{LedgerEntry, OperationLedger, OperationRecord, OperationStatus};
use crate::metrics::ControllerMetrics;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

// =============================================================================
// Configuration & Dependencies
// =============================================================================

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub cluster_id: String,
    pub max_snapshots_per_volume: u32,
    /// Topology categories; placement constraints are rejected without any
    pub topology_categories: Vec<String>,
    pub default_capacity_bytes: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_id: "kubernetes".to_string(),
            max_snapshots_per_volume: DEFAULT_MAX_SNAPSHOTS_PER_BLOCK_VOLUME,
            topology_categories: Vec::new(),
            default_capacity_bytes: DEFAULT_VOLUME_CAPACITY_BYTES,
        }
    }
}

impl From<&DriverConfig> for ControllerConfig {
    fn from(config: &DriverConfig) -> Self {
        Self {
            cluster_id: config.global.cluster_id.clone(),
            max_snapshots_per_volume: config.global.global_max_snapshots_per_block_volume,
            topology_categories: config.topology_categories.clone(),
            default_capacity_bytes: DEFAULT_VOLUME_CAPACITY_BYTES,
        }
    }
}

/// Injected collaborators
#[derive(Clone)]
pub struct ControllerDeps {
    pub ledger: Arc<OperationLedger>,
    pub tasks: Arc<TaskClient>,
    pub topology: TopologyProviderRef,
    pub policies: PolicyResolverRef,
    pub nodes: NodeResolverRef,
    pub metrics: Arc<ControllerMetrics>,
}

/// State shared by the volume and snapshot controllers
pub(crate) struct ControllerContext {
    pub config: ControllerConfig,
    pub deps: ControllerDeps,
}

impl ControllerContext {
    pub fn ledger(&self) -> &OperationLedger {
        &self.deps.ledger
    }

    pub fn backend(&self) -> &BackendTaskClientRef {
        self.deps.tasks.backend()
    }

    /// Submit a task and persist it as in flight before polling
    ///
    /// A submission that fails after retries leaves a `Failed` record so the
    /// next duplicate starts clean.
    pub async fn run_task(
        &self,
        entry: &LedgerEntry,
        record: &mut OperationRecord,
        request: TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskCompletion> {
        let task_id = self.submit_task(entry, record, request).await?;
        self.deps.tasks.wait(&task_id, cancel).await
    }

    /// Submit a task and persist the `InProgress` record carrying its ID
    pub async fn submit_task(
        &self,
        entry: &LedgerEntry,
        record: &mut OperationRecord,
        request: TaskRequest,
    ) -> Result<TaskId> {
        let task_id = match self.deps.tasks.submit(request).await {
            Ok(task_id) => task_id,
            Err(e) => {
                record.fail(e.to_string());
                entry.save(record).await?;
                return Err(e);
            }
        };

        record.begin(&task_id);
        entry.save(record).await?;
        Ok(task_id)
    }

    pub async fn wait_task(&self, task_id: &TaskId, cancel: &CancellationToken) -> Result<TaskCompletion> {
        self.deps.tasks.wait(task_id, cancel).await
    }

    /// Resume polling the task of an `InProgress` record
    pub async fn resume_task(
        &self,
        record: &OperationRecord,
        cancel: &CancellationToken,
    ) -> Result<TaskCompletion> {
        self.deps.metrics.record_resume(record.kind.as_str());
        match record.task() {
            Some(task_id) => self.deps.tasks.wait(&task_id, cancel).await,
            None => Ok(TaskCompletion::Lost),
        }
    }

    /// Note a lost task before reconciling it
    pub fn lost_task(&self, record: &OperationRecord) {
        warn!(
            "Task {} of {} is unknown to the backend; reconciling against backend state",
            record.task_id, record.instance_name
        );
        self.deps.metrics.record_lost_task(record.kind.as_str());
    }

    /// Persist a terminal failure and build the matching error
    pub async fn fail(
        &self,
        entry: &LedgerEntry,
        record: &mut OperationRecord,
        error: Error,
    ) -> Result<Error> {
        error!("{} failed: {}", record.instance_name, error);
        record.fail(error.to_string());
        entry.save(record).await?;
        Ok(error)
    }
}

/// Start a record for a fresh attempt, keeping history of a failed one
pub(crate) fn fresh_record(
    previous: Option<OperationRecord>,
    instance_name: &str,
    kind: OperationKind,
) -> OperationRecord {
    let mut record = OperationRecord::new(instance_name, kind);
    if let Some(previous) = previous.filter(|p| p.status == OperationStatus::Failed) {
        record.created_at = previous.created_at;
        record.attempts = previous.attempts;
    }
    record
}

/// Refuse a ledger record written for a different volume
pub(crate) fn check_subject(record: &OperationRecord, volume_id: &str) -> Result<()> {
    match record.volume_id.as_deref() {
        Some(recorded) if recorded != volume_id => Err(Error::AlreadyExists(format!(
            "operation {} is recorded for volume {}, not {}",
            record.instance_name, recorded, volume_id
        ))),
        _ => Ok(()),
    }
}

/// Map a task fault onto a status error
pub(crate) fn fault_error(operation: &str, subject: &str, fault: &BackendFault) -> Error {
    let message = format!("{} failed for {}: {}", operation, subject, fault.message);
    match fault.kind {
        FaultKind::InvalidArgument => Error::InvalidArgument(message),
        FaultKind::NotFound => Error::NotFound(message),
        FaultKind::ResourceInUse => Error::FailedPrecondition(message),
        FaultKind::PostProcessingFailed { .. } | FaultKind::Other => Error::Internal(message),
    }
}

pub(crate) fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{} must be provided", what)));
    }
    Ok(())
}

// =============================================================================
// Controller Service
// =============================================================================

/// The controller verbs, instrumented
pub struct ControllerService {
    context: Arc<ControllerContext>,
    volumes: VolumeController,
    snapshots: SnapshotController,
}

impl ControllerService {
    pub fn new(config: ControllerConfig, deps: ControllerDeps) -> Arc<Self> {
        let context = Arc::new(ControllerContext { config, deps });
        Arc::new(Self {
            volumes: VolumeController::new(context.clone()),
            snapshots: SnapshotController::new(context.clone()),
            context,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.context.config
    }

    pub fn ledger(&self) -> &Arc<OperationLedger> {
        &self.context.deps.ledger
    }

    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.context.deps.metrics
    }

    /// Backend reachability, for readiness probes
    pub async fn backend_ready(&self) -> bool {
        self.context.backend().health_check().await.unwrap_or(false)
    }

    async fn observe<T>(&self, operation: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let _timer = self.context.deps.metrics.start_timer(operation);
        let result = call.await;
        self.context.deps.metrics.record(operation, &result);
        result
    }

    pub async fn create_volume(
        &self,
        request: CreateVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateVolumeResponse> {
        self.observe("CreateVolume", self.volumes.create_volume(request, cancel))
            .await
    }

    pub async fn delete_volume(
        &self,
        request: DeleteVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.observe("DeleteVolume", self.volumes.delete_volume(request, cancel))
            .await
    }

    pub async fn controller_expand_volume(
        &self,
        request: ControllerExpandVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<ControllerExpandVolumeResponse> {
        self.observe("ControllerExpandVolume", self.volumes.expand_volume(request, cancel))
            .await
    }

    pub async fn controller_publish_volume(
        &self,
        request: ControllerPublishVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<ControllerPublishVolumeResponse> {
        self.observe("ControllerPublishVolume", self.volumes.publish_volume(request, cancel))
            .await
    }

    pub async fn controller_unpublish_volume(
        &self,
        request: ControllerUnpublishVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.observe(
            "ControllerUnpublishVolume",
            self.volumes.unpublish_volume(request, cancel),
        )
        .await
    }

    pub async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateSnapshotResponse> {
        self.observe("CreateSnapshot", self.snapshots.create_snapshot(request, cancel))
            .await
    }

    pub async fn delete_snapshot(
        &self,
        request: DeleteSnapshotRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.observe("DeleteSnapshot", self.snapshots.delete_snapshot(request, cancel))
            .await
    }

    pub async fn list_snapshots(&self, request: ListSnapshotsRequest) -> Result<ListSnapshotsResponse> {
        self.observe("ListSnapshots", self.snapshots.list_snapshots(request))
            .await
    }

    /// Ledger record for an instance name
    pub async fn operation(&self, instance_name: &str) -> Result<Option<OperationRecord>> {
        self.context.ledger().get(instance_name).await
    }
}
