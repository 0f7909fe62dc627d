//! Snapshot Lifecycle Controller
//!
//! Snapshot creation is the one path where the backend can succeed while the
//! driver's own post-processing fails. Such records are kept as
//! `PartiallyFailed` and answered with a fixed error until an operator
//! intervenes; they are never retried as a fresh create.

use super::guards::check_snapshot_quota;
use super::pagination::paginate;
use super::{check_subject, fault_error, fresh_record, require, ControllerContext};
use crate::backend::TaskCompletion;
use crate::domain::ports::{
    BackendSnapshot, FaultKind, OperationKind, SnapshotFilter, TaskId, TaskOutcome, TaskRequest,
};
use crate::domain::requests::*;
use crate::error::{Error, Result};
use crate::ledger::{instance, LedgerEntry, OperationRecord, OperationStatus};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// CreateSnapshot, DeleteSnapshot and ListSnapshots
pub struct SnapshotController {
    context: Arc<ControllerContext>,
}

fn post_processing_error(name: &str, snapshot_id: &str, volume_id: &str) -> Error {
    Error::Internal(format!(
        "Snapshot with name \"{}\" and id \"{}\" on volume \"{}\" is created on the backend, but post-processing failed.",
        name, snapshot_id, volume_id
    ))
}

fn to_csi_snapshot(snapshot: &BackendSnapshot) -> Snapshot {
    Snapshot {
        size_bytes: snapshot.size_bytes,
        snapshot_id: SnapshotHandle::new(&snapshot.volume_id, &snapshot.snapshot_id).to_string(),
        source_volume_id: snapshot.volume_id.clone(),
        creation_time: snapshot.created_at,
        ready_to_use: snapshot.ready,
    }
}

impl SnapshotController {
    pub(crate) fn new(context: Arc<ControllerContext>) -> Self {
        Self { context }
    }

    // =========================================================================
    // CreateSnapshot
    // =========================================================================

    pub async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateSnapshotResponse> {
        require(&request.name, "snapshot name")?;
        require(&request.source_volume_id, "source volume ID")?;
        let name = request.name;
        let volume_id = request.source_volume_id;

        let instance_name = instance::create_snapshot(&name, &volume_id);
        let entry = self.context.ledger().acquire(&instance_name).await;

        let previous = entry.load().await?;
        if let Some(record) = &previous {
            check_subject(record, &volume_id)?;
        }

        let (mut record, completion) = match previous {
            Some(record) if record.status == OperationStatus::Success => {
                self.context.deps.metrics.record_replay(OperationKind::CreateSnapshot.as_str());
                debug!("Replaying CreateSnapshot {}", instance_name);
                return snapshot_response(&record);
            }
            Some(record) if record.status == OperationStatus::PartiallyFailed => {
                return Err(post_processing_error(
                    &name,
                    record.snapshot_id.as_deref().unwrap_or_default(),
                    &volume_id,
                ));
            }
            Some(record) if record.status == OperationStatus::InProgress => {
                info!("Resuming CreateSnapshot {} on task {}", instance_name, record.task_id);
                let completion = self.context.resume_task(&record, cancel).await?;
                (record, completion)
            }
            previous => {
                let mut record = fresh_record(previous, &instance_name, OperationKind::CreateSnapshot)
                    .with_volume(&volume_id);
                let task_id = self.admit_and_submit(&entry, &mut record, &name, &volume_id).await?;
                let completion = self.context.wait_task(&task_id, cancel).await?;
                (record, completion)
            }
        };

        let snapshot = match completion {
            TaskCompletion::Succeeded(TaskOutcome::Snapshot(snapshot)) => snapshot,
            TaskCompletion::Succeeded(outcome) => {
                let error = Error::Internal(format!(
                    "CreateSnapshot {} on volume {}: unexpected outcome {:?}",
                    name, volume_id, outcome
                ));
                return Err(self.context.fail(&entry, &mut record, error).await?);
            }
            TaskCompletion::Failed(fault) => {
                if let FaultKind::PostProcessingFailed { snapshot_id } = &fault.kind {
                    warn!(
                        "Snapshot {} of volume {} created as {} but post-processing failed: {}",
                        name, volume_id, snapshot_id, fault.message
                    );
                    record.snapshot_id = Some(snapshot_id.clone());
                    record.partially_fail(fault.message.clone());
                    entry.save(&record).await?;
                    return Err(post_processing_error(&name, snapshot_id, &volume_id));
                }
                let error = fault_error("CreateSnapshot", &instance_name, &fault);
                return Err(self.context.fail(&entry, &mut record, error).await?);
            }
            TaskCompletion::Lost => {
                self.context.lost_task(&record);
                match self.find_by_name(&volume_id, &name).await? {
                    Some(snapshot) => snapshot,
                    None => {
                        let error = Error::Internal(format!(
                            "CreateSnapshot {} on volume {}: task {} was lost and no such snapshot exists",
                            name, volume_id, record.task_id
                        ));
                        return Err(self.context.fail(&entry, &mut record, error).await?);
                    }
                }
            }
        };

        self.complete_create(&entry, &mut record, &snapshot).await?;
        snapshot_response(&record)
    }

    /// Run the quota guard and submit under the volume's quota lock
    ///
    /// The lock is held until the `InProgress` record is saved, so concurrent
    /// creates under other names see this one in their count.
    async fn admit_and_submit(
        &self,
        entry: &LedgerEntry,
        record: &mut OperationRecord,
        name: &str,
        volume_id: &str,
    ) -> Result<TaskId> {
        let ledger = self.context.ledger();
        let _quota = ledger.acquire(&instance::snapshot_quota(volume_id)).await;

        if self.context.backend().query_volume(volume_id).await?.is_none() {
            return Err(Error::NotFound(format!(
                "source volume {} of snapshot {} not found",
                volume_id, name
            )));
        }

        let claimed = ledger
            .claimed_snapshot_count(volume_id, entry.instance_name())
            .await?;
        check_snapshot_quota(claimed, self.context.config.max_snapshots_per_volume, volume_id)?;

        info!("Creating snapshot {} of volume {}", name, volume_id);
        let request = TaskRequest::CreateSnapshot {
            volume_id: volume_id.to_string(),
            description: name.to_string(),
        };
        self.context.submit_task(entry, record, request).await
    }

    /// Defensive lookup of a snapshot by the name it was created with
    async fn find_by_name(&self, volume_id: &str, name: &str) -> Result<Option<BackendSnapshot>> {
        Ok(self
            .context
            .backend()
            .query_snapshots(&SnapshotFilter::for_volume(volume_id))
            .await?
            .into_iter()
            .find(|s| s.description == name))
    }

    async fn complete_create(
        &self,
        entry: &LedgerEntry,
        record: &mut OperationRecord,
        snapshot: &BackendSnapshot,
    ) -> Result<()> {
        record.snapshot_id = Some(snapshot.snapshot_id.clone());
        record.resolved_capacity = Some(snapshot.size_bytes);
        record.subject_created_at = Some(snapshot.created_at);
        record.succeed();
        entry.save(record).await?;
        info!(
            "Created snapshot {}",
            SnapshotHandle::new(&snapshot.volume_id, &snapshot.snapshot_id)
        );
        Ok(())
    }

    // =========================================================================
    // DeleteSnapshot
    // =========================================================================

    pub async fn delete_snapshot(&self, request: DeleteSnapshotRequest, cancel: &CancellationToken) -> Result<()> {
        require(&request.snapshot_id, "snapshot ID")?;
        let handle = SnapshotHandle::parse(&request.snapshot_id)?;

        let instance_name = instance::delete_snapshot(&handle.volume_id, &handle.snapshot_id);
        let entry = self.context.ledger().acquire(&instance_name).await;

        let previous = entry.load().await?;
        if let Some(record) = &previous {
            check_subject(record, &handle.volume_id)?;
        }

        let (mut record, completion) = match previous {
            Some(mut record) if record.status.is_sticky() => {
                debug!("Snapshot {} already deleted", handle);
                return self.complete_delete(&entry, &mut record, &handle).await;
            }
            Some(record) if record.status == OperationStatus::InProgress => {
                info!("Resuming DeleteSnapshot {} on task {}", handle, record.task_id);
                let completion = self.context.resume_task(&record, cancel).await?;
                (record, completion)
            }
            previous => {
                let mut record = fresh_record(previous, &instance_name, OperationKind::DeleteSnapshot)
                    .with_volume(&handle.volume_id)
                    .with_snapshot(&handle.snapshot_id);
                info!("Deleting snapshot {}", handle);
                let request = TaskRequest::DeleteSnapshot {
                    volume_id: handle.volume_id.clone(),
                    snapshot_id: handle.snapshot_id.clone(),
                };
                let completion = self.context.run_task(&entry, &mut record, request, cancel).await?;
                (record, completion)
            }
        };

        match completion {
            TaskCompletion::Succeeded(_) => {}
            TaskCompletion::Failed(fault) if fault.kind == FaultKind::NotFound => {
                debug!("Snapshot {} was already absent on the backend", handle);
            }
            TaskCompletion::Failed(fault) => {
                let error = fault_error("DeleteSnapshot", &handle.to_string(), &fault);
                return Err(self.context.fail(&entry, &mut record, error).await?);
            }
            TaskCompletion::Lost => {
                // Absence cannot regress
                self.context.lost_task(&record);
            }
        }

        record.succeed();
        self.complete_delete(&entry, &mut record, &handle).await
    }

    /// Persist the delete and retire the create records of the snapshot
    async fn complete_delete(
        &self,
        entry: &LedgerEntry,
        record: &mut OperationRecord,
        handle: &SnapshotHandle,
    ) -> Result<()> {
        entry.save(record).await?;

        for stale in self.context.ledger().list_by_volume(&handle.volume_id).await? {
            if stale.kind == OperationKind::CreateSnapshot
                && stale.snapshot_id.as_deref() == Some(handle.snapshot_id.as_str())
            {
                self.context.ledger().retire(&stale.instance_name).await?;
            }
        }
        info!("Deleted snapshot {}", handle);
        Ok(())
    }

    // =========================================================================
    // ListSnapshots
    // =========================================================================

    pub async fn list_snapshots(&self, request: ListSnapshotsRequest) -> Result<ListSnapshotsResponse> {
        let filter = if !request.snapshot_id.is_empty() {
            let handle = match SnapshotHandle::parse(&request.snapshot_id) {
                Ok(handle) => handle,
                Err(_) => {
                    debug!("Malformed snapshot ID filter {:?}", request.snapshot_id);
                    return Ok(empty_listing());
                }
            };
            if !request.source_volume_id.is_empty() && request.source_volume_id != handle.volume_id {
                return Ok(empty_listing());
            }
            SnapshotFilter {
                volume_id: Some(handle.volume_id),
                snapshot_id: Some(handle.snapshot_id),
            }
        } else if !request.source_volume_id.is_empty() {
            SnapshotFilter::for_volume(&request.source_volume_id)
        } else {
            SnapshotFilter::default()
        };

        let mut entries: Vec<Snapshot> = self
            .context
            .backend()
            .query_snapshots(&filter)
            .await?
            .iter()
            .map(to_csi_snapshot)
            .collect();
        entries.sort_by(|a, b| {
            a.creation_time
                .cmp(&b.creation_time)
                .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        });

        let (entries, next_token) = paginate(entries, request.max_entries, &request.starting_token)?;
        Ok(ListSnapshotsResponse {
            entries,
            next_token,
        })
    }
}

fn empty_listing() -> ListSnapshotsResponse {
    ListSnapshotsResponse {
        entries: Vec::new(),
        next_token: String::new(),
    }
}

fn snapshot_response(record: &OperationRecord) -> Result<CreateSnapshotResponse> {
    let (Some(volume_id), Some(snapshot_id)) = (&record.volume_id, &record.snapshot_id) else {
        return Err(Error::Internal(format!(
            "ledger record {} has no snapshot ID",
            record.instance_name
        )));
    };
    Ok(CreateSnapshotResponse {
        snapshot: Snapshot {
            size_bytes: record.resolved_capacity.unwrap_or(0),
            snapshot_id: SnapshotHandle::new(volume_id, snapshot_id).to_string(),
            source_volume_id: volume_id.clone(),
            creation_time: record.subject_created_at.unwrap_or_else(Utc::now),
            ready_to_use: true,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{Harness, GIB};
    use crate::domain::ports::{BackendFault, BackendTaskClient};
    use crate::ledger::FileOperationStore;
    use assert_matches::assert_matches;
    use futures::future::join_all;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn list_all(h: &Harness, volume_id: &str) -> Vec<Snapshot> {
        h.service
            .list_snapshots(ListSnapshotsRequest {
                source_volume_id: volume_id.into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .entries
    }

    #[tokio::test]
    async fn test_create_snapshot() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;

        let snapshot = h.create_snapshot("snap-1", &volume_id).await.unwrap().snapshot;
        assert!(snapshot.snapshot_id.starts_with(&format!("{}#", volume_id)));
        assert_eq!(snapshot.source_volume_id, volume_id);
        assert_eq!(snapshot.size_bytes, GIB);
        assert!(snapshot.ready_to_use);
    }

    #[tokio::test]
    async fn test_snapshot_create_idempotence() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;

        let first = h.create_snapshot("snap-1", &volume_id).await.unwrap();
        let before = list_all(&h, &volume_id).await;
        let second = h.create_snapshot("snap-1", &volume_id).await.unwrap();
        let after = list_all(&h, &volume_id).await;

        assert_eq!(first, second);
        assert_eq!(before, after);
        assert_eq!(h.backend.submitted(OperationKind::CreateSnapshot), 1);
    }

    #[tokio::test]
    async fn test_snapshot_quota() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;

        let mut snapshots = Vec::new();
        for i in 0..3 {
            snapshots.push(
                h.create_snapshot(&format!("snap-{}", i), &volume_id)
                    .await
                    .unwrap()
                    .snapshot,
            );
        }

        let err = h.create_snapshot("snap-3", &volume_id).await.unwrap_err();
        assert_matches!(err, Error::FailedPrecondition(_));
        assert!(err.to_string().contains("configured maximum (3)"));
        assert!(h.record(&instance::create_snapshot("snap-3", &volume_id)).await.is_none());

        h.delete_snapshot(&snapshots[0].snapshot_id).await.unwrap();
        h.create_snapshot("snap-3", &volume_id).await.unwrap();
        assert_eq!(list_all(&h, &volume_id).await.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_creates_respect_quota() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        h.backend.set_pending_polls(3);

        let results = join_all((0..5).map(|i| {
            let service = h.service.clone();
            let request = CreateSnapshotRequest {
                source_volume_id: volume_id.clone(),
                name: format!("snap-{}", i),
                ..Default::default()
            };
            let cancel = h.cancel.clone();
            async move { service.create_snapshot(request, &cancel).await }
        }))
        .await;

        let created = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(created, 3);
        for result in results.iter().filter(|r| r.is_err()) {
            assert_matches!(result, Err(Error::FailedPrecondition(_)));
        }
        assert_eq!(h.backend.submitted(OperationKind::CreateSnapshot), 3);
        assert_eq!(list_all(&h, &volume_id).await.len(), 3);
    }

    #[tokio::test]
    async fn test_create_snapshot_names_stay_distinct() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        h.create_snapshot("snap", &volume_id).await.unwrap();

        // Same characters, split differently across name and volume
        let (prefix, rest) = volume_id.split_once('-').unwrap();
        let name = format!("snap-{}", prefix);
        assert_matches!(h.create_snapshot(&name, rest).await, Err(Error::NotFound(_)));
        assert_eq!(h.backend.submitted(OperationKind::CreateSnapshot), 1);
    }

    #[tokio::test]
    async fn test_replay_refuses_record_of_other_volume() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;

        let instance_name = instance::create_snapshot("snap-1", &volume_id);
        let entry = h.service.ledger().acquire(&instance_name).await;
        let mut record = OperationRecord::new(&instance_name, OperationKind::CreateSnapshot)
            .with_volume("vol-other")
            .with_snapshot("snap-77");
        record.succeed();
        entry.save(&record).await.unwrap();
        drop(entry);

        assert_matches!(
            h.create_snapshot("snap-1", &volume_id).await,
            Err(Error::AlreadyExists(_))
        );
        assert_eq!(h.backend.submitted(OperationKind::CreateSnapshot), 0);
    }

    #[tokio::test]
    async fn test_create_snapshot_missing_volume() {
        let h = Harness::new();
        assert_matches!(
            h.create_snapshot("snap-1", "vol-missing").await,
            Err(Error::NotFound(_))
        );
        assert_matches!(h.create_snapshot("", "vol-1").await, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_partially_failed_snapshot_is_sticky() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        h.backend.fail_next_snapshot_post_processing();

        let err = h.create_snapshot("snap-1", &volume_id).await.unwrap_err();
        assert_matches!(err, Error::Internal(_));
        assert!(err.to_string().contains("but post-processing failed"));

        let retry = h.create_snapshot("snap-1", &volume_id).await.unwrap_err();
        assert_eq!(retry.to_string(), err.to_string());
        assert_eq!(h.backend.submitted(OperationKind::CreateSnapshot), 1);

        let record = h
            .record(&instance::create_snapshot("snap-1", &volume_id))
            .await
            .unwrap();
        assert_eq!(record.status, OperationStatus::PartiallyFailed);
        assert!(record.snapshot_id.is_some());
    }

    #[tokio::test]
    async fn test_lost_create_with_snapshot_present() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        h.backend.hold_tasks(true);

        let cancel = CancellationToken::new();
        let pending = {
            let service = h.service.clone();
            let volume_id = volume_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let request = CreateSnapshotRequest {
                    source_volume_id: volume_id,
                    name: "snap-1".into(),
                    ..Default::default()
                };
                service.create_snapshot(request, &cancel).await
            })
        };
        let instance_name = instance::create_snapshot("snap-1", &volume_id);
        h.wait_for_status(&instance_name, OperationStatus::InProgress).await;
        cancel.cancel();
        assert_matches!(pending.await.unwrap(), Err(Error::Cancelled(_)));

        h.backend.forget_all_tasks();
        h.backend.hold_tasks(false);

        let snapshot = h.create_snapshot("snap-1", &volume_id).await.unwrap().snapshot;
        assert_eq!(list_all(&h, &volume_id).await, vec![snapshot]);
        assert_eq!(h.backend.submitted(OperationKind::CreateSnapshot), 1);
        assert_eq!(
            h.record(&instance_name).await.unwrap().status,
            OperationStatus::Success
        );
    }

    #[tokio::test]
    async fn test_lost_create_without_snapshot_fails_then_recreates() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        h.backend.discard_next(OperationKind::CreateSnapshot);

        let err = h.create_snapshot("snap-1", &volume_id).await.unwrap_err();
        assert_matches!(err, Error::Internal(_));
        let instance_name = instance::create_snapshot("snap-1", &volume_id);
        assert_eq!(
            h.record(&instance_name).await.unwrap().status,
            OperationStatus::Failed
        );

        h.create_snapshot("snap-1", &volume_id).await.unwrap();
        assert_eq!(h.backend.submitted(OperationKind::CreateSnapshot), 2);
        assert_eq!(h.backend.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_then_resume() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        h.backend.hold_tasks(true);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = CreateSnapshotRequest {
            source_volume_id: volume_id.clone(),
            name: "snap-1".into(),
            ..Default::default()
        };
        assert_matches!(
            h.service.create_snapshot(request, &cancel).await,
            Err(Error::Cancelled(_))
        );

        // The task keeps running; the retry resumes it instead of resubmitting
        let instance_name = instance::create_snapshot("snap-1", &volume_id);
        let record = h.record(&instance_name).await.unwrap();
        assert_eq!(record.status, OperationStatus::InProgress);
        assert!(!record.task_id.is_empty());

        h.backend.hold_tasks(false);
        h.create_snapshot("snap-1", &volume_id).await.unwrap();
        assert_eq!(h.backend.submitted(OperationKind::CreateSnapshot), 1);
        assert_eq!(h.backend.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_durable_ledger() {
        let dir = TempDir::new().unwrap();
        let store = FileOperationStore::open(dir.path()).await.unwrap().without_sync();
        let h = Harness::with_store(Arc::new(store));
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;

        h.backend.hold_tasks(true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = CreateSnapshotRequest {
            source_volume_id: volume_id.clone(),
            name: "snap-1".into(),
            ..Default::default()
        };
        assert!(h.service.create_snapshot(request, &cancel).await.is_err());

        // A new controller process over the same ledger directory and backend
        let store = FileOperationStore::open(dir.path()).await.unwrap().without_sync();
        let restarted = h.restart_with_store(Arc::new(store));
        h.backend.hold_tasks(false);

        restarted.create_snapshot("snap-1", &volume_id).await.unwrap();
        assert_eq!(h.backend.submitted(OperationKind::CreateSnapshot), 1);
        assert_eq!(h.backend.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_snapshot_task_loss() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        let snapshot = h.create_snapshot("snap-1", &volume_id).await.unwrap().snapshot;

        h.backend.discard_next(OperationKind::DeleteSnapshot);
        h.delete_snapshot(&snapshot.snapshot_id).await.unwrap();

        let handle = SnapshotHandle::parse(&snapshot.snapshot_id).unwrap();
        let record = h
            .record(&instance::delete_snapshot(&handle.volume_id, &handle.snapshot_id))
            .await
            .unwrap();
        assert_eq!(record.status, OperationStatus::Success);
    }

    #[tokio::test]
    async fn test_delete_snapshot_resumed_task_loss() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        let snapshot = h.create_snapshot("snap-1", &volume_id).await.unwrap().snapshot;

        h.backend.hold_tasks(true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = DeleteSnapshotRequest {
            snapshot_id: snapshot.snapshot_id.clone(),
        };
        assert!(h.service.delete_snapshot(request, &cancel).await.is_err());

        h.backend.forget_all_tasks();
        h.backend.hold_tasks(false);
        h.delete_snapshot(&snapshot.snapshot_id).await.unwrap();
        assert_eq!(h.backend.submitted(OperationKind::DeleteSnapshot), 1);
    }

    #[tokio::test]
    async fn test_delete_snapshot_idempotent_and_validated() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        let snapshot = h.create_snapshot("snap-1", &volume_id).await.unwrap().snapshot;

        h.delete_snapshot(&snapshot.snapshot_id).await.unwrap();
        h.delete_snapshot(&snapshot.snapshot_id).await.unwrap();
        assert_eq!(h.backend.submitted(OperationKind::DeleteSnapshot), 1);

        // Never existed: the backend reports NotFound, which is success
        h.delete_snapshot(&format!("{}#snap-unknown", volume_id)).await.unwrap();

        assert_matches!(h.delete_snapshot("no-delimiter").await, Err(Error::InvalidArgument(_)));
        assert_matches!(h.delete_snapshot("").await, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_delete_snapshot_backend_failure_retries_clean() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        let snapshot = h.create_snapshot("snap-1", &volume_id).await.unwrap().snapshot;

        h.backend.fail_next(
            OperationKind::DeleteSnapshot,
            BackendFault::new(FaultKind::Other, "snapshot is locked"),
        );
        assert_matches!(
            h.delete_snapshot(&snapshot.snapshot_id).await,
            Err(Error::Internal(_))
        );
        h.delete_snapshot(&snapshot.snapshot_id).await.unwrap();
        assert_eq!(h.backend.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_list_snapshots_filters() {
        let h = Harness::new();
        let vol_a = h.create_volume("pvc-a", GIB).await.unwrap().volume.volume_id;
        let vol_b = h.create_volume("pvc-b", GIB).await.unwrap().volume.volume_id;
        let a1 = h.create_snapshot("a1", &vol_a).await.unwrap().snapshot;
        h.create_snapshot("a2", &vol_a).await.unwrap();
        h.create_snapshot("b1", &vol_b).await.unwrap();

        let all = h.service.list_snapshots(ListSnapshotsRequest::default()).await.unwrap();
        assert_eq!(all.entries.len(), 3);
        assert!(all.next_token.is_empty());

        assert_eq!(list_all(&h, &vol_a).await.len(), 2);

        let by_id = h
            .service
            .list_snapshots(ListSnapshotsRequest {
                snapshot_id: a1.snapshot_id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_id.entries, vec![a1.clone()]);

        let mismatched = h
            .service
            .list_snapshots(ListSnapshotsRequest {
                snapshot_id: a1.snapshot_id.clone(),
                source_volume_id: vol_b.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(mismatched.entries.is_empty());

        let malformed = h
            .service
            .list_snapshots(ListSnapshotsRequest {
                snapshot_id: "garbage".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(malformed.entries.is_empty());
    }

    #[tokio::test]
    async fn test_pagination_equivalence() {
        let h = Harness::new();
        for v in 0..3 {
            let volume_id = h
                .create_volume(&format!("pvc-{}", v), GIB)
                .await
                .unwrap()
                .volume
                .volume_id;
            for s in 0..2 {
                h.create_snapshot(&format!("snap-{}", s), &volume_id).await.unwrap();
            }
        }

        let everything: BTreeSet<String> = h
            .service
            .list_snapshots(ListSnapshotsRequest::default())
            .await
            .unwrap()
            .entries
            .into_iter()
            .map(|s| s.snapshot_id)
            .collect();
        assert_eq!(everything.len(), 6);

        let mut paged = BTreeSet::new();
        let mut token = String::new();
        let mut pages = 0;
        loop {
            let page = h
                .service
                .list_snapshots(ListSnapshotsRequest {
                    max_entries: 1,
                    starting_token: token.clone(),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert!(page.entries.len() <= 1);
            paged.extend(page.entries.into_iter().map(|s| s.snapshot_id));
            pages += 1;
            if page.next_token.is_empty() {
                break;
            }
            token = page.next_token;
        }

        assert_eq!(paged, everything);
        assert_eq!(pages, 6);

        assert_matches!(
            h.service
                .list_snapshots(ListSnapshotsRequest {
                    starting_token: "not-a-token".into(),
                    ..Default::default()
                })
                .await,
            Err(Error::Aborted(_))
        );
    }

    #[tokio::test]
    async fn test_backend_snapshot_visible_via_query() {
        let h = Harness::new();
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;
        h.create_snapshot("snap-1", &volume_id).await.unwrap();

        let snapshots = h
            .backend
            .query_snapshots(&SnapshotFilter::for_volume(&volume_id))
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].description, "snap-1");
    }
}
