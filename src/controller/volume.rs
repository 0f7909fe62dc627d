//! Volume Lifecycle Controller

use super::guards::{check_restore_capacity, check_topology, is_migrated_volume_id, resolve_capacity, round_up_to_mib};
use super::{check_subject, fault_error, fresh_record, require, ControllerContext};
use crate::backend::TaskCompletion;
use crate::domain::ports::{
    BackendVolume, DatastoreInfo, FaultKind, OperationKind, SnapshotFilter, SnapshotSource,
    TaskOutcome, TaskRequest, VmHandle, VolumeCreateSpec,
};
use crate::domain::requests::*;
use crate::error::{Error, Result};
use crate::ledger::{instance, LedgerEntry, OperationRecord, OperationStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// CreateVolume, DeleteVolume, ControllerExpandVolume and (un)publish
pub struct VolumeController {
    context: Arc<ControllerContext>,
}

/// Idempotency-relevant create parameters beyond the size
fn create_fingerprint(parameters: &BTreeMap<String, String>, source: Option<&SnapshotHandle>) -> String {
    format!(
        "policy={};datastore={};source={}",
        parameters.get(PARAM_STORAGE_POLICY_NAME).map_or("", String::as_str),
        parameters.get(PARAM_DATASTORE_URL).map_or("", String::as_str),
        source.map(SnapshotHandle::to_string).unwrap_or_default()
    )
}

impl VolumeController {
    pub(crate) fn new(context: Arc<ControllerContext>) -> Self {
        Self { context }
    }

    // =========================================================================
    // CreateVolume
    // =========================================================================

    pub async fn create_volume(
        &self,
        request: CreateVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateVolumeResponse> {
        require(&request.name, "volume name")?;
        validate_capabilities(&request.volume_capabilities)?;
        let requirement = request.accessibility_requirements.as_ref();
        check_topology(requirement, &self.context.config.topology_categories)?;

        let source = match &request.volume_content_source {
            Some(VolumeContentSource::Snapshot { snapshot_id }) => Some(SnapshotHandle::parse(snapshot_id)?),
            Some(VolumeContentSource::Volume { volume_id }) => {
                return Err(Error::InvalidArgument(format!(
                    "cannot create volume {} from volume {}: cloning is not supported",
                    request.name, volume_id
                )));
            }
            None => None,
        };

        // Restores keep the raw request size; it is checked against the snapshot later
        let capacity_hint = match &source {
            Some(_) => request.capacity_range.map_or(0, |r| r.required_bytes),
            None => resolve_capacity(
                request.capacity_range.as_ref(),
                self.context.config.default_capacity_bytes,
            )?,
        };
        let fingerprint = create_fingerprint(&request.parameters, source.as_ref());

        let instance_name = instance::create_volume(&request.name);
        let entry = self.context.ledger().acquire(&instance_name).await;
        let existing = entry.load().await?;

        // A duplicate in flight or done must match the recorded request
        if let Some(record) = existing.as_ref().filter(|r| {
            matches!(r.status, OperationStatus::Success | OperationStatus::InProgress)
        }) {
            if record.capacity_hint != Some(capacity_hint)
                || record.fingerprint.as_deref() != Some(fingerprint.as_str())
            {
                return Err(Error::AlreadyExists(format!(
                    "volume {} already exists with different capacity or parameters",
                    request.name
                )));
            }
        }

        let (mut record, completion) = match existing {
            Some(record) if record.status == OperationStatus::Success => {
                self.context.deps.metrics.record_replay(OperationKind::CreateVolume.as_str());
                debug!("Replaying CreateVolume {}", request.name);
                return self.volume_response(&request, &record);
            }
            Some(record) if record.status == OperationStatus::PartiallyFailed => {
                return Err(Error::Internal(format!(
                    "volume {} was created on the backend but post-processing failed: {}",
                    request.name,
                    record.error_message.unwrap_or_default()
                )));
            }
            Some(record) if record.status == OperationStatus::InProgress => {
                info!("Resuming CreateVolume {} on task {}", request.name, record.task_id);
                let completion = self.context.resume_task(&record, cancel).await?;
                (record, completion)
            }
            previous => {
                let spec = self
                    .prepare_create(&request, source.as_ref(), capacity_hint)
                    .await?;
                let mut record = fresh_record(previous, &instance_name, OperationKind::CreateVolume)
                    .with_capacity_hint(capacity_hint)
                    .with_fingerprint(fingerprint);
                info!(
                    "Creating volume {} ({} bytes) on {}",
                    request.name, spec.capacity_bytes, spec.datastore_url
                );
                let completion = self
                    .context
                    .run_task(&entry, &mut record, TaskRequest::CreateVolume(spec), cancel)
                    .await?;
                (record, completion)
            }
        };

        let volume = match completion {
            TaskCompletion::Succeeded(TaskOutcome::Volume(volume)) => volume,
            TaskCompletion::Succeeded(outcome) => {
                let error = Error::Internal(format!(
                    "CreateVolume for {} returned unexpected outcome {:?}",
                    request.name, outcome
                ));
                return Err(self.context.fail(&entry, &mut record, error).await?);
            }
            TaskCompletion::Failed(fault) => {
                let error = fault_error("CreateVolume", &request.name, &fault);
                return Err(self.context.fail(&entry, &mut record, error).await?);
            }
            TaskCompletion::Lost => {
                self.context.lost_task(&record);
                match self.context.backend().find_volume_by_name(&request.name).await? {
                    Some(volume) => volume,
                    None => {
                        let error = Error::Internal(format!(
                            "CreateVolume for {}: task {} was lost and no volume with that name exists",
                            request.name, record.task_id
                        ));
                        return Err(self.context.fail(&entry, &mut record, error).await?);
                    }
                }
            }
        };

        self.complete_create(&entry, &mut record, &volume).await?;
        self.volume_response(&request, &record)
    }

    /// Resolve policy, datastore and restore size for a fresh create
    async fn prepare_create(
        &self,
        request: &CreateVolumeRequest,
        source: Option<&SnapshotHandle>,
        capacity_hint: u64,
    ) -> Result<VolumeCreateSpec> {
        let policy_id = match request.parameters.get(PARAM_STORAGE_POLICY_NAME) {
            Some(name) => Some(self.context.deps.policies.resolve_policy_id(name).await?),
            None => None,
        };

        let datastore = self
            .select_datastore(request, policy_id.as_deref())
            .await?;

        let capacity_bytes = match source {
            Some(handle) => {
                let filter = SnapshotFilter {
                    volume_id: Some(handle.volume_id.clone()),
                    snapshot_id: Some(handle.snapshot_id.clone()),
                };
                let snapshot = self
                    .context
                    .backend()
                    .query_snapshots(&filter)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "source snapshot {} of volume {} not found",
                            handle, request.name
                        ))
                    })?;
                check_restore_capacity(capacity_hint, snapshot.size_bytes, &handle.to_string())?
            }
            None => capacity_hint,
        };

        Ok(VolumeCreateSpec {
            name: request.name.clone(),
            cluster_id: self.context.config.cluster_id.clone(),
            capacity_bytes,
            policy_id,
            datastore_url: datastore.url,
            source: source.map(|h| SnapshotSource {
                volume_id: h.volume_id.clone(),
                snapshot_id: h.snapshot_id.clone(),
            }),
            labels: BTreeMap::from([(
                "cns.vmware.com/cluster-id".to_string(),
                self.context.config.cluster_id.clone(),
            )]),
        })
    }

    async fn select_datastore(
        &self,
        request: &CreateVolumeRequest,
        policy_id: Option<&str>,
    ) -> Result<DatastoreInfo> {
        let mut candidates = self
            .context
            .deps
            .topology
            .get_shared_candidates(request.accessibility_requirements.as_ref())
            .await?;
        if candidates.is_empty() {
            return Err(Error::Internal(
                "failed to get shared datastores in kubernetes cluster".into(),
            ));
        }

        if let Some(url) = request.parameters.get(PARAM_DATASTORE_URL) {
            candidates.retain(|d| d.url == *url);
            if candidates.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "datastore {} is not accessible to all nodes selected for volume {}",
                    url, request.name
                )));
            }
        }

        if let Some(policy_id) = policy_id {
            let mut compatible = Vec::with_capacity(candidates.len());
            for datastore in candidates {
                if self
                    .context
                    .deps
                    .policies
                    .check_compatibility(policy_id, &datastore)
                    .await?
                {
                    compatible.push(datastore);
                }
            }
            candidates = compatible;
            if candidates.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "no shared datastore for volume {} is compatible with storage policy {}",
                    request.name, policy_id
                )));
            }
        }

        Ok(candidates.swap_remove(0))
    }

    async fn complete_create(
        &self,
        entry: &LedgerEntry,
        record: &mut OperationRecord,
        volume: &BackendVolume,
    ) -> Result<()> {
        record.volume_id = Some(volume.volume_id.clone());
        record.resolved_capacity = Some(volume.capacity_bytes);
        record.subject_created_at = Some(volume.created_at);
        record.succeed();
        entry.save(record).await?;
        info!("Created volume {} as {}", record.instance_name, volume.volume_id);
        Ok(())
    }

    fn volume_response(
        &self,
        request: &CreateVolumeRequest,
        record: &OperationRecord,
    ) -> Result<CreateVolumeResponse> {
        let volume_id = record.volume_id.clone().ok_or_else(|| {
            Error::Internal(format!("ledger record {} has no volume ID", record.instance_name))
        })?;
        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id,
                capacity_bytes: record.resolved_capacity.or(record.capacity_hint).unwrap_or(0),
                volume_context: BTreeMap::new(),
                content_source: request.volume_content_source.clone(),
                accessible_topology: self.accessible_topology(request.accessibility_requirements.as_ref()),
            },
        })
    }

    /// Requested segments restricted to the configured categories
    fn accessible_topology(&self, requirement: Option<&TopologyRequirement>) -> Vec<Topology> {
        let categories = &self.context.config.topology_categories;
        let Some(requirement) = requirement else {
            return Vec::new();
        };

        let mut topologies: Vec<Topology> = requirement
            .constraints()
            .iter()
            .map(|t| Topology {
                segments: t
                    .segments
                    .iter()
                    .filter(|(k, _)| categories.iter().any(|c| k.ends_with(c.as_str())))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
            .filter(|t| !t.segments.is_empty())
            .collect();
        topologies.sort();
        topologies.dedup();
        topologies
    }

    // =========================================================================
    // DeleteVolume
    // =========================================================================

    pub async fn delete_volume(&self, request: DeleteVolumeRequest, cancel: &CancellationToken) -> Result<()> {
        let volume_id = request.volume_id;
        require(&volume_id, "volume ID")?;

        let instance_name = instance::delete_volume(&volume_id);
        let entry = self.context.ledger().acquire(&instance_name).await;

        let (mut record, completion) = match entry.load().await? {
            Some(record) if record.status.is_sticky() => {
                debug!("Volume {} already deleted", volume_id);
                return Ok(());
            }
            Some(record) if record.status == OperationStatus::InProgress => {
                info!("Resuming DeleteVolume {} on task {}", volume_id, record.task_id);
                let completion = self.context.resume_task(&record, cancel).await?;
                (record, completion)
            }
            previous => {
                self.ensure_no_snapshots(&volume_id, "deleted").await?;

                let mut record = fresh_record(previous, &instance_name, OperationKind::DeleteVolume)
                    .with_volume(&volume_id);
                if self.context.backend().query_volume(&volume_id).await?.is_none() {
                    info!("Volume {} is already absent", volume_id);
                    return self.complete_delete(&entry, &mut record).await;
                }

                info!("Deleting volume {}", volume_id);
                let request = TaskRequest::DeleteVolume {
                    volume_id: volume_id.clone(),
                };
                let completion = self.context.run_task(&entry, &mut record, request, cancel).await?;
                (record, completion)
            }
        };

        let completion = match completion {
            TaskCompletion::Lost => {
                self.context.lost_task(&record);
                if self.context.backend().query_volume(&volume_id).await?.is_none() {
                    return self.complete_delete(&entry, &mut record).await;
                }
                warn!("Volume {} still present after lost delete task; resubmitting", volume_id);
                let request = TaskRequest::DeleteVolume {
                    volume_id: volume_id.clone(),
                };
                self.context.run_task(&entry, &mut record, request, cancel).await?
            }
            completion => completion,
        };

        match completion {
            TaskCompletion::Succeeded(_) => self.complete_delete(&entry, &mut record).await,
            TaskCompletion::Failed(fault) if fault.kind == FaultKind::NotFound => {
                debug!("Volume {} was already absent on the backend", volume_id);
                self.complete_delete(&entry, &mut record).await
            }
            TaskCompletion::Failed(fault) => {
                let error = fault_error("DeleteVolume", &volume_id, &fault);
                Err(self.context.fail(&entry, &mut record, error).await?)
            }
            TaskCompletion::Lost => {
                let error = Error::Internal(format!(
                    "DeleteVolume for {}: resubmitted task {} was lost as well",
                    volume_id, record.task_id
                ));
                Err(self.context.fail(&entry, &mut record, error).await?)
            }
        }
    }

    /// Volumes with live or in-flight snapshots may not be deleted or expanded
    async fn ensure_no_snapshots(&self, volume_id: &str, verb: &str) -> Result<()> {
        let snapshots = self
            .context
            .backend()
            .query_snapshots(&SnapshotFilter::for_volume(volume_id))
            .await?;
        let in_flight = self
            .context
            .ledger()
            .list_by_volume(volume_id)
            .await?
            .iter()
            .filter(|r| r.kind == OperationKind::CreateSnapshot && r.status == OperationStatus::InProgress)
            .count();

        if !snapshots.is_empty() || in_flight > 0 {
            return Err(Error::FailedPrecondition(format!(
                "volume {} cannot be {}: it has {} snapshot(s) and {} snapshot creation(s) in progress",
                volume_id,
                verb,
                snapshots.len(),
                in_flight
            )));
        }
        Ok(())
    }

    async fn complete_delete(&self, entry: &LedgerEntry, record: &mut OperationRecord) -> Result<()> {
        record.succeed();
        entry.save(record).await?;

        if let Some(volume_id) = record.volume_id.as_deref() {
            for stale in self.context.ledger().list_by_volume(volume_id).await? {
                if stale.kind == OperationKind::CreateVolume {
                    self.context.ledger().retire(&stale.instance_name).await?;
                }
            }
            info!("Deleted volume {}", volume_id);
        }
        Ok(())
    }

    // =========================================================================
    // ControllerExpandVolume
    // =========================================================================

    pub async fn expand_volume(
        &self,
        request: ControllerExpandVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<ControllerExpandVolumeResponse> {
        let volume_id = request.volume_id;
        require(&volume_id, "volume ID")?;
        if is_migrated_volume_id(&volume_id) {
            return Err(Error::InvalidArgument(format!(
                "cannot expand migrated volume {}: path-based volumes do not support expansion",
                volume_id
            )));
        }
        if let Some(capability) = &request.volume_capability {
            capability.validate()?;
        }

        let range = request.capacity_range.unwrap_or_default();
        if range.required_bytes == 0 {
            return Err(Error::InvalidArgument(format!(
                "required bytes must be set to expand volume {}",
                volume_id
            )));
        }
        let capacity = round_up_to_mib(range.required_bytes);
        if range.limit_bytes != 0 && capacity > range.limit_bytes {
            return Err(Error::InvalidArgument(format!(
                "requested size {} for volume {} exceeds limit bytes {}",
                capacity, volume_id, range.limit_bytes
            )));
        }

        let node_expansion_required = !matches!(
            request.volume_capability.as_ref().map(|c| &c.access_type),
            Some(AccessType::Block)
        );
        let respond = |capacity_bytes| ControllerExpandVolumeResponse {
            capacity_bytes,
            node_expansion_required,
        };

        let instance_name = instance::expand_volume(&volume_id, capacity);
        let entry = self.context.ledger().acquire(&instance_name).await;

        let (mut record, completion) = match entry.load().await? {
            Some(record) if record.status == OperationStatus::InProgress => {
                info!("Resuming expansion of {} on task {}", volume_id, record.task_id);
                let completion = self.context.resume_task(&record, cancel).await?;
                (record, completion)
            }
            previous => {
                let volume = self.require_volume(&volume_id).await?;
                self.ensure_no_snapshots(&volume_id, "expanded").await?;

                if volume.capacity_bytes >= capacity {
                    debug!(
                        "Volume {} already has {} bytes, requested {}",
                        volume_id, volume.capacity_bytes, capacity
                    );
                    return Ok(respond(volume.capacity_bytes));
                }

                if previous.as_ref().map_or(false, |p| p.status.is_sticky()) {
                    entry.retire().await?;
                }
                let mut record = fresh_record(previous, &instance_name, OperationKind::ExpandVolume)
                    .with_volume(&volume_id)
                    .with_capacity_hint(capacity);
                info!("Expanding volume {} to {} bytes", volume_id, capacity);
                let request = TaskRequest::ExpandVolume {
                    volume_id: volume_id.clone(),
                    capacity_bytes: capacity,
                };
                let completion = self.context.run_task(&entry, &mut record, request, cancel).await?;
                (record, completion)
            }
        };

        let completion = match completion {
            TaskCompletion::Lost => {
                self.context.lost_task(&record);
                match self.context.backend().query_volume(&volume_id).await? {
                    Some(volume) if volume.capacity_bytes >= capacity => {
                        TaskCompletion::Succeeded(TaskOutcome::Expanded {
                            capacity_bytes: volume.capacity_bytes,
                        })
                    }
                    Some(_) => {
                        warn!("Volume {} not yet expanded after lost task; resubmitting", volume_id);
                        let request = TaskRequest::ExpandVolume {
                            volume_id: volume_id.clone(),
                            capacity_bytes: capacity,
                        };
                        self.context.run_task(&entry, &mut record, request, cancel).await?
                    }
                    None => {
                        let error = Error::NotFound(format!("volume {} not found", volume_id));
                        return Err(self.context.fail(&entry, &mut record, error).await?);
                    }
                }
            }
            completion => completion,
        };

        match completion {
            TaskCompletion::Succeeded(TaskOutcome::Expanded { capacity_bytes }) if capacity_bytes >= capacity => {
                record.resolved_capacity = Some(capacity_bytes);
                record.succeed();
                entry.save(&record).await?;
                info!("Expanded volume {} to {} bytes", volume_id, capacity_bytes);
                Ok(respond(capacity_bytes))
            }
            TaskCompletion::Succeeded(outcome) => {
                let error = Error::Internal(format!(
                    "ControllerExpandVolume for {}: backend reported {:?} for requested {} bytes",
                    volume_id, outcome, capacity
                ));
                Err(self.context.fail(&entry, &mut record, error).await?)
            }
            TaskCompletion::Failed(fault) => {
                let error = fault_error("ControllerExpandVolume", &volume_id, &fault);
                Err(self.context.fail(&entry, &mut record, error).await?)
            }
            TaskCompletion::Lost => {
                let error = Error::Internal(format!(
                    "ControllerExpandVolume for {}: resubmitted task {} was lost as well",
                    volume_id, record.task_id
                ));
                Err(self.context.fail(&entry, &mut record, error).await?)
            }
        }
    }

    async fn require_volume(&self, volume_id: &str) -> Result<BackendVolume> {
        self.context
            .backend()
            .query_volume(volume_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("volume {} not found", volume_id)))
    }

    // =========================================================================
    // ControllerPublishVolume / ControllerUnpublishVolume
    // =========================================================================

    pub async fn publish_volume(
        &self,
        request: ControllerPublishVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<ControllerPublishVolumeResponse> {
        let volume_id = request.volume_id;
        let node_id = request.node_id;
        require(&volume_id, "volume ID")?;
        require(&node_id, "node ID")?;
        request
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability must be provided".into()))?
            .validate()?;

        let vm = self
            .context
            .deps
            .nodes
            .resolve_node(&node_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {} not found", node_id)))?;

        let instance_name = instance::attach_volume(&volume_id, &node_id);
        let entry = self.context.ledger().acquire(&instance_name).await;
        let previous = entry.load().await?;
        if let Some(record) = &previous {
            check_subject(record, &volume_id)?;
        }

        let (mut record, completion) = match previous {
            Some(record) if record.status == OperationStatus::InProgress => {
                info!("Resuming attach of {} to {} on task {}", volume_id, node_id, record.task_id);
                let completion = self.context.resume_task(&record, cancel).await?;
                (record, completion)
            }
            previous => {
                let volume = self.require_volume(&volume_id).await?;
                match &volume.attached_to {
                    Some(current) if *current == vm => {
                        debug!("Volume {} is already attached to {}", volume_id, node_id);
                        return Ok(publish_context(volume.disk_uuid));
                    }
                    Some(current) => {
                        return Err(Error::FailedPrecondition(format!(
                            "volume {} is attached to node {} and cannot be attached to {}",
                            volume_id, current.node_name, node_id
                        )));
                    }
                    None => {}
                }

                if previous.as_ref().map_or(false, |p| p.status.is_sticky()) {
                    entry.retire().await?;
                }
                let mut record = fresh_record(previous, &instance_name, OperationKind::AttachVolume)
                    .with_volume(&volume_id);
                info!("Attaching volume {} to {}", volume_id, vm);
                let request = TaskRequest::AttachVolume {
                    volume_id: volume_id.clone(),
                    vm: vm.clone(),
                };
                let completion = self.context.run_task(&entry, &mut record, request, cancel).await?;
                (record, completion)
            }
        };

        let completion = match completion {
            TaskCompletion::Lost => {
                self.context.lost_task(&record);
                let volume = match self.context.backend().query_volume(&volume_id).await? {
                    Some(volume) => volume,
                    None => {
                        let error = Error::NotFound(format!("volume {} not found", volume_id));
                        return Err(self.context.fail(&entry, &mut record, error).await?);
                    }
                };
                match volume.attached_to {
                    Some(current) if current == vm => TaskCompletion::Succeeded(TaskOutcome::Attached {
                        disk_uuid: volume.disk_uuid,
                    }),
                    Some(current) => {
                        let error = Error::FailedPrecondition(format!(
                            "volume {} is attached to node {} and cannot be attached to {}",
                            volume_id, current.node_name, node_id
                        ));
                        return Err(self.context.fail(&entry, &mut record, error).await?);
                    }
                    None => {
                        warn!("Volume {} not attached after lost task; resubmitting", volume_id);
                        let request = TaskRequest::AttachVolume {
                            volume_id: volume_id.clone(),
                            vm: vm.clone(),
                        };
                        self.context.run_task(&entry, &mut record, request, cancel).await?
                    }
                }
            }
            completion => completion,
        };

        match completion {
            TaskCompletion::Succeeded(TaskOutcome::Attached { disk_uuid }) => {
                record.succeed();
                entry.save(&record).await?;
                info!("Attached volume {} to {} as disk {}", volume_id, node_id, disk_uuid);
                Ok(publish_context(disk_uuid))
            }
            TaskCompletion::Succeeded(outcome) => {
                let error = Error::Internal(format!(
                    "ControllerPublishVolume for {}: unexpected outcome {:?}",
                    volume_id, outcome
                ));
                Err(self.context.fail(&entry, &mut record, error).await?)
            }
            TaskCompletion::Failed(fault) => {
                let error = fault_error("ControllerPublishVolume", &volume_id, &fault);
                Err(self.context.fail(&entry, &mut record, error).await?)
            }
            TaskCompletion::Lost => {
                let error = Error::Internal(format!(
                    "ControllerPublishVolume for {}: resubmitted task {} was lost as well",
                    volume_id, record.task_id
                ));
                Err(self.context.fail(&entry, &mut record, error).await?)
            }
        }
    }

    pub async fn unpublish_volume(
        &self,
        request: ControllerUnpublishVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let volume_id = request.volume_id;
        let node_id = request.node_id;
        require(&volume_id, "volume ID")?;
        require(&node_id, "node ID")?;

        let Some(vm) = self.context.deps.nodes.resolve_node(&node_id).await? else {
            info!("Node {} has no VM; volume {} is considered detached", node_id, volume_id);
            return Ok(());
        };

        let instance_name = instance::detach_volume(&volume_id, &node_id);
        let entry = self.context.ledger().acquire(&instance_name).await;
        let previous = entry.load().await?;
        if let Some(record) = &previous {
            check_subject(record, &volume_id)?;
        }

        let (mut record, completion) = match previous {
            Some(record) if record.status == OperationStatus::InProgress => {
                info!("Resuming detach of {} from {} on task {}", volume_id, node_id, record.task_id);
                let completion = self.context.resume_task(&record, cancel).await?;
                (record, completion)
            }
            previous => {
                if !self.is_attached_to(&volume_id, &vm).await? {
                    debug!("Volume {} is not attached to {}", volume_id, node_id);
                    return Ok(());
                }

                if previous.as_ref().map_or(false, |p| p.status.is_sticky()) {
                    entry.retire().await?;
                }
                let mut record = fresh_record(previous, &instance_name, OperationKind::DetachVolume)
                    .with_volume(&volume_id);
                info!("Detaching volume {} from {}", volume_id, vm);
                let request = TaskRequest::DetachVolume {
                    volume_id: volume_id.clone(),
                    vm: vm.clone(),
                };
                let completion = self.context.run_task(&entry, &mut record, request, cancel).await?;
                (record, completion)
            }
        };

        let completion = match completion {
            TaskCompletion::Lost => {
                self.context.lost_task(&record);
                if self.is_attached_to(&volume_id, &vm).await? {
                    warn!("Volume {} still attached after lost task; resubmitting", volume_id);
                    let request = TaskRequest::DetachVolume {
                        volume_id: volume_id.clone(),
                        vm: vm.clone(),
                    };
                    self.context.run_task(&entry, &mut record, request, cancel).await?
                } else {
                    TaskCompletion::Succeeded(TaskOutcome::Detached)
                }
            }
            completion => completion,
        };

        match completion {
            TaskCompletion::Succeeded(_) => {}
            TaskCompletion::Failed(fault) if fault.kind == FaultKind::NotFound => {
                debug!("Volume {} vanished before detach", volume_id);
            }
            TaskCompletion::Failed(fault) => {
                let error = fault_error("ControllerUnpublishVolume", &volume_id, &fault);
                return Err(self.context.fail(&entry, &mut record, error).await?);
            }
            TaskCompletion::Lost => {
                let error = Error::Internal(format!(
                    "ControllerUnpublishVolume for {}: resubmitted task {} was lost as well",
                    volume_id, record.task_id
                ));
                return Err(self.context.fail(&entry, &mut record, error).await?);
            }
        }

        record.succeed();
        entry.save(&record).await?;
        info!("Detached volume {} from {}", volume_id, node_id);
        Ok(())
    }

    async fn is_attached_to(&self, volume_id: &str, vm: &VmHandle) -> Result<bool> {
        Ok(self
            .context
            .backend()
            .query_volume(volume_id)
            .await?
            .map_or(false, |v| v.attached_to.as_ref() == Some(vm)))
    }
}

fn publish_context(disk_uuid: String) -> ControllerPublishVolumeResponse {
    ControllerPublishVolumeResponse {
        publish_context: BTreeMap::from([(ATTRIBUTE_DISK_UUID.to_string(), disk_uuid)]),
    }
}
