//! In-memory storage backend
//!
//! Simulates an asynchronous, task-based block storage backend. Mutations are
//! applied when a task is submitted; the task then reports `Pending` for a
//! configurable number of polls before exposing its outcome. The knobs on
//! [`InMemoryBackend`] inject the failure modes the controllers have to cope
//! with: lost tasks, transient outages, rejected submissions, task faults and
//! snapshot post-processing failures.

use crate::domain::ports::{
    BackendFault, BackendSnapshot, BackendTaskClient, BackendVolume, FaultKind, OperationKind,
    SnapshotFilter, TaskId, TaskOutcome, TaskRequest, TaskState, VmHandle, VolumeCreateSpec,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

const MIB: u64 = 1024 * 1024;

struct TaskEntry {
    result: TaskState,
    pending_polls: u32,
    polls: u32,
}

#[derive(Default)]
struct BackendState {
    volumes: BTreeMap<String, BackendVolume>,
    snapshots: BTreeMap<(String, String), BackendSnapshot>,
    tasks: HashMap<TaskId, TaskEntry>,
    submitted: HashMap<OperationKind, u64>,
    injected_faults: HashMap<OperationKind, BackendFault>,
    discard_next: HashMap<OperationKind, bool>,
    fail_post_processing: bool,
    transient_submit_failures: u32,
    reject_next: Option<String>,
    next_id: u64,
}

impl BackendState {
    fn generate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }

    fn has_snapshots(&self, volume_id: &str) -> bool {
        self.snapshots.keys().any(|(v, _)| v == volume_id)
    }

    fn apply(&mut self, request: TaskRequest) -> TaskState {
        match request {
            TaskRequest::CreateVolume(spec) => self.create_volume(spec),
            TaskRequest::DeleteVolume { volume_id } => {
                if !self.volumes.contains_key(&volume_id) {
                    return not_found("volume", &volume_id);
                }
                if self.has_snapshots(&volume_id) {
                    return in_use(format!("volume {} still has snapshots", volume_id));
                }
                if let Some(vm) = self.volumes.get(&volume_id).and_then(|v| v.attached_to.as_ref()) {
                    return in_use(format!("volume {} is attached to {}", volume_id, vm));
                }
                self.volumes.remove(&volume_id);
                TaskState::Succeeded(TaskOutcome::Deleted)
            }
            TaskRequest::ExpandVolume {
                volume_id,
                capacity_bytes,
            } => {
                if self.has_snapshots(&volume_id) {
                    return in_use(format!("volume {} has snapshots", volume_id));
                }
                match self.volumes.get_mut(&volume_id) {
                    Some(volume) => {
                        let rounded = capacity_bytes.div_ceil(MIB) * MIB;
                        volume.capacity_bytes = volume.capacity_bytes.max(rounded);
                        TaskState::Succeeded(TaskOutcome::Expanded {
                            capacity_bytes: volume.capacity_bytes,
                        })
                    }
                    None => not_found("volume", &volume_id),
                }
            }
            TaskRequest::AttachVolume { volume_id, vm } => match self.volumes.get_mut(&volume_id) {
                Some(volume) => {
                    let holder = volume.attached_to.clone().filter(|current| *current != vm);
                    if let Some(current) = holder {
                        return in_use(format!("volume {} is attached to {}", volume_id, current));
                    }
                    volume.attached_to = Some(vm);
                    TaskState::Succeeded(TaskOutcome::Attached {
                        disk_uuid: volume.disk_uuid.clone(),
                    })
                }
                None => not_found("volume", &volume_id),
            },
            TaskRequest::DetachVolume { volume_id, vm } => match self.volumes.get_mut(&volume_id) {
                Some(volume) => {
                    if volume.attached_to.as_ref() == Some(&vm) {
                        volume.attached_to = None;
                    }
                    TaskState::Succeeded(TaskOutcome::Detached)
                }
                None => not_found("volume", &volume_id),
            },
            TaskRequest::CreateSnapshot {
                volume_id,
                description,
            } => {
                let size_bytes = match self.volumes.get(&volume_id) {
                    Some(volume) => volume.capacity_bytes,
                    None => return not_found("volume", &volume_id),
                };
                let snapshot_id = self.generate_id("snap");
                let snapshot = BackendSnapshot {
                    volume_id: volume_id.clone(),
                    snapshot_id: snapshot_id.clone(),
                    description,
                    size_bytes,
                    created_at: Utc::now(),
                    ready: true,
                };
                self.snapshots
                    .insert((volume_id.clone(), snapshot_id.clone()), snapshot.clone());

                if std::mem::take(&mut self.fail_post_processing) {
                    return TaskState::Failed(BackendFault::new(
                        FaultKind::PostProcessingFailed { snapshot_id },
                        format!("failed to update snapshot metadata on volume {}", volume_id),
                    ));
                }
                TaskState::Succeeded(TaskOutcome::Snapshot(snapshot))
            }
            TaskRequest::DeleteSnapshot {
                volume_id,
                snapshot_id,
            } => match self.snapshots.remove(&(volume_id, snapshot_id.clone())) {
                Some(_) => TaskState::Succeeded(TaskOutcome::Deleted),
                None => not_found("snapshot", &snapshot_id),
            },
        }
    }

    fn create_volume(&mut self, spec: VolumeCreateSpec) -> TaskState {
        let mut capacity_bytes = spec.capacity_bytes;
        if let Some(source) = &spec.source {
            match self
                .snapshots
                .get(&(source.volume_id.clone(), source.snapshot_id.clone()))
            {
                Some(snapshot) => capacity_bytes = capacity_bytes.max(snapshot.size_bytes),
                None => return not_found("snapshot", &source.snapshot_id),
            }
        }

        TaskState::Succeeded(TaskOutcome::Volume(self.insert_volume(spec, capacity_bytes)))
    }

    fn insert_volume(&mut self, spec: VolumeCreateSpec, capacity_bytes: u64) -> BackendVolume {
        let volume_id = self.generate_id("vol");
        let disk_uuid = format!("6000c29{:025x}", self.next_id);
        let volume = BackendVolume {
            volume_id: volume_id.clone(),
            name: spec.name,
            capacity_bytes,
            policy_id: spec.policy_id,
            datastore_url: spec.datastore_url,
            disk_uuid,
            attached_to: None,
            created_at: Utc::now(),
        };
        self.volumes.insert(volume_id, volume.clone());
        volume
    }
}

fn not_found(what: &str, id: &str) -> TaskState {
    TaskState::Failed(BackendFault::new(
        FaultKind::NotFound,
        format!("{} {} not found", what, id),
    ))
}

fn in_use(message: String) -> TaskState {
    TaskState::Failed(BackendFault::new(FaultKind::ResourceInUse, message))
}

/// Task-based backend held entirely in memory
pub struct InMemoryBackend {
    name: String,
    state: Mutex<BackendState>,
    available: AtomicBool,
    hold_tasks: AtomicBool,
    pending_polls: AtomicU32,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_name("in-memory")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BackendState::default()),
            available: AtomicBool::new(true),
            hold_tasks: AtomicBool::new(false),
            pending_polls: AtomicU32::new(0),
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                backend: self.name.clone(),
            })
        }
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Simulate a backend outage; every call fails transiently
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Keep every task `Pending` until released
    pub fn hold_tasks(&self, hold: bool) {
        self.hold_tasks.store(hold, Ordering::SeqCst);
    }

    /// Polls answered with `Pending` before a new task reports its result
    pub fn set_pending_polls(&self, polls: u32) {
        self.pending_polls.store(polls, Ordering::SeqCst);
    }

    /// Fail the next `count` submissions with a transient error
    pub fn fail_next_submits(&self, count: u32) {
        self.state.lock().transient_submit_failures = count;
    }

    /// Reject the next submission outright
    pub fn reject_next_submit(&self, reason: impl Into<String>) {
        self.state.lock().reject_next = Some(reason.into());
    }

    /// Fail the next task of `kind` without applying it
    pub fn fail_next(&self, kind: OperationKind, fault: BackendFault) {
        self.state.lock().injected_faults.insert(kind, fault);
    }

    /// Accept the next task of `kind` but neither apply nor remember it
    pub fn discard_next(&self, kind: OperationKind) {
        self.state.lock().discard_next.insert(kind, true);
    }

    /// Create the next snapshot but report a post-processing failure
    pub fn fail_next_snapshot_post_processing(&self) {
        self.state.lock().fail_post_processing = true;
    }

    /// Forget a task, as after a backend session expiry
    pub fn forget_task(&self, task_id: &TaskId) {
        self.state.lock().tasks.remove(task_id);
    }

    pub fn forget_all_tasks(&self) {
        self.state.lock().tasks.clear();
    }

    // =========================================================================
    // Seeding and Inspection
    // =========================================================================

    /// Insert a volume directly, bypassing the task machinery
    pub fn seed_volume(&self, name: &str, capacity_bytes: u64, datastore_url: &str) -> BackendVolume {
        let mut state = self.state.lock();
        let spec = VolumeCreateSpec {
            name: name.to_string(),
            cluster_id: String::new(),
            capacity_bytes,
            policy_id: None,
            datastore_url: datastore_url.to_string(),
            source: None,
            labels: BTreeMap::new(),
        };
        state.insert_volume(spec, capacity_bytes)
    }

    /// Insert a snapshot directly, bypassing the task machinery
    pub fn seed_snapshot(&self, volume_id: &str, description: &str) -> Option<BackendSnapshot> {
        let mut state = self.state.lock();
        let request = TaskRequest::CreateSnapshot {
            volume_id: volume_id.to_string(),
            description: description.to_string(),
        };
        match state.apply(request) {
            TaskState::Succeeded(TaskOutcome::Snapshot(snapshot)) => Some(snapshot),
            _ => None,
        }
    }

    /// Accepted submissions of a kind
    pub fn submitted(&self, kind: OperationKind) -> u64 {
        self.state.lock().submitted.get(&kind).copied().unwrap_or(0)
    }

    pub fn poll_count(&self, task_id: &TaskId) -> u32 {
        self.state.lock().tasks.get(task_id).map_or(0, |t| t.polls)
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    pub fn volumes(&self) -> Vec<BackendVolume> {
        self.state.lock().volumes.values().cloned().collect()
    }
}

#[async_trait]
impl BackendTaskClient for InMemoryBackend {
    async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        self.ensure_available()?;
        let kind = request.kind();
        let mut state = self.state.lock();

        if state.transient_submit_failures > 0 {
            state.transient_submit_failures -= 1;
            return Err(Error::BackendUnavailable {
                backend: self.name.clone(),
            });
        }
        if let Some(reason) = state.reject_next.take() {
            return Err(Error::BackendRejected {
                operation: kind.to_string(),
                reason,
            });
        }

        *state.submitted.entry(kind).or_insert(0) += 1;
        let task_id = TaskId(state.generate_id("task"));

        if state.discard_next.remove(&kind).unwrap_or(false) {
            debug!("Discarding {} task {}", kind, task_id);
            return Ok(task_id);
        }

        let result = match state.injected_faults.remove(&kind) {
            Some(fault) => TaskState::Failed(fault),
            None => state.apply(request),
        };
        let pending_polls = self.pending_polls.load(Ordering::SeqCst);
        state.tasks.insert(
            task_id.clone(),
            TaskEntry {
                result,
                pending_polls,
                polls: 0,
            },
        );

        debug!("Accepted {} task {}", kind, task_id);
        Ok(task_id)
    }

    async fn poll(&self, task_id: &TaskId) -> Result<TaskState> {
        self.ensure_available()?;
        let held = self.hold_tasks.load(Ordering::SeqCst);
        let mut state = self.state.lock();

        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(TaskState::NotFound);
        };
        task.polls += 1;
        if held || task.polls <= task.pending_polls {
            return Ok(TaskState::Pending);
        }
        Ok(task.result.clone())
    }

    async fn query_volume(&self, volume_id: &str) -> Result<Option<BackendVolume>> {
        self.ensure_available()?;
        Ok(self.state.lock().volumes.get(volume_id).cloned())
    }

    async fn find_volume_by_name(&self, name: &str) -> Result<Option<BackendVolume>> {
        self.ensure_available()?;
        Ok(self
            .state
            .lock()
            .volumes
            .values()
            .find(|v| v.name == name)
            .cloned())
    }

    async fn query_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<BackendSnapshot>> {
        self.ensure_available()?;
        Ok(self
            .state
            .lock()
            .snapshots
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    fn backend_name(&self) -> &str {
        &self.name
    }
}
