//! Idempotent Operation Ledger
//!
//! Durable record of in-flight and completed backend operations, keyed by a
//! deterministic instance name derived from the request.
//!
//! ```text
//!   RPC ──▶ instance name ──▶ OperationLedger::acquire ──▶ LedgerEntry
//!                                   │                        │  load / save / retire
//!                              per-key mutex                  ▼
//!                                                     OperationStore
//!                                          (memory │ file │ VolumeOperationRequest CR)
//! ```
//!
//! Writes for one instance name are serialized by an async mutex held for the
//! lifetime of a [`LedgerEntry`]; unrelated names never contend. A record in
//! `Success` or `PartiallyFailed` is never overwritten by `InProgress`: a
//! fresh attempt must [`LedgerEntry::retire`] the old record explicitly.

mod custom_resource;
mod file;
mod memory;

pub use self::custom_resource::KubeOperationStore;
pub use self::file::FileOperationStore;
pub use self::memory::MemoryOperationStore;

use crate::domain::ports::{OperationKind, TaskId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

// =============================================================================
// Operation Record
// =============================================================================

/// Lifecycle status of a tracked operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    InProgress,
    Success,
    Failed,
    /// Backend mutation succeeded but driver post-processing failed
    PartiallyFailed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::InProgress)
    }

    /// Terminal states that may not be regressed to `InProgress`
    pub fn is_sticky(&self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::PartiallyFailed)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::InProgress => write!(f, "InProgress"),
            OperationStatus::Success => write!(f, "Success"),
            OperationStatus::Failed => write!(f, "Failed"),
            OperationStatus::PartiallyFailed => write!(f, "PartiallyFailed"),
        }
    }
}

/// One tracked backend operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub instance_name: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub volume_id: Option<String>,
    /// Backend snapshot ID (not the composite form)
    #[serde(default)]
    pub snapshot_id: Option<String>,
    /// Requested size, compared on replay to detect divergent retries
    #[serde(default)]
    pub capacity_hint: Option<u64>,
    /// Size reported by the backend on completion
    #[serde(default)]
    pub resolved_capacity: Option<u64>,
    /// Other idempotency-relevant parameters of the original request
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Live task handle; empty once resolved without one
    #[serde(default)]
    pub task_id: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Backend creation time of the volume or snapshot
    #[serde(default)]
    pub subject_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl OperationRecord {
    /// New record for a first attempt; persisted once a task is submitted
    pub fn new(instance_name: impl Into<String>, kind: OperationKind) -> Self {
        let now = Utc::now();
        Self {
            instance_name: instance_name.into(),
            kind,
            volume_id: None,
            snapshot_id: None,
            capacity_hint: None,
            resolved_capacity: None,
            fingerprint: None,
            task_id: String::new(),
            status: OperationStatus::InProgress,
            error_message: None,
            created_at: now,
            updated_at: now,
            subject_created_at: None,
            attempts: 0,
        }
    }

    pub fn with_volume(mut self, volume_id: impl Into<String>) -> Self {
        self.volume_id = Some(volume_id.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn with_capacity_hint(mut self, bytes: u64) -> Self {
        self.capacity_hint = Some(bytes);
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Live task handle, if any
    pub fn task(&self) -> Option<TaskId> {
        if self.task_id.is_empty() {
            None
        } else {
            Some(TaskId(self.task_id.clone()))
        }
    }

    /// Record a freshly submitted task
    pub fn begin(&mut self, task_id: &TaskId) {
        self.task_id = task_id.to_string();
        self.status = OperationStatus::InProgress;
        self.error_message = None;
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    pub fn succeed(&mut self) {
        self.status = OperationStatus::Success;
        self.task_id.clear();
        self.error_message = None;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = OperationStatus::Failed;
        self.task_id.clear();
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn partially_fail(&mut self, message: impl Into<String>) {
        self.status = OperationStatus::PartiallyFailed;
        self.task_id.clear();
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Instance Names
// =============================================================================

/// Deterministic instance-name builders, one per operation kind
///
/// Leading free-form components carry a length prefix, so no two distinct
/// argument tuples map to the same name.
pub mod instance {
    fn framed(component: &str) -> String {
        format!("{}.{}", component.len(), component)
    }

    pub fn create_volume(name: &str) -> String {
        format!("create-volume-{}", name)
    }

    pub fn delete_volume(volume_id: &str) -> String {
        format!("delete-volume-{}", volume_id)
    }

    pub fn expand_volume(volume_id: &str, capacity_bytes: u64) -> String {
        format!("expand-volume-{}-{}", volume_id, capacity_bytes)
    }

    pub fn attach_volume(volume_id: &str, node_id: &str) -> String {
        format!("attach-volume-{}-{}", framed(volume_id), node_id)
    }

    pub fn detach_volume(volume_id: &str, node_id: &str) -> String {
        format!("detach-volume-{}-{}", framed(volume_id), node_id)
    }

    pub fn create_snapshot(name: &str, volume_id: &str) -> String {
        format!("create-snapshot-{}-{}", framed(name), volume_id)
    }

    pub fn delete_snapshot(volume_id: &str, snapshot_id: &str) -> String {
        format!("delete-snapshot-{}-{}", framed(volume_id), snapshot_id)
    }

    /// Lock key serializing snapshot admission on one volume; never stored
    pub fn snapshot_quota(volume_id: &str) -> String {
        format!("snapshot-quota-{}", volume_id)
    }
}

// =============================================================================
// Store Port
// =============================================================================

/// Persistence for operation records
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn get(&self, instance_name: &str) -> Result<Option<OperationRecord>>;

    /// Upsert a record
    async fn put(&self, record: &OperationRecord) -> Result<()>;

    /// Remove a record; absent records are not an error
    async fn delete(&self, instance_name: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<OperationRecord>>;

    fn store_name(&self) -> &str;
}

pub type OperationStoreRef = Arc<dyn OperationStore>;

// =============================================================================
// Keyed Locks
// =============================================================================

#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Releases a lock slot when a waiter is dropped before acquiring it
struct Waiter<'a> {
    locks: &'a KeyedLocks,
    key: &'a str,
    armed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.locks.release(self.key);
        }
    }
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let mut waiter = Waiter {
            locks: self,
            key,
            armed: true,
        };
        let guard = mutex.lock_owned().await;
        waiter.armed = false;
        guard
    }

    /// Drop the mutex for `key` once nobody else references it
    fn release(&self, key: &str) {
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

// =============================================================================
// Operation Ledger
// =============================================================================

/// Ledger over an [`OperationStore`] with per-instance-name mutual exclusion
pub struct OperationLedger {
    store: OperationStoreRef,
    locks: Arc<KeyedLocks>,
}

impl OperationLedger {
    pub fn new(store: OperationStoreRef) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks: Arc::new(KeyedLocks::default()),
        })
    }

    /// Take exclusive ownership of an instance name, waiting for any holder
    pub async fn acquire(&self, instance_name: &str) -> LedgerEntry {
        let guard = self.locks.lock(instance_name).await;
        LedgerEntry {
            instance_name: instance_name.to_string(),
            store: self.store.clone(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Unlocked read, for inspection only
    pub async fn get(&self, instance_name: &str) -> Result<Option<OperationRecord>> {
        self.store.get(instance_name).await
    }

    pub async fn list_by_volume(&self, volume_id: &str) -> Result<Vec<OperationRecord>> {
        let mut records: Vec<OperationRecord> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.volume_id.as_deref() == Some(volume_id))
            .collect();
        records.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        Ok(records)
    }

    /// Snapshot slots taken on a volume
    ///
    /// Counts confirmed creates and creates still in flight under any instance
    /// name other than `excluding`. Callers hold the volume's quota lock.
    pub async fn claimed_snapshot_count(&self, volume_id: &str, excluding: &str) -> Result<usize> {
        Ok(self
            .list_by_volume(volume_id)
            .await?
            .iter()
            .filter(|r| r.kind == OperationKind::CreateSnapshot && r.instance_name != excluding)
            .filter(|r| matches!(r.status, OperationStatus::Success | OperationStatus::InProgress))
            .count())
    }

    /// Retire a record under its own lock
    pub async fn retire(&self, instance_name: &str) -> Result<()> {
        self.acquire(instance_name).await.retire().await
    }

    pub fn store_name(&self) -> &str {
        self.store.store_name()
    }

    /// Instance names currently holding a lock slot
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive handle on one instance name
pub struct LedgerEntry {
    instance_name: String,
    store: OperationStoreRef,
    locks: Arc<KeyedLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LedgerEntry {
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub async fn load(&self) -> Result<Option<OperationRecord>> {
        let record = self.store.get(&self.instance_name).await?;
        debug!(
            "Ledger read {}: {}",
            self.instance_name,
            record.as_ref().map_or("absent".to_string(), |r| r.status.to_string())
        );
        Ok(record)
    }

    /// Persist a record, refusing to regress a sticky terminal state
    pub async fn save(&self, record: &OperationRecord) -> Result<()> {
        if record.instance_name != self.instance_name {
            return Err(Error::Internal(format!(
                "ledger entry {} cannot store record {}",
                self.instance_name, record.instance_name
            )));
        }

        if record.status == OperationStatus::InProgress {
            if let Some(existing) = self.store.get(&self.instance_name).await? {
                if existing.status.is_sticky() {
                    return Err(Error::LedgerTransition {
                        instance_name: self.instance_name.clone(),
                        from: existing.status.to_string(),
                        to: record.status.to_string(),
                    });
                }
            }
        }

        debug!("Ledger write {}: {}", self.instance_name, record.status);
        self.store.put(record).await
    }

    /// Delete the record so the next attempt starts fresh
    pub async fn retire(&self) -> Result<()> {
        debug!("Ledger retire {}", self.instance_name);
        self.store.delete(&self.instance_name).await
    }
}

impl Drop for LedgerEntry {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.instance_name);
    }
}
