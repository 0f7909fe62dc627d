//! Kubernetes-backed operation store
//!
//! Persists each record as a cluster-scoped `VolumeOperationRequest`. Instance
//! names are mapped onto DNS-1123 resource names; names that need rewriting
//! get a hash suffix so distinct instance names never share a resource.

use super::{OperationRecord, OperationStatus, OperationStore};
use crate::crd::{VolumeOperationRequest, VolumeOperationRequestSpec};
use crate::domain::ports::OperationKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use tracing::{debug, warn};

const MAX_NAME_LEN: usize = 253;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a; resource names must not change across builds
fn stable_hash(value: &str) -> u64 {
    value.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Operation store over `VolumeOperationRequest` custom resources
pub struct KubeOperationStore {
    api: Api<VolumeOperationRequest>,
}

impl KubeOperationStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

/// Map an instance name onto a valid resource name
pub(crate) fn resource_name(instance_name: &str) -> String {
    let mut sanitized: String = instance_name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = sanitized.trim_matches(|c| c == '-' || c == '.').to_string();
    if trimmed == instance_name && trimmed.len() <= MAX_NAME_LEN {
        return trimmed;
    }

    let suffix = format!("{:016x}", stable_hash(instance_name));

    sanitized = trimmed;
    sanitized.truncate(MAX_NAME_LEN - suffix.len() - 1);
    let prefix = sanitized.trim_end_matches(|c| c == '-' || c == '.');
    if prefix.is_empty() {
        format!("op-{}", suffix)
    } else {
        format!("{}-{}", prefix, suffix)
    }
}

fn parse_status(status: &str) -> Result<OperationStatus> {
    match status {
        "InProgress" => Ok(OperationStatus::InProgress),
        "Success" => Ok(OperationStatus::Success),
        "Failed" => Ok(OperationStatus::Failed),
        "PartiallyFailed" => Ok(OperationStatus::PartiallyFailed),
        other => Err(Error::Internal(format!("unknown ledger status {:?}", other))),
    }
}

fn parse_kind(kind: &str) -> Result<OperationKind> {
    serde_json::from_value(serde_json::Value::String(kind.to_string()))
        .map_err(|_| Error::Internal(format!("unknown operation kind {:?}", kind)))
}

impl From<&OperationRecord> for VolumeOperationRequestSpec {
    fn from(record: &OperationRecord) -> Self {
        Self {
            instance_name: record.instance_name.clone(),
            kind: record.kind.to_string(),
            volume_id: record.volume_id.clone(),
            snapshot_id: record.snapshot_id.clone(),
            capacity_hint: record.capacity_hint,
            resolved_capacity: record.resolved_capacity,
            fingerprint: record.fingerprint.clone(),
            task_id: record.task_id.clone(),
            status: record.status.to_string(),
            error_message: record.error_message.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            subject_created_at: record.subject_created_at,
            attempts: record.attempts,
        }
    }
}

impl TryFrom<VolumeOperationRequestSpec> for OperationRecord {
    type Error = Error;

    fn try_from(spec: VolumeOperationRequestSpec) -> Result<Self> {
        Ok(Self {
            kind: parse_kind(&spec.kind)?,
            status: parse_status(&spec.status)?,
            instance_name: spec.instance_name,
            volume_id: spec.volume_id,
            snapshot_id: spec.snapshot_id,
            capacity_hint: spec.capacity_hint,
            resolved_capacity: spec.resolved_capacity,
            fingerprint: spec.fingerprint,
            task_id: spec.task_id,
            error_message: spec.error_message,
            created_at: spec.created_at,
            updated_at: spec.updated_at,
            subject_created_at: spec.subject_created_at,
            attempts: spec.attempts,
        })
    }
}

#[async_trait]
impl OperationStore for KubeOperationStore {
    async fn get(&self, instance_name: &str) -> Result<Option<OperationRecord>> {
        match self.api.get_opt(&resource_name(instance_name)).await? {
            Some(resource) if resource.spec.instance_name == instance_name => {
                Ok(Some(resource.spec.try_into()?))
            }
            Some(resource) => Err(Error::Internal(format!(
                "resource {} holds instance {} instead of {}",
                resource_name(instance_name),
                resource.spec.instance_name,
                instance_name
            ))),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &OperationRecord) -> Result<()> {
        let name = resource_name(&record.instance_name);
        let spec = VolumeOperationRequestSpec::from(record);

        match self.api.get_opt(&name).await? {
            Some(mut existing) => {
                existing.spec = spec;
                self.api
                    .replace(&name, &PostParams::default(), &existing)
                    .await?;
                debug!("Updated VolumeOperationRequest {}", name);
            }
            None => {
                let resource = VolumeOperationRequest {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        ..Default::default()
                    },
                    spec,
                };
                self.api.create(&PostParams::default(), &resource).await?;
                debug!("Created VolumeOperationRequest {}", name);
            }
        }

        Ok(())
    }

    async fn delete(&self, instance_name: &str) -> Result<()> {
        match self
            .api
            .delete(&resource_name(instance_name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<OperationRecord>> {
        let resources = self.api.list(&ListParams::default()).await?.items;
        Ok(decode_resources(resources))
    }

    fn store_name(&self) -> &str {
        "kubernetes"
    }
}

/// Records of every readable resource; malformed ones are skipped
fn decode_resources(resources: Vec<VolumeOperationRequest>) -> Vec<OperationRecord> {
    resources
        .into_iter()
        .filter_map(|resource| {
            let name = resource.metadata.name.clone().unwrap_or_default();
            match OperationRecord::try_from(resource.spec) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping unreadable ledger resource {}: {}", name, e);
                    None
                }
            }
        })
        .collect()
}
