//! VolumeOperationRequest CRD
//!
//! Cluster-scoped custom resource persisting one operation-ledger record, so
//! in-flight backend tasks survive controller restarts and failovers.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Persisted state of one idempotent backend operation
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "csi.billyronks.io",
    version = "v1alpha1",
    kind = "VolumeOperationRequest",
    plural = "volumeoperationrequests",
    shortname = "vor",
    printcolumn = r#"{"name": "Kind", "type": "string", "jsonPath": ".spec.kind"}"#,
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeId"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".spec.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeOperationRequestSpec {
    /// Unsanitized instance name; the resource name may be a hashed form
    pub instance_name: String,

    /// Operation kind, e.g. "create-snapshot"
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_hint: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_capacity: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(default)]
    pub task_id: String,

    /// InProgress, Success, Failed or PartiallyFailed
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[schemars(with = "String")]
    pub created_at: DateTime<Utc>,

    #[schemars(with = "String")]
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub subject_created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub attempts: u32,
}
