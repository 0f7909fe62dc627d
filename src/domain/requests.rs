//! CSI controller request and response shapes
//!
//! Mirrors the controller half of the Container Storage Interface: capacity
//! ranges in bytes, volume capabilities with access modes, topology segments
//! as string maps and an opaque pagination token.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Delimiter between volume and backend snapshot IDs in a composite ID
pub const SNAPSHOT_ID_DELIMITER: char = '#';

/// Publish context key carrying the attached disk identifier
pub const ATTRIBUTE_DISK_UUID: &str = "diskUUID";

/// Create parameter naming the storage policy
pub const PARAM_STORAGE_POLICY_NAME: &str = "storagepolicyname";

/// Create parameter pinning the datastore
pub const PARAM_DATASTORE_URL: &str = "datastoreurl";

// =============================================================================
// Volume Capabilities
// =============================================================================

/// CSI access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

/// How the volume is consumed on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AccessType {
    Block,
    Mount {
        #[serde(default, rename = "fsType")]
        fs_type: String,
        #[serde(default, rename = "mountFlags")]
        mount_flags: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    pub fn single_writer_mount() -> Self {
        Self {
            access_type: AccessType::Mount {
                fs_type: "ext4".into(),
                mount_flags: Vec::new(),
            },
            access_mode: AccessMode::SingleNodeWriter,
        }
    }

    /// Block volumes served by this driver attach to one node at a time
    pub fn validate(&self) -> Result<()> {
        match self.access_mode {
            AccessMode::MultiNodeMultiWriter | AccessMode::MultiNodeSingleWriter => {
                Err(Error::InvalidArgument(format!(
                    "access mode {:?} is not supported for block volumes",
                    self.access_mode
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Validate a non-empty capability list
pub fn validate_capabilities(capabilities: &[VolumeCapability]) -> Result<()> {
    if capabilities.is_empty() {
        return Err(Error::InvalidArgument(
            "volume capabilities must be provided".into(),
        ));
    }
    capabilities.iter().try_for_each(VolumeCapability::validate)
}

// =============================================================================
// Capacity & Topology
// =============================================================================

/// Requested capacity bounds; zero means unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: u64,
    #[serde(default)]
    pub limit_bytes: u64,
}

impl CapacityRange {
    pub fn required(bytes: u64) -> Self {
        Self {
            required_bytes: bytes,
            limit_bytes: 0,
        }
    }
}

/// Set of topology segments, e.g. `{"topology.csi/zone": "zone-a"}`
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub segments: BTreeMap<String, String>,
}

impl Topology {
    /// True when every segment of `self` is present with the same value in `labels`
    pub fn is_satisfied_by(&self, labels: &BTreeMap<String, String>) -> bool {
        self.segments
            .iter()
            .all(|(k, v)| labels.get(k).map_or(false, |l| l == v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyRequirement {
    #[serde(default)]
    pub requisite: Vec<Topology>,
    #[serde(default)]
    pub preferred: Vec<Topology>,
}

impl TopologyRequirement {
    pub fn is_empty(&self) -> bool {
        self.requisite.iter().chain(self.preferred.iter()).all(|t| t.segments.is_empty())
    }

    /// Segments a placement must satisfy; preferred segments when no requisite is given
    pub fn constraints(&self) -> &[Topology] {
        if self.requisite.is_empty() {
            &self.preferred
        } else {
            &self.requisite
        }
    }
}

// =============================================================================
// Snapshot IDs
// =============================================================================

/// Parsed `<volumeID>#<backendSnapshotID>` identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotHandle {
    pub volume_id: String,
    pub snapshot_id: String,
}

impl SnapshotHandle {
    pub fn new(volume_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            snapshot_id: snapshot_id.into(),
        }
    }

    pub fn parse(composite: &str) -> Result<Self> {
        match composite.split_once(SNAPSHOT_ID_DELIMITER) {
            Some((volume_id, snapshot_id))
                if !volume_id.is_empty()
                    && !snapshot_id.is_empty()
                    && !snapshot_id.contains(SNAPSHOT_ID_DELIMITER) =>
            {
                Ok(Self::new(volume_id, snapshot_id))
            }
            _ => Err(Error::InvalidArgument(format!(
                "snapshot ID {:?} is not of the form <volumeID>{}<snapshotID>",
                composite, SNAPSHOT_ID_DELIMITER
            ))),
        }
    }
}

impl std::fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.volume_id, SNAPSHOT_ID_DELIMITER, self.snapshot_id)
    }
}

// =============================================================================
// Volume RPCs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VolumeContentSource {
    Snapshot {
        #[serde(rename = "snapshotId")]
        snapshot_id: String,
    },
    Volume {
        #[serde(rename = "volumeId")]
        volume_id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_content_source: Option<VolumeContentSource>,
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPublishVolumeRequest {
    #[serde(default)]
    pub volume_id: String,
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPublishVolumeResponse {
    pub publish_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerUnpublishVolumeRequest {
    #[serde(default)]
    pub volume_id: String,
    #[serde(default)]
    pub node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerExpandVolumeRequest {
    #[serde(default)]
    pub volume_id: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

// =============================================================================
// Snapshot RPCs
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub size_bytes: u64,
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub creation_time: DateTime<Utc>,
    pub ready_to_use: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotResponse {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshotsRequest {
    /// Page size; zero returns every remaining entry
    #[serde(default)]
    pub max_entries: u32,
    #[serde(default)]
    pub starting_token: String,
    #[serde(default)]
    pub source_volume_id: String,
    #[serde(default)]
    pub snapshot_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshotsResponse {
    pub entries: Vec<Snapshot>,
    /// Empty once the listing is exhausted
    pub next_token: String,
}
