//! Quota and policy guards
//!
//! Pure checks run before any backend task is submitted. Callers supply the
//! inputs (ledger counts, snapshot sizes, configured categories) so the rules
//! can be tested without a ledger or backend.

use crate::domain::requests::{CapacityRange, TopologyRequirement};
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Legacy in-tree volume IDs are datastore paths to a VMDK
pub fn is_migrated_volume_id(volume_id: &str) -> bool {
    volume_id.contains(".vmdk")
}

/// Reject a new snapshot once the confirmed count reaches the configured maximum
pub fn check_snapshot_quota(confirmed: usize, max_snapshots: u32, volume_id: &str) -> Result<()> {
    if confirmed >= max_snapshots as usize {
        return Err(Error::FailedPrecondition(format!(
            "the number of snapshots on the source volume {} reaches the configured maximum ({})",
            volume_id, max_snapshots
        )));
    }
    Ok(())
}

/// Size of a volume restored from a snapshot
///
/// An unset requested size adopts the snapshot's size; any other value must
/// match it exactly.
pub fn check_restore_capacity(requested_bytes: u64, snapshot_bytes: u64, snapshot_id: &str) -> Result<u64> {
    if requested_bytes == 0 || requested_bytes == snapshot_bytes {
        return Ok(snapshot_bytes);
    }
    Err(Error::InvalidArgument(format!(
        "requested volume size {} must be the same as the size {} of source snapshot {}",
        requested_bytes, snapshot_bytes, snapshot_id
    )))
}

/// Placement constraints need a topology-category mapping to be honoured
pub fn check_topology(requirement: Option<&TopologyRequirement>, categories: &[String]) -> Result<()> {
    match requirement {
        Some(requirement) if !requirement.is_empty() && categories.is_empty() => {
            Err(Error::InvalidArgument(
                "volume topology requirements are given but topology-aware provisioning is not configured"
                    .into(),
            ))
        }
        _ => Ok(()),
    }
}

/// Round a byte count up to whole MiB
pub fn round_up_to_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB) * MIB
}

/// Resolve the size to provision from a capacity range
///
/// Unset or zero `required_bytes` falls back to `default_bytes`. The result is
/// rounded up to whole MiB and must not exceed a non-zero `limit_bytes`.
pub fn resolve_capacity(range: Option<&CapacityRange>, default_bytes: u64) -> Result<u64> {
    let range = range.copied().unwrap_or_default();
    if range.limit_bytes != 0 && range.required_bytes > range.limit_bytes {
        return Err(Error::InvalidArgument(format!(
            "required bytes {} exceed limit bytes {}",
            range.required_bytes, range.limit_bytes
        )));
    }

    let requested = if range.required_bytes == 0 {
        default_bytes
    } else {
        range.required_bytes
    };
    let rounded = round_up_to_mib(requested);
    if range.limit_bytes != 0 && rounded > range.limit_bytes {
        return Err(Error::InvalidArgument(format!(
            "volume size {} rounded to whole MiB exceeds limit bytes {}",
            rounded, range.limit_bytes
        )));
    }
    Ok(rounded)
}
