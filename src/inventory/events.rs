//! Datastore Events
//!
//! Emitted by the topology inventory for the storage-pool syncer to react to.

use serde::{Deserialize, Serialize};

/// Change to the datastore inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatastoreEvent {
    /// Capacity or free space of one datastore changed
    SummaryChanged { url: String },

    /// Datastores appeared, disappeared or changed their host mounts
    TopologyChanged,
}
