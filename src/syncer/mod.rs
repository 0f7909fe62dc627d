//! Background synchronization
//!
//! The storage-pool syncer follows datastore events from the inventory and
//! runs under a [`Supervisor`] that relaunches it after a cooldown.

pub mod storage_pool;
pub mod supervisor;

pub use storage_pool::{ReconcileSchedule, ReconcileSummary, StoragePool, StoragePoolSyncer};
pub use supervisor::Supervisor;

use crate::config::SyncerConfig;
use crate::inventory::StaticTopology;
use crate::metrics::ControllerMetrics;
use std::sync::Arc;
use std::time::Duration;

impl From<&SyncerConfig> for ReconcileSchedule {
    fn from(config: &SyncerConfig) -> Self {
        Self {
            iterations: config.reconcile_all_iterations,
            frequency: Duration::from_secs(config.reconcile_all_frequency_secs),
        }
    }
}

/// Start the storage-pool syncer under supervision
///
/// Every relaunch resubscribes to the topology's events.
pub fn start_storage_pool_syncer(
    config: &SyncerConfig,
    topology: Arc<StaticTopology>,
    metrics: Arc<ControllerMetrics>,
) -> (Arc<StoragePoolSyncer>, Supervisor) {
    let syncer = StoragePoolSyncer::new(topology.clone(), ReconcileSchedule::from(config));
    let supervisor = Supervisor::new(
        "storage-pool-syncer",
        Duration::from_secs(config.restart_cooldown_secs),
    )
    .with_metrics(metrics);

    let body = syncer.clone();
    supervisor.start(move |cancel| body.clone().run(topology.subscribe(), cancel));
    (syncer, supervisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::domain::ports::DatastoreInfo;

    #[tokio::test]
    async fn test_start_and_stop_syncer() {
        let mut config = DriverConfig::default();
        config.datastores.push(DatastoreInfo {
            name: "vsanDatastore".into(),
            url: "ds:///vmfs/volumes/vsanDatastore/".into(),
            capacity_bytes: 1 << 40,
            free_bytes: 1 << 39,
            accessible_nodes: Vec::new(),
            topology: Default::default(),
        });
        let topology = Arc::new(StaticTopology::from_config(&config));
        let metrics = Arc::new(ControllerMetrics::new().unwrap());

        let (syncer, supervisor) = start_storage_pool_syncer(&config.syncer, topology, metrics);
        for _ in 0..200 {
            if !syncer.pools().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(syncer.pools().len(), 1);

        supervisor.stop();
        supervisor.join().await;
        assert_eq!(supervisor.restarts(), 0);
    }
}
