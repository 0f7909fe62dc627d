//! Storage-Pool Syncer
//!
//! Keeps one storage pool per shared datastore. A summary change updates the
//! matching pool in place. A topology change schedules a full reconcile to
//! run a fixed number of times at a fixed frequency, since mounts and tags of
//! a newly added host settle lazily on the backend.

use crate::domain::ports::{DatastoreInfo, TopologyProviderRef};
use crate::inventory::DatastoreEvent;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Intended state of a storage pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    pub name: String,
    pub datastore_url: String,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    #[serde(default)]
    pub accessible_nodes: Vec<String>,
}

impl StoragePool {
    fn from_datastore(datastore: &DatastoreInfo) -> Self {
        Self {
            name: storage_pool_name(&datastore.name),
            datastore_url: datastore.url.clone(),
            capacity_bytes: datastore.capacity_bytes,
            free_bytes: datastore.free_bytes,
            accessible_nodes: datastore.accessible_nodes.clone(),
        }
    }
}

/// Pool name for a datastore: lower-case, DNS-label safe
pub fn storage_pool_name(datastore_name: &str) -> String {
    let sanitized: String = datastore_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("storagepool-{}", sanitized.trim_matches('-'))
}

/// Changes applied by one full reconcile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Reconcile schedule after a topology change
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSchedule {
    pub iterations: u32,
    pub frequency: Duration,
}

pub struct StoragePoolSyncer {
    topology: TopologyProviderRef,
    schedule: ReconcileSchedule,
    pools: RwLock<BTreeMap<String, StoragePool>>,
    /// Serializes full reconciles
    reconcile_lock: Mutex<()>,
}

impl StoragePoolSyncer {
    pub fn new(topology: TopologyProviderRef, schedule: ReconcileSchedule) -> Arc<Self> {
        Arc::new(Self {
            topology,
            schedule,
            pools: RwLock::new(BTreeMap::new()),
            reconcile_lock: Mutex::new(()),
        })
    }

    pub fn pools(&self) -> Vec<StoragePool> {
        self.pools.read().values().cloned().collect()
    }

    pub fn pool(&self, name: &str) -> Option<StoragePool> {
        self.pools.read().get(name).cloned()
    }

    /// Add or update pools for every shared datastore and drop unknown ones
    pub async fn reconcile_all(&self) -> crate::error::Result<ReconcileSummary> {
        let _guard = self.reconcile_lock.lock().await;
        let candidates = self.topology.get_shared_candidates(None).await?;

        let mut summary = ReconcileSummary::default();
        let mut pools = self.pools.write();
        let mut valid = BTreeSet::new();
        for datastore in &candidates {
            let intended = StoragePool::from_datastore(datastore);
            valid.insert(intended.name.clone());
            match pools.get(&intended.name) {
                Some(current) if *current == intended => {}
                Some(_) => {
                    summary.updated += 1;
                    pools.insert(intended.name.clone(), intended);
                }
                None => {
                    info!("Adding storage pool {} for {}", intended.name, intended.datastore_url);
                    summary.added += 1;
                    pools.insert(intended.name.clone(), intended);
                }
            }
        }

        let before = pools.len();
        pools.retain(|name, _| {
            let keep = valid.contains(name);
            if !keep {
                info!("Deleting storage pool {}", name);
            }
            keep
        });
        summary.removed = before - pools.len();
        Ok(summary)
    }

    /// Refresh the capacity figures of the pool backed by `url`
    pub async fn update_pool(&self, url: &str) -> crate::error::Result<bool> {
        let datastores = self.topology.list_datastores().await?;
        let Some(datastore) = datastores.into_iter().find(|d| d.url == url) else {
            debug!("Summary change for unknown datastore {}", url);
            return Ok(false);
        };

        let name = storage_pool_name(&datastore.name);
        let mut pools = self.pools.write();
        match pools.get_mut(&name) {
            Some(pool) => {
                pool.capacity_bytes = datastore.capacity_bytes;
                pool.free_bytes = datastore.free_bytes;
                debug!("Updated storage pool {}", name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run `reconcile_all` on the configured schedule in the background
    pub fn schedule_reconcile_all(self: &Arc<Self>, cancel: CancellationToken) {
        let syncer = self.clone();
        let ReconcileSchedule {
            iterations,
            frequency,
        } = self.schedule;

        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + frequency, frequency);
            for iteration in 0..iterations {
                tokio::select! {
                    _ = tick.tick() => {
                        match syncer.reconcile_all().await {
                            Ok(summary) => debug!("[iteration-{}] Reconciled storage pools: {:?}", iteration, summary),
                            Err(e) => error!("[iteration-{}] Error reconciling storage pools: {}", iteration, e),
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
            info!("Scheduled storage pool reconcile completed");
        });
        debug!("Scheduled storage pool reconcile started");
    }

    /// Consume datastore events until cancelled
    ///
    /// Returns an error when the event stream closes so a supervisor can
    /// resubscribe.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<DatastoreEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("Starting storage pool syncer");
        self.reconcile_all().await?;

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel.cancelled() => {
                    info!("Storage pool syncer stopped");
                    return Ok(());
                }
            };

            match event {
                Ok(DatastoreEvent::SummaryChanged { url }) => {
                    if let Err(e) = self.update_pool(&url).await {
                        error!("Error updating storage pool for {}: {}", url, e);
                    }
                }
                Ok(DatastoreEvent::TopologyChanged) => {
                    self.schedule_reconcile_all(cancel.child_token());
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Storage pool syncer missed {} datastore events", missed);
                    self.schedule_reconcile_all(cancel.child_token());
                }
                Err(RecvError::Closed) => {
                    anyhow::bail!("datastore event stream closed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StaticTopology;
    use tokio_test::assert_ok;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn datastore(name: &str, free_gib: u64, nodes: &[&str]) -> DatastoreInfo {
        DatastoreInfo {
            name: name.to_string(),
            url: format!("ds:///vmfs/volumes/{}/", name),
            capacity_bytes: 100 * GIB,
            free_bytes: free_gib * GIB,
            accessible_nodes: nodes.iter().map(|n| n.to_string()).collect(),
            topology: BTreeMap::new(),
        }
    }

    fn fixture() -> (Arc<StaticTopology>, Arc<StoragePoolSyncer>) {
        let nodes = BTreeMap::from([
            ("node-1".to_string(), BTreeMap::new()),
            ("node-2".to_string(), BTreeMap::new()),
        ]);
        let topology = Arc::new(StaticTopology::new(
            vec![
                datastore("vsanDatastore", 50, &[]),
                datastore("local-1", 90, &["node-1"]),
            ],
            nodes,
        ));
        let schedule = ReconcileSchedule {
            iterations: 2,
            frequency: Duration::from_millis(5),
        };
        let syncer = StoragePoolSyncer::new(topology.clone(), schedule);
        (topology, syncer)
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_storage_pool_name() {
        assert_eq!(storage_pool_name("vsanDatastore"), "storagepool-vsandatastore");
        assert_eq!(storage_pool_name("NFS share (1)"), "storagepool-nfs-share--1");
    }

    #[tokio::test]
    async fn test_reconcile_all() {
        let (topology, syncer) = fixture();

        let summary = assert_ok!(syncer.reconcile_all().await);
        assert_eq!(summary.added, 1);
        assert!(syncer.pool("storagepool-vsandatastore").is_some());
        assert!(syncer.pool("storagepool-local-1").is_none());

        topology.upsert_datastore(datastore("nfs-01", 10, &["node-1", "node-2"]));
        topology.remove_datastore("ds:///vmfs/volumes/vsanDatastore/");
        let summary = assert_ok!(syncer.reconcile_all().await);
        assert_eq!(
            summary,
            ReconcileSummary {
                added: 1,
                updated: 0,
                removed: 1
            }
        );
        let names: Vec<_> = syncer.pools().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["storagepool-nfs-01"]);
    }

    #[tokio::test]
    async fn test_summary_event_updates_pool_in_place() {
        let (topology, syncer) = fixture();
        let cancel = CancellationToken::new();
        let events = topology.subscribe();
        let run = tokio::spawn(syncer.clone().run(events, cancel.clone()));

        eventually(|| syncer.pool("storagepool-vsandatastore").is_some()).await;
        assert!(topology.update_summary("ds:///vmfs/volumes/vsanDatastore/", 100 * GIB, 7 * GIB));
        eventually(|| {
            syncer
                .pool("storagepool-vsandatastore")
                .map_or(false, |p| p.free_bytes == 7 * GIB)
        })
        .await;

        cancel.cancel();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_topology_event_schedules_reconcile() {
        let (topology, syncer) = fixture();
        let cancel = CancellationToken::new();
        let events = topology.subscribe();
        let run = tokio::spawn(syncer.clone().run(events, cancel.clone()));

        eventually(|| syncer.pools().len() == 1).await;
        topology.upsert_datastore(datastore("nfs-01", 10, &[]));
        eventually(|| syncer.pool("storagepool-nfs-01").is_some()).await;

        cancel.cancel();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_closed_event_stream_is_an_error() {
        let (_, syncer) = fixture();
        let (tx, events) = broadcast::channel(1);
        drop(tx);

        let result = syncer.run(events, CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
