//! Static Topology Provider
//!
//! Datastore inventory built from the driver configuration. A datastore is a
//! shared candidate when every node selected by the placement constraints can
//! reach it; candidates are ranked by free space.

use super::events::DatastoreEvent;
use crate::config::DriverConfig;
use crate::domain::ports::{DatastoreInfo, TopologyProvider};
use crate::domain::requests::TopologyRequirement;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Configuration-driven datastore and topology inventory
pub struct StaticTopology {
    /// Datastores by URL
    datastores: RwLock<BTreeMap<String, DatastoreInfo>>,
    /// Node ID to topology segments
    nodes: BTreeMap<String, BTreeMap<String, String>>,
    events: broadcast::Sender<DatastoreEvent>,
}

impl StaticTopology {
    pub fn new(
        datastores: Vec<DatastoreInfo>,
        nodes: BTreeMap<String, BTreeMap<String, String>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            datastores: RwLock::new(datastores.into_iter().map(|d| (d.url.clone(), d)).collect()),
            nodes,
            events,
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        let nodes = config
            .nodes
            .iter()
            .map(|n| (n.node_id.clone(), n.topology.clone()))
            .collect();
        Self::new(config.datastores.clone(), nodes)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatastoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DatastoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Update capacity figures of one datastore; returns false when unknown
    pub fn update_summary(&self, url: &str, capacity_bytes: u64, free_bytes: u64) -> bool {
        let updated = match self.datastores.write().get_mut(url) {
            Some(datastore) => {
                datastore.capacity_bytes = capacity_bytes;
                datastore.free_bytes = free_bytes;
                true
            }
            None => false,
        };
        if updated {
            self.emit(DatastoreEvent::SummaryChanged { url: url.to_string() });
        }
        updated
    }

    pub fn upsert_datastore(&self, datastore: DatastoreInfo) {
        debug!("Datastore {} added or remounted", datastore.url);
        self.datastores.write().insert(datastore.url.clone(), datastore);
        self.emit(DatastoreEvent::TopologyChanged);
    }

    pub fn remove_datastore(&self, url: &str) -> Option<DatastoreInfo> {
        let removed = self.datastores.write().remove(url);
        if removed.is_some() {
            debug!("Datastore {} removed", url);
            self.emit(DatastoreEvent::TopologyChanged);
        }
        removed
    }

    pub fn datastore(&self, url: &str) -> Option<DatastoreInfo> {
        self.datastores.read().get(url).cloned()
    }

    /// Nodes satisfying the placement constraints; all nodes without any
    fn selected_nodes(&self, requirement: Option<&TopologyRequirement>) -> Vec<&str> {
        let constraints = match requirement {
            Some(requirement) if !requirement.is_empty() => requirement.constraints(),
            _ => return self.nodes.keys().map(String::as_str).collect(),
        };
        self.nodes
            .iter()
            .filter(|(_, labels)| constraints.iter().any(|t| t.is_satisfied_by(labels)))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

fn is_shared(datastore: &DatastoreInfo, nodes: &[&str]) -> bool {
    datastore.accessible_nodes.is_empty()
        || nodes
            .iter()
            .all(|n| datastore.accessible_nodes.iter().any(|a| a == n))
}

#[async_trait]
impl TopologyProvider for StaticTopology {
    async fn get_shared_candidates(
        &self,
        requirement: Option<&TopologyRequirement>,
    ) -> Result<Vec<DatastoreInfo>> {
        let constrained = requirement.map_or(false, |r| !r.is_empty());
        let nodes = self.selected_nodes(requirement);
        if constrained && nodes.is_empty() {
            debug!("No nodes satisfy the placement constraints");
            return Ok(Vec::new());
        }

        let mut candidates: Vec<DatastoreInfo> = self
            .datastores
            .read()
            .values()
            .filter(|d| is_shared(d, &nodes))
            .filter(|d| {
                !constrained
                    || d.topology.is_empty()
                    || requirement
                        .map_or(true, |r| r.constraints().iter().any(|t| t.is_satisfied_by(&d.topology)))
            })
            .cloned()
            .collect();

        candidates.sort_by(|a, b| b.free_bytes.cmp(&a.free_bytes).then_with(|| a.url.cmp(&b.url)));
        Ok(candidates)
    }

    async fn list_datastores(&self) -> Result<Vec<DatastoreInfo>> {
        Ok(self.datastores.read().values().cloned().collect())
    }
}
