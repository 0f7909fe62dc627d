//! Node Registry
//!
//! Maps cluster node IDs to the backend VMs that back them. Nodes whose VM
//! has been removed resolve to `None` rather than an error, so unpublish can
//! treat them as already detached.

use crate::config::NodeConfig;
use crate::domain::ports::{NodeResolver, VmHandle};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, VmHandle>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(nodes: &[NodeConfig]) -> Self {
        let registry = Self::new();
        for node in nodes {
            registry.register(&node.node_id, &node.vm_uuid);
        }
        registry
    }

    pub fn register(&self, node_id: &str, vm_uuid: &str) {
        info!("Registering node {} as VM {}", node_id, vm_uuid);
        self.nodes.write().insert(
            node_id.to_string(),
            VmHandle {
                vm_uuid: vm_uuid.to_string(),
                node_name: node_id.to_string(),
            },
        );
    }

    pub fn deregister(&self, node_id: &str) -> Option<VmHandle> {
        self.nodes.write().remove(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

#[async_trait]
impl NodeResolver for NodeRegistry {
    async fn resolve_node(&self, node_id: &str) -> Result<Option<VmHandle>> {
        Ok(self.nodes.read().get(node_id).cloned())
    }
}
