//! Static storage-policy resolver

use crate::config::PolicyConfig;
use crate::domain::ports::{DatastoreInfo, PolicyResolver};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Policy name/ID table with per-policy datastore compatibility
pub struct StaticPolicyResolver {
    by_name: HashMap<String, PolicyConfig>,
    by_id: HashMap<String, PolicyConfig>,
}

impl StaticPolicyResolver {
    pub fn new(policies: &[PolicyConfig]) -> Self {
        Self {
            by_name: policies.iter().map(|p| (p.name.clone(), p.clone())).collect(),
            by_id: policies.iter().map(|p| (p.id.clone(), p.clone())).collect(),
        }
    }
}

#[async_trait]
impl PolicyResolver for StaticPolicyResolver {
    async fn resolve_policy_id(&self, name: &str) -> Result<String> {
        self.by_name
            .get(name)
            .map(|p| p.id.clone())
            .ok_or_else(|| Error::InvalidArgument(format!("storage policy {:?} not found", name)))
    }

    async fn check_compatibility(&self, policy_id: &str, datastore: &DatastoreInfo) -> Result<bool> {
        let policy = self
            .by_id
            .get(policy_id)
            .ok_or_else(|| Error::Internal(format!("unknown storage policy ID {}", policy_id)))?;
        Ok(policy.compatible_datastores.is_empty()
            || policy.compatible_datastores.iter().any(|u| *u == datastore.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn datastore(url: &str) -> DatastoreInfo {
        DatastoreInfo {
            name: "ds".into(),
            url: url.into(),
            capacity_bytes: 0,
            free_bytes: 0,
            accessible_nodes: vec![],
            topology: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_resolve_and_check() {
        let resolver = StaticPolicyResolver::new(&[
            PolicyConfig {
                name: "vSAN Default Storage Policy".into(),
                id: "aa6d5a82-1c88-45da-85d3-3d74b91a5bad".into(),
                compatible_datastores: vec!["ds:///vmfs/volumes/vsan/".into()],
            },
            PolicyConfig {
                name: "any".into(),
                id: "policy-any".into(),
                compatible_datastores: vec![],
            },
        ]);

        let id = resolver
            .resolve_policy_id("vSAN Default Storage Policy")
            .await
            .unwrap();
        assert!(resolver
            .check_compatibility(&id, &datastore("ds:///vmfs/volumes/vsan/"))
            .await
            .unwrap());
        assert!(!resolver
            .check_compatibility(&id, &datastore("ds:///vmfs/volumes/nfs/"))
            .await
            .unwrap());
        assert!(resolver
            .check_compatibility("policy-any", &datastore("ds:///vmfs/volumes/nfs/"))
            .await
            .unwrap());

        assert_matches!(
            resolver.resolve_policy_id("gold").await,
            Err(Error::InvalidArgument(_))
        );
    }
}
