//! In-memory operation store
//!
//! DashMap-backed store for standalone mode and tests. Availability can be
//! toggled to exercise ledger outages.

use super::{OperationRecord, OperationStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Non-durable operation store
pub struct MemoryOperationStore {
    records: DashMap<String, OperationRecord>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryOperationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Number of put/delete calls served
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::LedgerUnavailable {
                store: self.store_name().to_string(),
            })
        }
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn get(&self, instance_name: &str) -> Result<Option<OperationRecord>> {
        self.check_available()?;
        Ok(self.records.get(instance_name).map(|r| r.value().clone()))
    }

    async fn put(&self, record: &OperationRecord) -> Result<()> {
        self.check_available()?;
        self.records
            .insert(record.instance_name.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, instance_name: &str) -> Result<()> {
        self.check_available()?;
        self.records.remove(instance_name);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<OperationRecord>> {
        self.check_available()?;
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    fn store_name(&self) -> &str {
        "memory"
    }
}
