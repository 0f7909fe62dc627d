//! CSI Volume Controller
//!
//! Controller half of a CSI driver for block volumes and snapshots on a
//! task-based storage backend. Every mutating verb is made idempotent through
//! an operation ledger, so duplicate and concurrent retries converge on one
//! backend mutation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                   REST API (/csi/v1, axum)                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────┐          ┌────────────────────────────┐  │
//! │  │   Volume Controller    │          │    Snapshot Controller     │  │
//! │  │ create/delete/expand/  │          │  create/delete/list        │  │
//! │  │ publish/unpublish      │          │                            │  │
//! │  └───────────┬────────────┘          └─────────────┬──────────────┘  │
//! │              └──────────────┬──────────────────────┘                 │
//! │        ┌────────────────────┼──────────────────────────┐             │
//! │        ▼                    ▼                          ▼             │
//! │  Operation Ledger     Task Client            Inventory (topology,    │
//! │  (memory/file/CRD)    (submit + poll)        policies, nodes)        │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │           Task-based storage backend   ◀──  Storage-pool syncer      │
//! │                                             (supervised)             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Volume and snapshot lifecycle controllers
//! - [`ledger`]: Operation ledger and its stores
//! - [`backend`]: Task client and the in-memory backend
//! - [`inventory`]: Datastore topology, storage policies and node identity
//! - [`syncer`]: Storage-pool syncer and its supervisor
//! - [`api`]: REST surface
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod api;
pub mod backend;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod inventory;
pub mod ledger;
pub mod metrics;
pub mod syncer;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use backend::{InMemoryBackend, TaskClient, TaskClientConfig, TaskCompletion};

pub use config::{DriverConfig, LedgerBackend};

pub use controller::{ControllerConfig, ControllerDeps, ControllerService};

pub use crd::{VolumeOperationRequest, VolumeOperationRequestSpec};

pub use domain::ports::{
    BackendTaskClient, NodeResolver, OperationKind, PolicyResolver, TaskRequest, TopologyProvider,
};

pub use error::{Code, Error, Result};

pub use inventory::{NodeRegistry, StaticPolicyResolver, StaticTopology};

pub use ledger::{
    FileOperationStore, KubeOperationStore, MemoryOperationStore, OperationLedger, OperationRecord,
    OperationStatus, OperationStore,
};

pub use metrics::ControllerMetrics;

pub use syncer::{StoragePoolSyncer, Supervisor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
