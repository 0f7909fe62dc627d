//! Storage backend adapters
//!
//! - [`TaskClient`]: retry and poll policy over any [`BackendTaskClient`]
//! - [`InMemoryBackend`]: self-contained task-based backend used in
//!   standalone mode and throughout the test suite
//!
//! [`BackendTaskClient`]: crate::domain::ports::BackendTaskClient

mod memory;
mod task;

pub use memory::InMemoryBackend;
pub use task::{TaskClient, TaskClientConfig, TaskCompletion};
