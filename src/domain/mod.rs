//! Domain layer - CSI request shapes and port definitions
//!
//! `ports` defines the traits adapters implement; `requests` carries the CSI
//! controller RPC types the lifecycle controllers consume and produce.

pub mod ports;
pub mod requests;

pub use ports::*;
pub use requests::*;
