//! Custom Resource Definitions for the volume controller
//!
//! - VolumeOperationRequest: durable operation-ledger record

pub mod volume_operation_request;

pub use volume_operation_request::*;
