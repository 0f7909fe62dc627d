//! API Module
//!
//! JSON surface over the controller verbs and its server lifecycle.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
