//! Static collaborators
//!
//! Configuration-driven implementations of the topology, storage-policy and
//! node-identity ports, used in standalone mode and in tests.

pub mod events;
pub mod nodes;
pub mod policy;
pub mod topology;

pub use events::DatastoreEvent;
pub use nodes::NodeRegistry;
pub use policy::StaticPolicyResolver;
pub use topology::StaticTopology;
