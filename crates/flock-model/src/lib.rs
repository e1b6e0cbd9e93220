//! # flock-model
//!
//! Cluster state model for the flock replicated block-device manager.
//!
//! This crate defines the entities that describe a cluster (nodes,
//! resources, volumes, assignments, snapshots), the flag masks and
//! masked mutators that keep them structurally consistent, the global
//! change serial, and the error taxonomy shared by all flock components.
//! It performs no I/O; the daemon crate drives it.

pub mod assignment;
pub mod cluster;
pub mod consts;
pub mod digest;
pub mod error;
pub mod node;
pub mod resource;
pub mod serial;
pub mod sizing;

// Re-export commonly used types at the crate root
pub use assignment::{Assignment, SnapshotAssignment, SnapshotVolumeState, VolumeState};
pub use cluster::ClusterState;
pub use error::{FlockError, FlockResult};
pub use node::{AddressFamily, Node};
pub use resource::{Resource, Snapshot, Volume};
pub use serial::SerialGen;
