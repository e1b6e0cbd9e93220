/// Flock error types.
///
/// All failure conditions (administrative validation, control-volume
/// I/O, storage allocation) are represented as a single enum. External
/// tool exit codes are *not* errors; they travel as plain return codes
/// on the affected assignment.

use serde::{Deserialize, Serialize};

/// Unified error type for all flock operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FlockError {
    // Model errors: rejected synchronously at the administrative
    // boundary, never seen by the reconciliation loop
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("name is reserved: {0}")]
    ReservedName(String),
    #[error("invalid address family: {0}")]
    InvalidAddressFamily(String),
    #[error("volume id out of range: {0}")]
    VolumeIdRange(u64),
    #[error("invalid volume size")]
    InvalidSize,
    #[error("node exists already")]
    NodeExists,
    #[error("resource exists already")]
    ResourceExists,
    #[error("volume exists already")]
    VolumeExists,
    #[error("snapshot exists already")]
    SnapshotExists,
    #[error("assignment exists already")]
    AssignmentExists,
    #[error("no node found")]
    NoNode,
    #[error("no resource found")]
    NoResource,
    #[error("no volume found")]
    NoVolume,
    #[error("no snapshot found")]
    NoSnapshot,
    #[error("no assignment found")]
    NoAssignment,
    #[error("no free per-resource node id")]
    FullNodeIds,

    // Control-volume store errors: fatal to the current cycle,
    // retried from scratch on the next one
    #[error("I/O error")]
    Io,
    #[error("control volume is corrupt")]
    CtrlVolCorrupt,
    #[error("control volume is not open")]
    CtrlVolClosed,
    #[error("control volume is open read-only")]
    CtrlVolReadOnly,

    // Backing-store errors: recorded per assignment and retried,
    // except for the unmanaged-device collision
    #[error("no space left in the storage pool")]
    NoSpace,
    #[error("unmanaged block device in the way: {0}")]
    DeviceExists(String),
    #[error("storage plugin error: {0}")]
    StorageError(String),
}

/// Result type alias for flock operations.
pub type FlockResult<T> = Result<T, FlockError>;

impl From<std::io::Error> for FlockError {
    fn from(_: std::io::Error) -> Self {
        FlockError::Io
    }
}
