/// Flock protocol and system constants.

/// Default replication port assigned to the first resource
pub const FLOCK_PORT_BASE: u16 = 7700;

/// Reserved resource name; "all" addresses every resource in
/// administrative commands and can never name a real resource
pub const RES_ALL: &str = "all";

/// Maximum resource name length
pub const RES_NAME_MAX: usize = 48;
/// Maximum node name length (RFC hostname)
pub const NODE_NAME_MAX: usize = 255;
/// Maximum length of a single hostname label
pub const NODE_LABEL_MAX: usize = 63;

/// Highest volume id within a resource (ids run 0..=63)
pub const VOL_ID_MAX: u8 = 63;

/// Highest per-resource node-id (replication protocol limit)
pub const NODE_ID_MAX: u8 = 31;

/// Default number of replication peers assumed for metadata sizing
pub const DEFAULT_PEER_COUNT: u8 = 7;

/// Pool size/free value meaning "not yet known"
pub const POOL_UNKNOWN: i64 = -1;

/// Exit status reserved for "the external tool could not be started"
pub const EXEC_FAILED: i32 = 127;

/// Name of the control-volume resource itself
pub const CTRL_RES_NAME: &str = ".flockctrl";
/// Replication port of the control volume
pub const CTRL_RES_PORT: u16 = 6999;
