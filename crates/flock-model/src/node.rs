/// Cluster node entity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::consts::{NODE_LABEL_MAX, NODE_NAME_MAX, POOL_UNKNOWN};
use crate::error::{FlockError, FlockResult};
use crate::serial::SerialGen;

/// Node state flags.
pub const NODE_FLAG_REMOVE: u64 = 0x1;
/// Peer membership changed; the node must regenerate its local
/// control-volume connection configuration.
pub const NODE_FLAG_UPDATE: u64 = 0x2;
/// The node carries a replica of the control volume.
pub const NODE_FLAG_CONTROL_ROLE: u64 = 0x4;
/// The node contributes backing storage (not a pure client).
pub const NODE_FLAG_STORAGE_ROLE: u64 = 0x8;
/// A storage-capacity refresh is pending for this node.
pub const NODE_FLAG_POOL_UPDATE: u64 = 0x10;

/// Mask of all valid node flags. Mutators re-mask their input against
/// this, so unknown bits can never be persisted.
pub const NODE_FLAGS_MASK: u64 = NODE_FLAG_REMOVE
    | NODE_FLAG_UPDATE
    | NODE_FLAG_CONTROL_ROLE
    | NODE_FLAG_STORAGE_ROLE
    | NODE_FLAG_POOL_UPDATE;

/// Address family of a node's replication address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// The keyword used for this family in generated configuration.
    pub fn label(self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "ipv4",
            AddressFamily::Ipv6 => "ipv6",
        }
    }
}

impl FromStr for AddressFamily {
    type Err = FlockError;

    fn from_str(s: &str) -> FlockResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" => Ok(AddressFamily::Ipv4),
            "ipv6" => Ok(AddressFamily::Ipv6),
            other => Err(FlockError::InvalidAddressFamily(other.to_string())),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A cluster member node.
///
/// Assignments are not stored here; they live in the `ClusterState`
/// arena keyed by (node, resource), so the node itself stays free of
/// back references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node name (RFC-hostname-like).
    name: String,
    /// Replication network address.
    addr: String,
    /// Address family of `addr`.
    af: AddressFamily,
    /// State flags, always a subset of `NODE_FLAGS_MASK`.
    flags: u64,
    /// Storage pool size in kiB (POOL_UNKNOWN until first refresh).
    poolsize: i64,
    /// Storage pool free space in kiB (POOL_UNKNOWN until first refresh).
    poolfree: i64,
}

impl Node {
    pub fn new(name: &str, addr: &str, af: AddressFamily) -> FlockResult<Self> {
        check_node_name(name)?;
        Ok(Self {
            name: name.to_string(),
            addr: addr.to_string(),
            af,
            flags: 0,
            poolsize: POOL_UNKNOWN,
            poolfree: POOL_UNKNOWN,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn af(&self) -> AddressFamily {
        self.af
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn poolsize(&self) -> i64 {
        self.poolsize
    }

    pub fn poolfree(&self) -> i64 {
        self.poolfree
    }

    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag == flag
    }

    /// Replace the flag set (masked). Bumps the serial only on change.
    pub fn set_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        let masked = flags & NODE_FLAGS_MASK;
        if masked != self.flags {
            self.flags = masked;
            serial.next_serial();
        }
    }

    pub fn raise_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_flags(self.flags | flags, serial);
    }

    pub fn clear_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_flags(self.flags & !flags, serial);
    }

    /// Update pool telemetry. Returns true if either value changed.
    pub fn set_pool(&mut self, size: i64, free: i64, serial: &mut SerialGen) -> bool {
        if size != self.poolsize || free != self.poolfree {
            self.poolsize = size;
            self.poolfree = free;
            serial.next_serial();
            true
        } else {
            false
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.name, self.af.label(), self.addr)
    }
}

/// Validate a node name against RFC-hostname-like constraints:
/// non-empty, at most 255 characters, dot-separated labels of at most
/// 63 alphanumeric-or-hyphen characters, no label starting or ending
/// with a hyphen.
pub fn check_node_name(name: &str) -> FlockResult<()> {
    if name.is_empty() || name.len() > NODE_NAME_MAX {
        return Err(FlockError::InvalidName(name.to_string()));
    }
    for label in name.split('.') {
        let ok = !label.is_empty()
            && label.len() <= NODE_LABEL_MAX
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !ok {
            return Err(FlockError::InvalidName(name.to_string()));
        }
    }
    Ok(())
}
