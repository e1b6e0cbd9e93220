/// Resource, volume and snapshot entities.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::consts::{RES_ALL, RES_NAME_MAX, VOL_ID_MAX};
use crate::error::{FlockError, FlockResult};
use crate::serial::SerialGen;

/// Resource/volume/snapshot state flags. All three entities share the
/// single REMOVE flag; their masks admit nothing else.
pub const RES_FLAG_REMOVE: u64 = 0x1;
pub const RES_FLAGS_MASK: u64 = RES_FLAG_REMOVE;

pub const VOL_FLAG_REMOVE: u64 = 0x1;
pub const VOL_FLAGS_MASK: u64 = VOL_FLAG_REMOVE;

pub const SNAP_FLAG_REMOVE: u64 = 0x1;
pub const SNAP_FLAGS_MASK: u64 = SNAP_FLAG_REMOVE;

/// Volume-state property carrying the snapshot-restore source device.
/// When present on a volume-state's target, deployment restores from
/// that snapshot device instead of allocating empty storage.
pub const PROP_RESTORE_SOURCE: &str = "restore-source";

/// One numbered data disk within a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    id: u8,
    /// Net (usable) size in kiB; the backing device is larger by the
    /// replication metadata overhead.
    size_kib: u64,
    /// Minor device number of the replicated device.
    minor: u32,
    flags: u64,
    props: BTreeMap<String, String>,
}

impl Volume {
    pub fn new(id: u8, size_kib: u64, minor: u32) -> FlockResult<Self> {
        if id > VOL_ID_MAX {
            return Err(FlockError::VolumeIdRange(id as u64));
        }
        if size_kib == 0 {
            return Err(FlockError::InvalidSize);
        }
        Ok(Self {
            id,
            size_kib,
            minor,
            flags: 0,
            props: BTreeMap::new(),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn size_kib(&self) -> u64 {
        self.size_kib
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag == flag
    }

    pub fn set_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        let masked = flags & VOL_FLAGS_MASK;
        if masked != self.flags {
            self.flags = masked;
            serial.next_serial();
        }
    }

    pub fn raise_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_flags(self.flags | flags, serial);
    }

    pub fn props(&self) -> &BTreeMap<String, String> {
        &self.props
    }

    pub fn set_prop(&mut self, key: &str, value: &str, serial: &mut SerialGen) {
        if self.props.get(key).map(String::as_str) != Some(value) {
            self.props.insert(key.to_string(), value.to_string());
            serial.next_serial();
        }
    }
}

/// A point-in-time snapshot of a resource. Records which volume ids
/// existed when the snapshot was taken; the per-node deployment state
/// lives in each assignment's `SnapshotAssignment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    name: String,
    /// Volume ids captured by this snapshot.
    volumes: Vec<u8>,
    flags: u64,
}

impl Snapshot {
    pub fn new(name: &str, volumes: Vec<u8>) -> FlockResult<Self> {
        check_res_name(name)?;
        Ok(Self {
            name: name.to_string(),
            volumes,
            flags: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volumes(&self) -> &[u8] {
        &self.volumes
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag == flag
    }

    pub fn set_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        let masked = flags & SNAP_FLAGS_MASK;
        if masked != self.flags {
            self.flags = masked;
            serial.next_serial();
        }
    }
}

/// The named replicated object that is deployed to nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    name: String,
    /// Replication network port shared by all volumes of the resource.
    port: u16,
    /// Shared secret for peer authentication.
    secret: String,
    flags: u64,
    volumes: BTreeMap<u8, Volume>,
    snapshots: BTreeMap<String, Snapshot>,
}

impl Resource {
    pub fn new(name: &str, port: u16, secret: &str) -> FlockResult<Self> {
        check_res_name(name)?;
        Ok(Self {
            name: name.to_string(),
            port,
            secret: secret.to_string(),
            flags: 0,
            volumes: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag == flag
    }

    pub fn set_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        let masked = flags & RES_FLAGS_MASK;
        if masked != self.flags {
            self.flags = masked;
            serial.next_serial();
        }
    }

    pub fn raise_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_flags(self.flags | flags, serial);
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    pub fn volume(&self, id: u8) -> Option<&Volume> {
        self.volumes.get(&id)
    }

    pub fn volume_mut(&mut self, id: u8) -> Option<&mut Volume> {
        self.volumes.get_mut(&id)
    }

    /// Insert a new volume at the smallest free id.
    pub fn add_volume(&mut self, size_kib: u64, minor: u32, serial: &mut SerialGen) -> FlockResult<u8> {
        let id = (0..=VOL_ID_MAX)
            .find(|id| !self.volumes.contains_key(id))
            .ok_or(FlockError::VolumeIdRange(VOL_ID_MAX as u64 + 1))?;
        self.volumes.insert(id, Volume::new(id, size_kib, minor)?);
        serial.next_serial();
        Ok(id)
    }

    pub fn remove_volume_entry(&mut self, id: u8) -> Option<Volume> {
        self.volumes.remove(&id)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.values()
    }

    pub fn snapshot(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.get(name)
    }

    pub fn snapshot_mut(&mut self, name: &str) -> Option<&mut Snapshot> {
        self.snapshots.get_mut(name)
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot, serial: &mut SerialGen) -> FlockResult<()> {
        if self.snapshots.contains_key(snapshot.name()) {
            return Err(FlockError::SnapshotExists);
        }
        self.snapshots.insert(snapshot.name().to_string(), snapshot);
        serial.next_serial();
        Ok(())
    }

    pub fn remove_snapshot_entry(&mut self, name: &str) -> Option<Snapshot> {
        self.snapshots.remove(name)
    }
}

/// Validate a resource or snapshot name: starts with a letter, then
/// letters, digits, '-' or '_', at most RES_NAME_MAX characters. The
/// literal token "all" is reserved.
pub fn check_res_name(name: &str) -> FlockResult<()> {
    if name == RES_ALL {
        return Err(FlockError::ReservedName(name.to_string()));
    }
    let mut chars = name.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !head_ok || !tail_ok || name.len() > RES_NAME_MAX {
        return Err(FlockError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_res_name_validation() {
        assert!(check_res_name("r1").is_ok());
        assert!(check_res_name("web_data-01").is_ok());
        assert!(check_res_name("all").is_err());
        assert!(check_res_name("1r").is_err());
        assert!(check_res_name("").is_err());
        assert!(check_res_name("has space").is_err());
    }

    #[test]
    fn test_volume_id_range() {
        assert!(Volume::new(63, 1024, 100).is_ok());
        assert!(matches!(
            Volume::new(64, 1024, 100),
            Err(FlockError::VolumeIdRange(64))
        ));
    }

    #[test]
    fn test_volume_size_invalid() {
        assert!(matches!(Volume::new(0, 0, 100), Err(FlockError::InvalidSize)));
    }

    #[test]
    fn test_add_volume_allocates_smallest_free_id() {
        let mut serial = SerialGen::default();
        let mut res = Resource::new("r1", 7700, "secret").unwrap();
        assert_eq!(res.add_volume(1024, 100, &mut serial).unwrap(), 0);
        assert_eq!(res.add_volume(1024, 101, &mut serial).unwrap(), 1);
        res.remove_volume_entry(0);
        assert_eq!(res.add_volume(1024, 102, &mut serial).unwrap(), 0);
    }

    #[test]
    fn test_resource_flags_masked() {
        let mut serial = SerialGen::default();
        let mut res = Resource::new("r1", 7700, "secret").unwrap();
        res.set_flags(u64::MAX, &mut serial);
        assert_eq!(res.flags(), RES_FLAGS_MASK);
    }
}
