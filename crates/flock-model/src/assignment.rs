/// Assignment entities: the (node, resource) join records that the
/// reconciliation engine converges.
///
/// Every assignment carries two bitmasks: `cstate` (observed) and
/// `tstate` (desired). The engine's `requires_*` predicates compare the
/// two; the action flags live in the tstate only and are never valid in
/// a cstate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::serial::SerialGen;

/// Deployment state flags, valid in both cstate and tstate.
pub const STATE_DEPLOY: u64 = 0x1;
pub const STATE_CONNECT: u64 = 0x2;
/// Client-only replication role: no local backing storage.
pub const STATE_DISKLESS: u64 = 0x4;

pub const STATE_MASK: u64 = STATE_DEPLOY | STATE_CONNECT | STATE_DISKLESS;

/// Action flags, valid in the tstate only. Each one requests a
/// one-shot action and is cleared once that action has run.
///
/// Reconcile the peer connection set after membership changed.
pub const ACT_UPDCON: u64 = 0x0001_0000;
/// Drop and re-establish connections (split-brain resolution).
pub const ACT_RECONNECT: u64 = 0x0002_0000;
/// This node's data overwrites its peers on (re)connect.
pub const ACT_OVERWRITE: u64 = 0x0004_0000;
/// This node discards its local data in favor of a peer's.
pub const ACT_DISCARD: u64 = 0x0008_0000;

pub const ACT_MASK: u64 = ACT_UPDCON | ACT_RECONNECT | ACT_OVERWRITE | ACT_DISCARD;

pub const CSTATE_MASK: u64 = STATE_MASK;
pub const TSTATE_MASK: u64 = STATE_MASK | ACT_MASK;

/// Volume-state flags (per assignment, per volume).
pub const VSTATE_DEPLOY: u64 = 0x1;
pub const VSTATE_ATTACH: u64 = 0x2;
pub const VSTATE_MASK: u64 = VSTATE_DEPLOY | VSTATE_ATTACH;

/// Snapshot volume-state flags.
pub const SVSTATE_DEPLOY: u64 = 0x1;
pub const SVSTATE_MASK: u64 = SVSTATE_DEPLOY;

/// Per-assignment, per-volume deployment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeState {
    id: u8,
    cstate: u64,
    tstate: u64,
    /// Backing block device path once allocated; None = not yet backed.
    bd_name: Option<String>,
    props: BTreeMap<String, String>,
}

impl VolumeState {
    pub fn new(id: u8, tstate: u64) -> Self {
        Self {
            id,
            cstate: 0,
            tstate: tstate & VSTATE_MASK,
            bd_name: None,
            props: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn cstate(&self) -> u64 {
        self.cstate
    }

    pub fn tstate(&self) -> u64 {
        self.tstate
    }

    pub fn bd_name(&self) -> Option<&str> {
        self.bd_name.as_deref()
    }

    pub fn props(&self) -> &BTreeMap<String, String> {
        &self.props
    }

    pub fn set_cstate(&mut self, cstate: u64, serial: &mut SerialGen) {
        let masked = cstate & VSTATE_MASK;
        if masked != self.cstate {
            self.cstate = masked;
            serial.next_serial();
        }
    }

    pub fn set_tstate(&mut self, tstate: u64, serial: &mut SerialGen) {
        let masked = tstate & VSTATE_MASK;
        if masked != self.tstate {
            self.tstate = masked;
            serial.next_serial();
        }
    }

    pub fn set_cstate_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_cstate(self.cstate | flags, serial);
    }

    pub fn clear_cstate_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_cstate(self.cstate & !flags, serial);
    }

    pub fn set_bd_name(&mut self, bd_name: Option<String>, serial: &mut SerialGen) {
        if bd_name != self.bd_name {
            self.bd_name = bd_name;
            serial.next_serial();
        }
    }

    pub fn set_prop(&mut self, key: &str, value: &str, serial: &mut SerialGen) {
        if self.props.get(key).map(String::as_str) != Some(value) {
            self.props.insert(key.to_string(), value.to_string());
            serial.next_serial();
        }
    }

    pub fn clear_prop(&mut self, key: &str, serial: &mut SerialGen) {
        if self.props.remove(key).is_some() {
            serial.next_serial();
        }
    }

    pub fn requires_deploy(&self) -> bool {
        self.tstate & VSTATE_DEPLOY != 0 && self.cstate & VSTATE_DEPLOY == 0
    }

    pub fn requires_undeploy(&self) -> bool {
        self.tstate & VSTATE_DEPLOY == 0 && self.cstate & VSTATE_DEPLOY != 0
    }

    pub fn requires_attach(&self) -> bool {
        self.tstate & VSTATE_ATTACH != 0 && self.cstate & VSTATE_ATTACH == 0
    }

    pub fn requires_detach(&self) -> bool {
        self.tstate & VSTATE_ATTACH == 0 && self.cstate & VSTATE_ATTACH != 0
    }

    pub fn requires_action(&self) -> bool {
        self.cstate != self.tstate
    }

    pub fn is_deployed(&self) -> bool {
        self.cstate & VSTATE_DEPLOY != 0
    }
}

/// Per-assignment, per-volume snapshot deployment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVolumeState {
    id: u8,
    cstate: u64,
    tstate: u64,
    bd_name: Option<String>,
}

impl SnapshotVolumeState {
    pub fn new(id: u8, tstate: u64) -> Self {
        Self {
            id,
            cstate: 0,
            tstate: tstate & SVSTATE_MASK,
            bd_name: None,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn cstate(&self) -> u64 {
        self.cstate
    }

    pub fn tstate(&self) -> u64 {
        self.tstate
    }

    pub fn bd_name(&self) -> Option<&str> {
        self.bd_name.as_deref()
    }

    pub fn set_cstate(&mut self, cstate: u64, serial: &mut SerialGen) {
        let masked = cstate & SVSTATE_MASK;
        if masked != self.cstate {
            self.cstate = masked;
            serial.next_serial();
        }
    }

    pub fn set_tstate(&mut self, tstate: u64, serial: &mut SerialGen) {
        let masked = tstate & SVSTATE_MASK;
        if masked != self.tstate {
            self.tstate = masked;
            serial.next_serial();
        }
    }

    pub fn set_bd_name(&mut self, bd_name: Option<String>, serial: &mut SerialGen) {
        if bd_name != self.bd_name {
            self.bd_name = bd_name;
            serial.next_serial();
        }
    }

    pub fn requires_deploy(&self) -> bool {
        self.tstate & SVSTATE_DEPLOY != 0 && self.cstate & SVSTATE_DEPLOY == 0
    }

    pub fn requires_undeploy(&self) -> bool {
        self.tstate & SVSTATE_DEPLOY == 0 && self.cstate & SVSTATE_DEPLOY != 0
    }

    pub fn requires_action(&self) -> bool {
        self.cstate != self.tstate
    }

    pub fn is_deployed(&self) -> bool {
        self.cstate & SVSTATE_DEPLOY != 0
    }
}

/// Deployment state of a named snapshot on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotAssignment {
    snapshot: String,
    cstate: u64,
    tstate: u64,
    /// Result code of the last snapshot operation on this node.
    rc: i32,
    vol_states: BTreeMap<u8, SnapshotVolumeState>,
}

impl SnapshotAssignment {
    pub fn new(snapshot: &str, tstate: u64, volumes: &[u8]) -> Self {
        let vol_states = volumes
            .iter()
            .map(|&id| (id, SnapshotVolumeState::new(id, tstate)))
            .collect();
        Self {
            snapshot: snapshot.to_string(),
            cstate: 0,
            tstate: tstate & SVSTATE_MASK,
            rc: 0,
            vol_states,
        }
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn cstate(&self) -> u64 {
        self.cstate
    }

    pub fn tstate(&self) -> u64 {
        self.tstate
    }

    pub fn rc(&self) -> i32 {
        self.rc
    }

    pub fn set_rc(&mut self, rc: i32) {
        self.rc = rc;
    }

    pub fn set_cstate(&mut self, cstate: u64, serial: &mut SerialGen) {
        let masked = cstate & SVSTATE_MASK;
        if masked != self.cstate {
            self.cstate = masked;
            serial.next_serial();
        }
    }

    pub fn set_tstate(&mut self, tstate: u64, serial: &mut SerialGen) {
        let masked = tstate & SVSTATE_MASK;
        if masked != self.tstate {
            self.tstate = masked;
            serial.next_serial();
        }
    }

    pub fn vol_states(&self) -> impl Iterator<Item = &SnapshotVolumeState> {
        self.vol_states.values()
    }

    pub fn vol_state(&self, id: u8) -> Option<&SnapshotVolumeState> {
        self.vol_states.get(&id)
    }

    pub fn vol_state_mut(&mut self, id: u8) -> Option<&mut SnapshotVolumeState> {
        self.vol_states.get_mut(&id)
    }

    pub fn vol_ids(&self) -> Vec<u8> {
        self.vol_states.keys().copied().collect()
    }

    pub fn remove_vol_state(&mut self, id: u8) -> Option<SnapshotVolumeState> {
        self.vol_states.remove(&id)
    }

    pub fn requires_action(&self) -> bool {
        self.cstate != self.tstate || self.vol_states.values().any(|v| v.requires_action())
    }

    /// Fully torn down: nothing deployed, nothing targeted.
    pub fn is_gone(&self) -> bool {
        self.cstate == 0
            && self.tstate == 0
            && self.vol_states.values().all(|v| v.cstate() == 0 && v.tstate() == 0)
    }
}

/// The record that a resource is (to be) present on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    node: String,
    resource: String,
    /// Per-resource node id used in the generated configuration.
    node_id: u8,
    cstate: u64,
    tstate: u64,
    /// Result code of the last external-tool or allocation step.
    rc: i32,
    vol_states: BTreeMap<u8, VolumeState>,
    snap_assignments: BTreeMap<String, SnapshotAssignment>,
}

impl Assignment {
    pub fn new(node: &str, resource: &str, node_id: u8, tstate: u64) -> Self {
        Self {
            node: node.to_string(),
            resource: resource.to_string(),
            node_id,
            cstate: 0,
            tstate: tstate & TSTATE_MASK,
            rc: 0,
            vol_states: BTreeMap::new(),
            snap_assignments: BTreeMap::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn cstate(&self) -> u64 {
        self.cstate
    }

    pub fn tstate(&self) -> u64 {
        self.tstate
    }

    pub fn rc(&self) -> i32 {
        self.rc
    }

    pub fn set_rc(&mut self, rc: i32) {
        self.rc = rc;
    }

    pub fn set_cstate(&mut self, cstate: u64, serial: &mut SerialGen) {
        let masked = cstate & CSTATE_MASK;
        if masked != self.cstate {
            self.cstate = masked;
            serial.next_serial();
        }
    }

    pub fn set_tstate(&mut self, tstate: u64, serial: &mut SerialGen) {
        let masked = tstate & TSTATE_MASK;
        if masked != self.tstate {
            self.tstate = masked;
            serial.next_serial();
        }
    }

    pub fn set_cstate_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_cstate(self.cstate | flags, serial);
    }

    pub fn clear_cstate_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_cstate(self.cstate & !flags, serial);
    }

    pub fn set_tstate_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_tstate(self.tstate | flags, serial);
    }

    pub fn clear_tstate_flags(&mut self, flags: u64, serial: &mut SerialGen) {
        self.set_tstate(self.tstate & !flags, serial);
    }

    pub fn has_tstate_flag(&self, flag: u64) -> bool {
        self.tstate & flag == flag
    }

    pub fn is_diskless(&self) -> bool {
        self.tstate & STATE_DISKLESS != 0
    }

    pub fn is_deployed(&self) -> bool {
        self.cstate & STATE_DEPLOY != 0
    }

    pub fn vol_states(&self) -> impl Iterator<Item = &VolumeState> {
        self.vol_states.values()
    }

    pub fn vol_state(&self, id: u8) -> Option<&VolumeState> {
        self.vol_states.get(&id)
    }

    pub fn vol_state_mut(&mut self, id: u8) -> Option<&mut VolumeState> {
        self.vol_states.get_mut(&id)
    }

    pub fn vol_ids(&self) -> Vec<u8> {
        self.vol_states.keys().copied().collect()
    }

    pub fn insert_vol_state(&mut self, vstate: VolumeState) {
        self.vol_states.insert(vstate.id(), vstate);
    }

    pub fn remove_vol_state(&mut self, id: u8) -> Option<VolumeState> {
        self.vol_states.remove(&id)
    }

    pub fn snap_assignments(&self) -> impl Iterator<Item = &SnapshotAssignment> {
        self.snap_assignments.values()
    }

    pub fn snap_assignment(&self, name: &str) -> Option<&SnapshotAssignment> {
        self.snap_assignments.get(name)
    }

    pub fn snap_assignment_mut(&mut self, name: &str) -> Option<&mut SnapshotAssignment> {
        self.snap_assignments.get_mut(name)
    }

    pub fn snap_names(&self) -> Vec<String> {
        self.snap_assignments.keys().cloned().collect()
    }

    pub fn insert_snap_assignment(&mut self, sa: SnapshotAssignment) {
        self.snap_assignments.insert(sa.snapshot().to_string(), sa);
    }

    pub fn remove_snap_assignment(&mut self, name: &str) -> Option<SnapshotAssignment> {
        self.snap_assignments.remove(name)
    }

    pub fn requires_deploy(&self) -> bool {
        self.tstate & STATE_DEPLOY != 0 && self.cstate & STATE_DEPLOY == 0
    }

    pub fn requires_undeploy(&self) -> bool {
        self.tstate & STATE_DEPLOY == 0 && self.cstate & STATE_DEPLOY != 0
    }

    pub fn requires_connect(&self) -> bool {
        self.tstate & STATE_CONNECT != 0 && self.cstate & STATE_CONNECT == 0
    }

    pub fn requires_disconnect(&self) -> bool {
        self.tstate & STATE_CONNECT == 0 && self.cstate & STATE_CONNECT != 0
    }

    /// Anything to do this cycle: deployment states differ, an action
    /// flag is pending, or any volume state is off target.
    pub fn requires_action(&self) -> bool {
        self.cstate & STATE_MASK != self.tstate & STATE_MASK
            || self.tstate & ACT_MASK != 0
            || self.vol_states.values().any(|v| v.requires_action())
    }

    /// No volume is currently deployed.
    pub fn no_deployed_volumes(&self) -> bool {
        self.vol_states.values().all(|v| !v.is_deployed())
    }

    /// No volume is currently deployed or targeted for deployment.
    pub fn is_empty(&self) -> bool {
        self.vol_states
            .values()
            .all(|v| (v.cstate() | v.tstate()) & VSTATE_DEPLOY == 0)
    }

    /// Fully converged to removal: nothing observed, nothing desired.
    pub fn is_gone(&self) -> bool {
        self.cstate == 0
            && self.tstate == 0
            && self.vol_states.values().all(|v| v.cstate() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstate_rejects_action_flags() {
        let mut serial = SerialGen::default();
        let mut asg = Assignment::new("n1", "r1", 0, STATE_DEPLOY | STATE_CONNECT);
        asg.set_cstate(STATE_DEPLOY | ACT_OVERWRITE | 0xdead_0000_0000, &mut serial);
        assert_eq!(asg.cstate(), STATE_DEPLOY);
    }

    #[test]
    fn test_tstate_masks_unknown_bits() {
        let mut serial = SerialGen::default();
        let mut asg = Assignment::new("n1", "r1", 0, 0);
        asg.set_tstate(u64::MAX, &mut serial);
        assert_eq!(asg.tstate(), TSTATE_MASK);
    }

    #[test]
    fn test_requires_predicates() {
        let mut serial = SerialGen::default();
        let mut asg = Assignment::new("n1", "r1", 0, STATE_DEPLOY | STATE_CONNECT);
        assert!(asg.requires_deploy());
        assert!(asg.requires_connect());
        assert!(!asg.requires_undeploy());

        asg.set_cstate(STATE_DEPLOY | STATE_CONNECT, &mut serial);
        assert!(!asg.requires_action());

        asg.set_tstate(0, &mut serial);
        assert!(asg.requires_undeploy());
        assert!(asg.requires_disconnect());
    }

    #[test]
    fn test_volume_state_predicates() {
        let mut serial = SerialGen::default();
        let mut vstate = VolumeState::new(0, VSTATE_DEPLOY | VSTATE_ATTACH);
        assert!(vstate.requires_deploy());
        assert!(vstate.requires_attach());

        vstate.set_cstate(VSTATE_DEPLOY | VSTATE_ATTACH, &mut serial);
        assert!(!vstate.requires_action());

        vstate.set_tstate(VSTATE_DEPLOY, &mut serial);
        assert!(vstate.requires_detach());
        assert!(!vstate.requires_undeploy());
    }

    #[test]
    fn test_assignment_empty_and_gone() {
        let mut serial = SerialGen::default();
        let mut asg = Assignment::new("n1", "r1", 0, STATE_DEPLOY);
        asg.insert_vol_state(VolumeState::new(0, VSTATE_DEPLOY));
        assert!(!asg.is_empty());

        let vstate = asg.vol_state_mut(0).unwrap();
        vstate.set_tstate(0, &mut serial);
        assert!(asg.is_empty());
        assert!(asg.no_deployed_volumes());

        asg.set_tstate(0, &mut serial);
        assert!(asg.is_gone());
    }

    #[test]
    fn test_snapshot_assignment_shape() {
        let mut serial = SerialGen::default();
        let mut sa = SnapshotAssignment::new("s1", SVSTATE_DEPLOY, &[0, 1]);
        assert!(sa.requires_action());
        assert_eq!(sa.vol_ids(), vec![0, 1]);

        for id in [0u8, 1] {
            sa.vol_state_mut(id).unwrap().set_cstate(SVSTATE_DEPLOY, &mut serial);
        }
        sa.set_cstate(SVSTATE_DEPLOY, &mut serial);
        assert!(!sa.requires_action());
        assert!(!sa.is_gone());
    }
}
