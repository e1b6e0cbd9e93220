/// The in-memory cluster model and its administrative operations.
///
/// `ClusterState` is the unit the control volume loads and saves. It
/// owns every entity; assignments live in a single map keyed by
/// (node name, resource name), so the node/resource entities never hold
/// references to each other and "at most one assignment per pair" is
/// structural.
///
/// All validation happens here, at the administrative boundary. The
/// reconciliation engine only ever sees a structurally valid model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::assignment::{
    Assignment, SnapshotAssignment, VolumeState, ACT_OVERWRITE, STATE_DISKLESS, SVSTATE_DEPLOY,
    VSTATE_ATTACH, VSTATE_DEPLOY,
};
use crate::consts::NODE_ID_MAX;
use crate::error::{FlockError, FlockResult};
use crate::node::{AddressFamily, Node, NODE_FLAG_REMOVE};
use crate::resource::{Resource, Snapshot, RES_FLAG_REMOVE, SNAP_FLAG_REMOVE, VOL_FLAG_REMOVE};
use crate::serial::SerialGen;

/// The authoritative desired/observed configuration of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Serial of the last persisted change.
    serial: u64,
    nodes: BTreeMap<String, Node>,
    resources: BTreeMap<String, Resource>,
    assignments: BTreeMap<(String, String), Assignment>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn set_serial(&mut self, serial: u64) {
        self.serial = serial;
    }

    // --- lookups ---

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn resource_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.get_mut(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn assignment(&self, node: &str, resource: &str) -> Option<&Assignment> {
        self.assignments
            .get(&(node.to_string(), resource.to_string()))
    }

    pub fn assignment_mut(&mut self, node: &str, resource: &str) -> Option<&mut Assignment> {
        self.assignments
            .get_mut(&(node.to_string(), resource.to_string()))
    }

    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.values()
    }

    /// All assignments of one node.
    pub fn node_assignments<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Assignment> {
        self.assignments
            .values()
            .filter(move |a| a.node() == node)
    }

    /// All assignments of one resource, across nodes.
    pub fn resource_assignments<'a>(
        &'a self,
        resource: &'a str,
    ) -> impl Iterator<Item = &'a Assignment> {
        self.assignments
            .values()
            .filter(move |a| a.resource() == resource)
    }

    // --- administrative operations ---

    pub fn create_node(
        &mut self,
        name: &str,
        addr: &str,
        af: AddressFamily,
        flags: u64,
        serial: &mut SerialGen,
    ) -> FlockResult<()> {
        if self.nodes.contains_key(name) {
            return Err(FlockError::NodeExists);
        }
        let mut node = Node::new(name, addr, af)?;
        node.set_flags(flags, serial);
        self.nodes.insert(name.to_string(), node);
        serial.next_serial();
        Ok(())
    }

    /// Mark a node for removal; its assignments are retargeted to full
    /// teardown and the cleanup pass deletes the node once they are
    /// gone. With `force`, the node and its assignments are deleted
    /// immediately (recovery from a dead node).
    pub fn remove_node(&mut self, name: &str, force: bool, serial: &mut SerialGen) -> FlockResult<()> {
        if !self.nodes.contains_key(name) {
            return Err(FlockError::NoNode);
        }
        if force {
            self.assignments.retain(|(n, _), _| n != name);
            self.nodes.remove(name);
            serial.next_serial();
            return Ok(());
        }
        for asg in self.assignments.values_mut().filter(|a| a.node() == name) {
            clear_assignment_targets(asg, serial);
        }
        if let Some(node) = self.nodes.get_mut(name) {
            node.raise_flags(NODE_FLAG_REMOVE, serial);
        }
        Ok(())
    }

    pub fn create_resource(
        &mut self,
        name: &str,
        port: u16,
        secret: &str,
        serial: &mut SerialGen,
    ) -> FlockResult<()> {
        if self.resources.contains_key(name) {
            return Err(FlockError::ResourceExists);
        }
        let res = Resource::new(name, port, secret)?;
        self.resources.insert(name.to_string(), res);
        serial.next_serial();
        Ok(())
    }

    pub fn remove_resource(
        &mut self,
        name: &str,
        force: bool,
        serial: &mut SerialGen,
    ) -> FlockResult<()> {
        if !self.resources.contains_key(name) {
            return Err(FlockError::NoResource);
        }
        if force {
            self.assignments.retain(|(_, r), _| r != name);
            self.resources.remove(name);
            serial.next_serial();
            return Ok(());
        }
        for asg in self
            .assignments
            .values_mut()
            .filter(|a| a.resource() == name)
        {
            clear_assignment_targets(asg, serial);
        }
        if let Some(res) = self.resources.get_mut(name) {
            res.raise_flags(RES_FLAG_REMOVE, serial);
        }
        Ok(())
    }

    /// Create a volume and seed a volume state on every assignment of
    /// the resource, targeted according to the assignment's own target.
    pub fn create_volume(
        &mut self,
        res_name: &str,
        size_kib: u64,
        minor: u32,
        serial: &mut SerialGen,
    ) -> FlockResult<u8> {
        let res = self
            .resources
            .get_mut(res_name)
            .ok_or(FlockError::NoResource)?;
        let id = res.add_volume(size_kib, minor, serial)?;
        for asg in self
            .assignments
            .values_mut()
            .filter(|a| a.resource() == res_name)
        {
            asg.insert_vol_state(VolumeState::new(id, vstate_target(asg)));
        }
        Ok(id)
    }

    pub fn remove_volume(
        &mut self,
        res_name: &str,
        id: u8,
        force: bool,
        serial: &mut SerialGen,
    ) -> FlockResult<()> {
        let res = self
            .resources
            .get_mut(res_name)
            .ok_or(FlockError::NoResource)?;
        if res.volume(id).is_none() {
            return Err(FlockError::NoVolume);
        }
        if force {
            res.remove_volume_entry(id);
            for asg in self
                .assignments
                .values_mut()
                .filter(|a| a.resource() == res_name)
            {
                asg.remove_vol_state(id);
            }
            serial.next_serial();
            return Ok(());
        }
        if let Some(vol) = res.volume_mut(id) {
            vol.raise_flags(VOL_FLAG_REMOVE, serial);
        }
        for asg in self
            .assignments
            .values_mut()
            .filter(|a| a.resource() == res_name)
        {
            if let Some(vstate) = asg.vol_state_mut(id) {
                vstate.set_tstate(0, serial);
            }
        }
        Ok(())
    }

    /// Assign a resource to a node. Creates the lazy volume states for
    /// every non-removed volume and allocates the per-resource node id.
    pub fn assign(
        &mut self,
        node: &str,
        res_name: &str,
        tstate: u64,
        serial: &mut SerialGen,
    ) -> FlockResult<()> {
        if !self.nodes.contains_key(node) {
            return Err(FlockError::NoNode);
        }
        let key = (node.to_string(), res_name.to_string());
        if self.assignments.contains_key(&key) {
            return Err(FlockError::AssignmentExists);
        }
        let node_id = self.free_node_id(res_name)?;
        let res = self.resources.get(res_name).ok_or(FlockError::NoResource)?;
        let mut asg = Assignment::new(node, res_name, node_id, tstate);
        for vol in res.volumes().filter(|v| !v.has_flag(VOL_FLAG_REMOVE)) {
            asg.insert_vol_state(VolumeState::new(vol.id(), vstate_target(&asg)));
        }
        if tstate & ACT_OVERWRITE != 0 {
            self.clear_overwrite(res_name, serial);
        }
        self.assignments.insert(key, asg);
        serial.next_serial();
        Ok(())
    }

    /// Retarget an assignment to full teardown; the engine undeploys it
    /// and the cleanup pass deletes the record. With `force`, delete
    /// immediately.
    pub fn unassign(
        &mut self,
        node: &str,
        res_name: &str,
        force: bool,
        serial: &mut SerialGen,
    ) -> FlockResult<()> {
        let key = (node.to_string(), res_name.to_string());
        if force {
            self.assignments.remove(&key).ok_or(FlockError::NoAssignment)?;
            serial.next_serial();
            return Ok(());
        }
        let asg = self
            .assignments
            .get_mut(&key)
            .ok_or(FlockError::NoAssignment)?;
        clear_assignment_targets(asg, serial);
        Ok(())
    }

    /// Request OVERWRITE on one assignment, clearing it everywhere else
    /// on the same resource (at most one per resource at any time).
    pub fn set_overwrite(
        &mut self,
        node: &str,
        res_name: &str,
        serial: &mut SerialGen,
    ) -> FlockResult<()> {
        if self.assignment(node, res_name).is_none() {
            return Err(FlockError::NoAssignment);
        }
        self.clear_overwrite(res_name, serial);
        if let Some(asg) = self.assignment_mut(node, res_name) {
            asg.set_tstate_flags(ACT_OVERWRITE, serial);
        }
        Ok(())
    }

    fn clear_overwrite(&mut self, res_name: &str, serial: &mut SerialGen) {
        for asg in self
            .assignments
            .values_mut()
            .filter(|a| a.resource() == res_name)
        {
            asg.clear_tstate_flags(ACT_OVERWRITE, serial);
        }
    }

    /// Smallest per-resource node id not yet used by any assignment of
    /// the resource.
    pub fn free_node_id(&self, res_name: &str) -> FlockResult<u8> {
        let used: Vec<u8> = self
            .resource_assignments(res_name)
            .map(|a| a.node_id())
            .collect();
        (0..=NODE_ID_MAX)
            .find(|id| !used.contains(id))
            .ok_or(FlockError::FullNodeIds)
    }

    /// Register a snapshot of a resource on the given nodes. The
    /// snapshot captures the resource's current non-removed volumes;
    /// each named node gets a snapshot assignment targeted for deploy.
    pub fn create_snapshot(
        &mut self,
        res_name: &str,
        snap_name: &str,
        nodes: &[String],
        serial: &mut SerialGen,
    ) -> FlockResult<()> {
        let res = self.resources.get(res_name).ok_or(FlockError::NoResource)?;
        let vol_ids: Vec<u8> = res
            .volumes()
            .filter(|v| !v.has_flag(VOL_FLAG_REMOVE))
            .map(|v| v.id())
            .collect();
        for node in nodes {
            let asg = self
                .assignment(node, res_name)
                .ok_or(FlockError::NoAssignment)?;
            if asg.is_diskless() {
                // A diskless assignment has no local data to snapshot
                return Err(FlockError::NoVolume);
            }
        }
        let snapshot = Snapshot::new(snap_name, vol_ids.clone())?;
        self.resources
            .get_mut(res_name)
            .ok_or(FlockError::NoResource)?
            .add_snapshot(snapshot, serial)?;
        for node in nodes {
            if let Some(asg) = self.assignment_mut(node, res_name) {
                asg.insert_snap_assignment(SnapshotAssignment::new(
                    snap_name,
                    SVSTATE_DEPLOY,
                    &vol_ids,
                ));
            }
        }
        serial.next_serial();
        Ok(())
    }

    pub fn remove_snapshot(
        &mut self,
        res_name: &str,
        snap_name: &str,
        force: bool,
        serial: &mut SerialGen,
    ) -> FlockResult<()> {
        let res = self
            .resources
            .get_mut(res_name)
            .ok_or(FlockError::NoResource)?;
        if res.snapshot(snap_name).is_none() {
            return Err(FlockError::NoSnapshot);
        }
        if force {
            res.remove_snapshot_entry(snap_name);
            for asg in self
                .assignments
                .values_mut()
                .filter(|a| a.resource() == res_name)
            {
                asg.remove_snap_assignment(snap_name);
            }
            serial.next_serial();
            return Ok(());
        }
        if let Some(snap) = res.snapshot_mut(snap_name) {
            snap.set_flags(SNAP_FLAG_REMOVE, serial);
        }
        for asg in self
            .assignments
            .values_mut()
            .filter(|a| a.resource() == res_name)
        {
            if let Some(sa) = asg.snap_assignment_mut(snap_name) {
                sa.set_tstate(0, serial);
                let ids = sa.vol_ids();
                for id in ids {
                    if let Some(sv) = sa.vol_state_mut(id) {
                        sv.set_tstate(0, serial);
                    }
                }
            }
        }
        Ok(())
    }

    // --- cleanup support (used by the engine's cleanup pass) ---

    pub fn remove_assignment_entry(&mut self, node: &str, resource: &str) -> Option<Assignment> {
        self.assignments
            .remove(&(node.to_string(), resource.to_string()))
    }

    pub fn assignment_keys(&self) -> Vec<(String, String)> {
        self.assignments.keys().cloned().collect()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    pub fn remove_node_entry(&mut self, name: &str) -> Option<Node> {
        self.nodes.remove(name)
    }

    pub fn remove_resource_entry(&mut self, name: &str) -> Option<Resource> {
        self.resources.remove(name)
    }
}

/// Retarget an assignment to full teardown: zero its tstate and the
/// tstates of every volume state, snapshot assignment and snapshot
/// volume state, so the engine undeploys everything the assignment
/// holds (snapshot devices included) and the cleanup pass can delete
/// the record.
fn clear_assignment_targets(asg: &mut Assignment, serial: &mut SerialGen) {
    asg.set_tstate(0, serial);
    for id in asg.vol_ids() {
        if let Some(vstate) = asg.vol_state_mut(id) {
            vstate.set_tstate(0, serial);
        }
    }
    for name in asg.snap_names() {
        if let Some(sa) = asg.snap_assignment_mut(&name) {
            sa.set_tstate(0, serial);
            for id in sa.vol_ids() {
                if let Some(sv) = sa.vol_state_mut(id) {
                    sv.set_tstate(0, serial);
                }
            }
        }
    }
}

/// Target volume-state flags implied by an assignment's target: a
/// deployed diskless client never attaches local storage.
fn vstate_target(asg: &Assignment) -> u64 {
    if asg.tstate() & STATE_DISKLESS != 0 {
        VSTATE_DEPLOY
    } else {
        VSTATE_DEPLOY | VSTATE_ATTACH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{STATE_CONNECT, STATE_DEPLOY};

    fn two_node_state(serial: &mut SerialGen) -> ClusterState {
        let mut state = ClusterState::new();
        state
            .create_node("n1", "10.0.0.1", AddressFamily::Ipv4, 0, serial)
            .unwrap();
        state
            .create_node("n2", "10.0.0.2", AddressFamily::Ipv4, 0, serial)
            .unwrap();
        state.create_resource("r1", 7700, "secret", serial).unwrap();
        state.create_volume("r1", 1024, 100, serial).unwrap();
        state
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        assert!(matches!(
            state.create_node("n1", "10.0.0.9", AddressFamily::Ipv4, 0, &mut serial),
            Err(FlockError::NodeExists)
        ));
        assert!(matches!(
            state.create_resource("r1", 7701, "x", &mut serial),
            Err(FlockError::ResourceExists)
        ));
        state
            .assign("n1", "r1", STATE_DEPLOY | STATE_CONNECT, &mut serial)
            .unwrap();
        assert!(matches!(
            state.assign("n1", "r1", STATE_DEPLOY, &mut serial),
            Err(FlockError::AssignmentExists)
        ));
    }

    #[test]
    fn test_assign_seeds_volume_states() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        state
            .assign("n1", "r1", STATE_DEPLOY | STATE_CONNECT, &mut serial)
            .unwrap();
        let asg = state.assignment("n1", "r1").unwrap();
        let vstate = asg.vol_state(0).unwrap();
        assert_eq!(vstate.tstate(), VSTATE_DEPLOY | VSTATE_ATTACH);
    }

    #[test]
    fn test_diskless_assign_targets_deploy_only() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        state
            .assign(
                "n1",
                "r1",
                STATE_DEPLOY | STATE_CONNECT | STATE_DISKLESS,
                &mut serial,
            )
            .unwrap();
        let vstate = state.assignment("n1", "r1").unwrap().vol_state(0).unwrap();
        assert_eq!(vstate.tstate(), VSTATE_DEPLOY);
    }

    #[test]
    fn test_node_id_allocation() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        state.assign("n1", "r1", STATE_DEPLOY, &mut serial).unwrap();
        state.assign("n2", "r1", STATE_DEPLOY, &mut serial).unwrap();
        assert_eq!(state.assignment("n1", "r1").unwrap().node_id(), 0);
        assert_eq!(state.assignment("n2", "r1").unwrap().node_id(), 1);
    }

    #[test]
    fn test_create_volume_reaches_existing_assignments() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        state
            .assign("n1", "r1", STATE_DEPLOY | STATE_CONNECT, &mut serial)
            .unwrap();
        let id = state.create_volume("r1", 2048, 101, &mut serial).unwrap();
        assert_eq!(id, 1);
        assert!(state.assignment("n1", "r1").unwrap().vol_state(1).is_some());
    }

    #[test]
    fn test_unassign_is_two_phase() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        state
            .assign("n1", "r1", STATE_DEPLOY | STATE_CONNECT, &mut serial)
            .unwrap();
        state.unassign("n1", "r1", false, &mut serial).unwrap();
        // Still present; only the target was zeroed
        let asg = state.assignment("n1", "r1").unwrap();
        assert_eq!(asg.tstate(), 0);
        assert_eq!(asg.vol_state(0).unwrap().tstate(), 0);
    }

    #[test]
    fn test_teardown_cascades_to_snapshot_assignments() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        state
            .assign("n1", "r1", STATE_DEPLOY | STATE_CONNECT, &mut serial)
            .unwrap();
        state
            .create_snapshot("r1", "s1", &["n1".to_string()], &mut serial)
            .unwrap();

        state.unassign("n1", "r1", false, &mut serial).unwrap();
        let sa = state
            .assignment("n1", "r1")
            .unwrap()
            .snap_assignment("s1")
            .unwrap();
        assert_eq!(sa.tstate(), 0);
        assert_eq!(sa.vol_state(0).unwrap().tstate(), 0);

        // The node- and resource-level teardowns cascade the same way
        let mut state = two_node_state(&mut serial);
        state
            .assign("n2", "r1", STATE_DEPLOY | STATE_CONNECT, &mut serial)
            .unwrap();
        state
            .create_snapshot("r1", "s1", &["n2".to_string()], &mut serial)
            .unwrap();
        state.remove_node("n2", false, &mut serial).unwrap();
        let sa = state
            .assignment("n2", "r1")
            .unwrap()
            .snap_assignment("s1")
            .unwrap();
        assert_eq!(sa.tstate(), 0);
        assert_eq!(sa.vol_state(0).unwrap().tstate(), 0);
    }

    #[test]
    fn test_overwrite_exclusive_per_resource() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        state.assign("n1", "r1", STATE_DEPLOY, &mut serial).unwrap();
        state.assign("n2", "r1", STATE_DEPLOY, &mut serial).unwrap();
        state.set_overwrite("n1", "r1", &mut serial).unwrap();
        state.set_overwrite("n2", "r1", &mut serial).unwrap();
        assert!(!state
            .assignment("n1", "r1")
            .unwrap()
            .has_tstate_flag(ACT_OVERWRITE));
        assert!(state
            .assignment("n2", "r1")
            .unwrap()
            .has_tstate_flag(ACT_OVERWRITE));
    }

    #[test]
    fn test_snapshot_requires_diskful_assignment() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        state
            .assign("n1", "r1", STATE_DEPLOY | STATE_DISKLESS, &mut serial)
            .unwrap();
        assert!(state
            .create_snapshot("r1", "s1", &["n1".to_string()], &mut serial)
            .is_err());
    }

    #[test]
    fn test_snapshot_assignment_created() {
        let mut serial = SerialGen::default();
        let mut state = two_node_state(&mut serial);
        state.assign("n1", "r1", STATE_DEPLOY, &mut serial).unwrap();
        state
            .create_snapshot("r1", "s1", &["n1".to_string()], &mut serial)
            .unwrap();
        let asg = state.assignment("n1", "r1").unwrap();
        let sa = asg.snap_assignment("s1").unwrap();
        assert_eq!(sa.tstate(), SVSTATE_DEPLOY);
        assert_eq!(sa.vol_ids(), vec![0]);
    }
}
