//! The reconciliation engine.
//!
//! Each cycle compares the observed state (cstate) of every assignment
//! of the local node against its desired state (tstate) and drives the
//! external configuration tool and the backing-store gateway until the
//! two converge. Peers are never acted upon directly: they converge on
//! their own when they observe the changed control-volume digest.
//!
//! ## Cycle flow
//!
//! 1. **Change detection** - unless forced, the stored digest of the
//!    control volume is compared read-only against the digest of the
//!    loaded model; an unchanged digest ends the cycle immediately.
//! 2. **Exclusion** - the control volume is opened writable. The volume
//!    is a single-writer replicated device, so this both serializes
//!    cycles within the process and excludes concurrent writers
//!    cluster-wide.
//! 3. **Convergence** - `perform_changes` walks the local node's
//!    assignments and their volumes and snapshots. Failures are
//!    recorded per assignment and do not stop sibling assignments.
//! 4. **Persistence** - if anything changed (or the caller poked the
//!    cluster), the serial is bumped and the model saved. The handle is
//!    released whether or not the cycle succeeded.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use flock_model::assignment::{
    Assignment, ACT_DISCARD, ACT_OVERWRITE, ACT_RECONNECT, ACT_UPDCON, STATE_CONNECT,
    STATE_DEPLOY, STATE_DISKLESS, SVSTATE_DEPLOY, VSTATE_ATTACH, VSTATE_DEPLOY,
};
use flock_model::consts::CTRL_RES_NAME;
use flock_model::node::NODE_FLAG_UPDATE;
use flock_model::resource::{PROP_RESTORE_SOURCE, RES_FLAG_REMOVE, SNAP_FLAG_REMOVE, VOL_FLAG_REMOVE};
use flock_model::sizing::gross_size_kib;
use flock_model::{ClusterState, FlockResult, SerialGen};

use crate::backing::BackingStore;
use crate::confgen::{self, Excerpt};
use crate::ctrlvol::ControlVolume;
use crate::executor::ActionExecutor;

/// Return code recorded when a backing-storage operation fails.
const RC_STORAGE_FAILED: i32 = -1;

/// Static engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the node this daemon runs on.
    pub node_name: String,
    /// Directory for generated resource configuration files.
    pub conf_dir: PathBuf,
    /// Peer count used for metadata sizing.
    pub peers: u8,
    /// Backing device of the control volume, used when regenerating the
    /// local control-volume connection configuration.
    pub ctrl_disk: String,
}

/// The per-node convergence engine.
pub struct Engine {
    cfg: EngineConfig,
    ctrlvol: Arc<dyn ControlVolume>,
    executor: Arc<dyn ActionExecutor>,
    backing: Arc<dyn BackingStore>,
    /// The loaded model; kept across cycles.
    state: ClusterState,
    serial: SerialGen,
    /// Digest of the loaded model; u64::MAX forces the initial load.
    loaded_hash: u64,
    /// Failed steps in the most recent cycle.
    failed_actions: u32,
    /// Whether the running cycle touched backing storage.
    pool_changed: bool,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        ctrlvol: Arc<dyn ControlVolume>,
        executor: Arc<dyn ActionExecutor>,
        backing: Arc<dyn BackingStore>,
    ) -> Self {
        Self {
            cfg,
            ctrlvol,
            executor,
            backing,
            state: ClusterState::new(),
            serial: SerialGen::default(),
            loaded_hash: u64::MAX,
            failed_actions: 0,
            pool_changed: false,
        }
    }

    /// The loaded model, for administrative queries.
    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    /// Failed steps in the most recent cycle.
    pub fn failed_actions(&self) -> u32 {
        self.failed_actions
    }

    /// Run one reconciliation cycle.
    ///
    /// `force` skips the cheap digest short-circuit; `poke` persists
    /// with a bumped serial even if nothing changed locally, so that
    /// every peer re-runs.
    pub async fn run(&mut self, force: bool, poke: bool) -> FlockResult<()> {
        // Failed steps left the model off target without moving the
        // stored digest; the short-circuit must not swallow their retry
        if !force && !poke && self.failed_actions == 0 {
            self.ctrlvol.open(false).await?;
            let stored = self.ctrlvol.stored_hash().await;
            self.ctrlvol.close().await;
            if stored? == self.loaded_hash {
                debug!("cluster configuration unchanged");
                return Ok(());
            }
        }

        self.ctrlvol.open(true).await?;
        let outcome = self.converge(poke).await;
        // The handle must be released even when the cycle failed
        self.ctrlvol.close().await;
        outcome
    }

    async fn converge(&mut self, poke: bool) -> FlockResult<()> {
        let stored = self.ctrlvol.stored_hash().await?;
        if stored != self.loaded_hash {
            self.state = self.ctrlvol.load().await?;
            self.serial = SerialGen::new(self.state.serial());
            self.loaded_hash = stored;
            info!("loaded cluster configuration, serial {}", self.state.serial());
        }

        let changed = self.perform_changes().await?;

        if changed || poke {
            let serial = self.serial.next_serial();
            self.state.set_serial(serial);
            self.loaded_hash = self.ctrlvol.save(&self.state).await?;
            info!("saved cluster configuration, serial {}", serial);
        }
        Ok(())
    }

    /// The convergence pass over this node's assignments.
    async fn perform_changes(&mut self) -> FlockResult<bool> {
        self.failed_actions = 0;
        self.pool_changed = false;
        let node = self.cfg.node_name.clone();
        let mut changed = false;

        let Some(local) = self.state.node(&node) else {
            // A daemon on an unregistered node must not invent state
            warn!("node {} is not registered in the cluster, skipping cycle", node);
            return Ok(false);
        };

        if local.has_flag(NODE_FLAG_UPDATE) {
            let conf = confgen::control_conf(&self.state, &self.cfg.ctrl_disk);
            self.write_conf(CTRL_RES_NAME, &conf).await?;
            if let Some(n) = self.state.node_mut(&node) {
                n.clear_flags(NODE_FLAG_UPDATE, &mut self.serial);
            }
            info!("refreshed control volume configuration");
            changed = true;
        }

        let res_names: Vec<String> = self
            .state
            .node_assignments(&node)
            .map(|a| a.resource().to_string())
            .collect();
        for res in &res_names {
            changed |= self.assignment_actions(res).await?;
            changed |= self.snapshot_actions(res).await?;
        }

        changed |= self.cleanup();

        if self.pool_changed {
            match self.backing.update_pool().await {
                Ok((size, free)) => {
                    if let Some(n) = self.state.node_mut(&node) {
                        changed |= n.set_pool(size, free, &mut self.serial);
                    }
                    debug!("pool telemetry: size={} free={}", size, free);
                }
                Err(e) => warn!("storage pool refresh failed: {}", e),
            }
        }

        if self.failed_actions > 0 {
            warn!("{} action(s) failed this cycle, will retry", self.failed_actions);
        }
        Ok(changed)
    }

    // --- assignment level ---

    async fn assignment_actions(&mut self, res: &str) -> FlockResult<bool> {
        let node = self.cfg.node_name.clone();
        let Some(asg) = self.state.assignment(&node, res) else {
            return Ok(false);
        };
        if !asg.requires_action() {
            return Ok(false);
        }

        let mut changed = false;
        let mut failed = false;

        if asg.requires_undeploy() && asg.no_deployed_volumes() {
            // Nothing external to undo
            if let Some(asg) = self.state.assignment_mut(&node, res) {
                asg.set_cstate(0, &mut self.serial);
            }
            debug!("assignment {}:{} torn down without external actions", node, res);
            return Ok(true);
        }

        if self
            .state
            .assignment(&node, res)
            .map(|a| a.requires_undeploy())
            .unwrap_or(false)
        {
            // Snapshot devices reference the origin volumes and must go
            // before the origin backing devices are released
            let snap_changed = self.snapshot_actions(res).await?;
            return Ok(self.undeploy_assignment(res).await? || snap_changed);
        }

        if self.asg_flag(res, |a| a.requires_disconnect()) {
            let conf = self.conf_full(res);
            let rc = self.executor.disconnect(res, &conf).await;
            changed |= self.note_rc(res, rc);
            if rc == 0 {
                if let Some(asg) = self.state.assignment_mut(&node, res) {
                    asg.clear_cstate_flags(STATE_CONNECT, &mut self.serial);
                }
                changed = true;
            } else {
                self.step_failed(res, "disconnect", rc, &mut failed);
            }
        }

        if !failed && self.asg_flag(res, |a| a.has_tstate_flag(ACT_UPDCON)) {
            // Reconcile the peer set by re-adjusting against a fresh
            // configuration; healthy links stay up
            let conf = self.conf_full(res);
            self.write_conf(res, &conf).await?;
            let rc = self.executor.adjust(res, &conf).await;
            changed |= self.note_rc(res, rc);
            if rc == 0 {
                if let Some(asg) = self.state.assignment_mut(&node, res) {
                    asg.clear_tstate_flags(ACT_UPDCON, &mut self.serial);
                }
                changed = true;
            } else {
                self.step_failed(res, "update connections", rc, &mut failed);
            }
        }

        if !failed && self.asg_flag(res, |a| a.has_tstate_flag(ACT_RECONNECT)) {
            changed |= self.reconnect_assignment(res, &mut failed).await;
        }

        let vol_ids = self
            .state
            .assignment(&node, res)
            .map(|a| a.vol_ids())
            .unwrap_or_default();
        for vol_id in vol_ids {
            changed |= self.volume_actions(res, vol_id, &mut failed).await?;
        }

        let is_empty = self.asg_flag(res, |a| a.is_empty());
        if is_empty {
            if self.asg_flag(res, |a| a.cstate() != 0) {
                if let Some(asg) = self.state.assignment_mut(&node, res) {
                    asg.set_cstate(0, &mut self.serial);
                }
                changed = true;
            }
        } else if !failed && self.asg_flag(res, |a| a.requires_deploy()) {
            changed |= self.deploy_assignment(res, &mut failed).await;
        } else if !failed && self.asg_flag(res, |a| a.requires_connect()) {
            changed |= self.connect_assignment(res, &mut failed).await;
        }

        if self.asg_flag(res, |a| a.has_tstate_flag(STATE_DISKLESS))
            && !self.asg_flag(res, |a| a.cstate() & STATE_DISKLESS != 0)
        {
            // A diskless client is deployed as soon as the resource is
            // adjusted; there is no local storage to wait for
            if let Some(asg) = self.state.assignment_mut(&node, res) {
                asg.set_cstate_flags(STATE_DISKLESS, &mut self.serial);
            }
            changed = true;
        }

        Ok(changed)
    }

    /// Stop the resource completely, release every backing device and
    /// delete the generated configuration file.
    async fn undeploy_assignment(&mut self, res: &str) -> FlockResult<bool> {
        let node = self.cfg.node_name.clone();
        let conf = self.conf_full(res);
        let rc = self.executor.down(res, &conf).await;
        let mut changed = self.note_rc(res, rc);
        if rc != 0 {
            let mut failed = false;
            self.step_failed(res, "down", rc, &mut failed);
            return Ok(changed);
        }

        let devices: Vec<(u8, Option<String>)> = self
            .state
            .assignment(&node, res)
            .map(|a| {
                a.vol_states()
                    .map(|v| (v.id(), v.bd_name().map(str::to_string)))
                    .collect()
            })
            .unwrap_or_default();
        let diskless = self.asg_flag(res, |a| a.is_diskless());

        let mut all_removed = true;
        for (vol_id, bd) in devices {
            if let Some(bd) = bd {
                if !diskless {
                    if !self.release_device(&bd).await {
                        self.failed_actions += 1;
                        changed |= self.note_rc(res, RC_STORAGE_FAILED);
                        all_removed = false;
                        continue;
                    }
                }
            }
            if let Some(asg) = self.state.assignment_mut(&node, res) {
                if let Some(vstate) = asg.vol_state_mut(vol_id) {
                    vstate.set_bd_name(None, &mut self.serial);
                    vstate.set_cstate(0, &mut self.serial);
                }
            }
            changed = true;
        }
        if !all_removed {
            // Leftover devices keep the assignment record alive so the
            // removal is retried next cycle
            return Ok(changed);
        }

        if let Some(asg) = self.state.assignment_mut(&node, res) {
            asg.set_cstate(0, &mut self.serial);
        }
        self.remove_conf(res).await;
        info!("undeployed assignment {}:{}", node, res);
        Ok(true)
    }

    /// Finish assignment-level deployment: decide the replication role,
    /// then mark the assignment deployed.
    async fn deploy_assignment(&mut self, res: &str, failed: &mut bool) -> bool {
        let node = self.cfg.node_name.clone();
        let primary = self
            .state
            .assignment(&node, res)
            .map(|a| primary_deployment(&self.state, a))
            .unwrap_or(false);

        let mut changed = false;
        let conf = self.conf_full(res);
        if primary {
            let rc = self.executor.primary(res, &conf, true).await;
            changed |= self.note_rc(res, rc);
            if rc != 0 {
                self.step_failed(res, "primary", rc, failed);
                return changed;
            }
            info!("assignment {}:{} takes the primary role", node, res);
        } else {
            // A peer holds the authoritative data; sync as secondary
            let rc = self.executor.secondary(res, &conf).await;
            changed |= self.note_rc(res, rc);
            if rc != 0 {
                self.step_failed(res, "secondary", rc, failed);
                return changed;
            }
        }
        if let Some(asg) = self.state.assignment_mut(&node, res) {
            asg.clear_tstate_flags(ACT_OVERWRITE, &mut self.serial);
            asg.set_cstate_flags(STATE_DEPLOY, &mut self.serial);
        }
        true
    }

    async fn connect_assignment(&mut self, res: &str, failed: &mut bool) -> bool {
        let node = self.cfg.node_name.clone();
        let discard = self.asg_flag(res, |a| a.has_tstate_flag(ACT_DISCARD));
        let conf = self.conf_full(res);
        let rc = self.executor.connect(res, &conf, discard).await;
        let mut changed = self.note_rc(res, rc);
        if rc == 0 {
            if let Some(asg) = self.state.assignment_mut(&node, res) {
                asg.set_cstate_flags(STATE_CONNECT, &mut self.serial);
                asg.clear_tstate_flags(ACT_DISCARD, &mut self.serial);
            }
            changed = true;
        } else {
            self.step_failed(res, "connect", rc, failed);
        }
        changed
    }

    /// Drop and re-establish connections; used for split-brain
    /// resolution together with the discard/overwrite flags.
    async fn reconnect_assignment(&mut self, res: &str, failed: &mut bool) -> bool {
        let node = self.cfg.node_name.clone();
        let conf = self.conf_full(res);
        let rc = self.executor.disconnect(res, &conf).await;
        let mut changed = self.note_rc(res, rc);
        if rc != 0 {
            self.step_failed(res, "reconnect/disconnect", rc, failed);
            return changed;
        }
        let discard = self.asg_flag(res, |a| a.has_tstate_flag(ACT_DISCARD));
        let rc = self.executor.connect(res, &conf, discard).await;
        changed |= self.note_rc(res, rc);
        if rc != 0 {
            self.step_failed(res, "reconnect/connect", rc, failed);
            return changed;
        }
        if let Some(asg) = self.state.assignment_mut(&node, res) {
            asg.set_cstate_flags(STATE_CONNECT, &mut self.serial);
            asg.clear_tstate_flags(ACT_RECONNECT | ACT_DISCARD, &mut self.serial);
        }
        true
    }

    // --- volume level ---

    async fn volume_actions(&mut self, res: &str, vol_id: u8, failed: &mut bool) -> FlockResult<bool> {
        let node = self.cfg.node_name.clone();
        let Some(vstate) = self
            .state
            .assignment(&node, res)
            .and_then(|a| a.vol_state(vol_id))
        else {
            return Ok(false);
        };

        if vstate.requires_undeploy() {
            return self.undeploy_volume(res, vol_id, failed).await;
        }
        if *failed {
            return Ok(false);
        }
        if vstate.requires_deploy() {
            return self.deploy_volume(res, vol_id, failed).await;
        }
        if vstate.requires_attach() {
            return Ok(self.attach_volume(res, vol_id, true, failed).await);
        }
        if vstate.requires_detach() {
            return Ok(self.attach_volume(res, vol_id, false, failed).await);
        }
        Ok(false)
    }

    async fn undeploy_volume(&mut self, res: &str, vol_id: u8, failed: &mut bool) -> FlockResult<bool> {
        let node = self.cfg.node_name.clone();
        let diskless = self.asg_flag(res, |a| a.is_diskless());
        let mut changed = false;

        if diskless {
            // No local backing store; only the flags need clearing
            if let Some(asg) = self.state.assignment_mut(&node, res) {
                if let Some(vstate) = asg.vol_state_mut(vol_id) {
                    vstate.set_bd_name(None, &mut self.serial);
                    vstate.set_cstate(0, &mut self.serial);
                }
            }
            return Ok(true);
        }

        // Other volumes that stay deployed decide whether the resource
        // configuration can be pruned or must go down entirely
        let remaining: BTreeSet<u8> = self
            .state
            .assignment(&node, res)
            .map(|a| {
                a.vol_states()
                    .filter(|v| v.id() != vol_id)
                    .filter(|v| v.cstate() & VSTATE_DEPLOY != 0 && v.tstate() & VSTATE_DEPLOY != 0)
                    .map(|v| v.id())
                    .collect()
            })
            .unwrap_or_default();
        let keep_conf = !remaining.is_empty();

        let rc = if keep_conf {
            let excerpt = Excerpt {
                nodes: self.deployed_nodes(res),
                volumes: remaining,
            };
            let conf = confgen::resource_conf(&self.state, res, Some(&excerpt));
            self.write_conf(res, &conf).await?;
            self.executor.adjust(res, &conf).await
        } else {
            let conf = self.conf_full(res);
            self.executor.down(res, &conf).await
        };
        changed |= self.note_rc(res, rc);
        if rc != 0 {
            // A non-zero "down" is treated like a failed start here:
            // the device and flags stay until a cycle succeeds
            self.step_failed(res, "volume undeploy", rc, failed);
            return Ok(changed);
        }

        let bd = self
            .state
            .assignment(&node, res)
            .and_then(|a| a.vol_state(vol_id))
            .and_then(|v| v.bd_name().map(str::to_string));
        if let Some(bd) = bd {
            if !self.release_device(&bd).await {
                self.failed_actions += 1;
                *failed = true;
                return Ok(self.note_rc(res, RC_STORAGE_FAILED) || changed);
            }
        }

        if let Some(asg) = self.state.assignment_mut(&node, res) {
            if let Some(vstate) = asg.vol_state_mut(vol_id) {
                vstate.set_bd_name(None, &mut self.serial);
                vstate.set_cstate(0, &mut self.serial);
            }
        }
        if !keep_conf {
            self.remove_conf(res).await;
        }
        debug!("undeployed volume {}/{}", res, vol_id);
        Ok(true)
    }

    async fn deploy_volume(&mut self, res: &str, vol_id: u8, failed: &mut bool) -> FlockResult<bool> {
        let node = self.cfg.node_name.clone();
        let diskless = self.asg_flag(res, |a| a.is_diskless());
        let restore_src = self
            .state
            .assignment(&node, res)
            .and_then(|a| a.vol_state(vol_id))
            .and_then(|v| v.props().get(PROP_RESTORE_SOURCE).cloned());
        let has_bd = self
            .state
            .assignment(&node, res)
            .and_then(|a| a.vol_state(vol_id))
            .map(|v| v.bd_name().is_some())
            .unwrap_or(false);
        let mut changed = false;

        if !diskless && !has_bd {
            let allocated = match &restore_src {
                Some(src) => self.backing.restore_snapshot(res, vol_id, src).await,
                None => {
                    let net = self
                        .state
                        .resource(res)
                        .and_then(|r| r.volume(vol_id))
                        .map(|v| v.size_kib())
                        .unwrap_or(0);
                    let gross = gross_size_kib(net, self.cfg.peers);
                    self.backing.create(res, vol_id, gross).await
                }
            };
            match allocated {
                Ok(bd) => {
                    if restore_src.is_none() {
                        // Activation is idempotent; a failure here will
                        // resurface in the tool steps below
                        if let Err(e) = self.backing.up(&bd).await {
                            warn!("cannot activate backing device {}: {}", bd, e);
                        }
                    }
                    if let Some(asg) = self.state.assignment_mut(&node, res) {
                        if let Some(vstate) = asg.vol_state_mut(vol_id) {
                            vstate.set_bd_name(Some(bd), &mut self.serial);
                        }
                    }
                    self.pool_changed = true;
                    changed = true;
                }
                Err(e) => {
                    warn!("cannot allocate backing device for {}/{}: {}", res, vol_id, e);
                    self.failed_actions += 1;
                    *failed = true;
                    return Ok(self.note_rc(res, RC_STORAGE_FAILED) || changed);
                }
            }
        }

        // Exported single-resource configuration, consumed by the
        // tool's pre-sync hook
        let conf = self.conf_full(res);
        self.write_conf(res, &conf).await?;

        if !diskless && restore_src.is_none() {
            let rc = self.executor.create_md(res, vol_id, &conf, self.cfg.peers).await;
            changed |= self.note_rc(res, rc);
            if rc != 0 {
                self.step_failed(res, "create-md", rc, failed);
                return Ok(changed);
            }
        }

        let rc = self.executor.adjust(res, &conf).await;
        changed |= self.note_rc(res, rc);
        if rc != 0 {
            self.step_failed(res, "adjust", rc, failed);
            return Ok(changed);
        }

        if let Some(asg) = self.state.assignment_mut(&node, res) {
            if let Some(vstate) = asg.vol_state_mut(vol_id) {
                let flags = if diskless {
                    VSTATE_DEPLOY
                } else {
                    VSTATE_DEPLOY | VSTATE_ATTACH
                };
                vstate.set_cstate_flags(flags, &mut self.serial);
            }
            // adjust implicitly connects
            asg.set_cstate_flags(STATE_CONNECT, &mut self.serial);
        }
        debug!("deployed volume {}/{}", res, vol_id);
        Ok(true)
    }

    async fn attach_volume(&mut self, res: &str, vol_id: u8, attach: bool, failed: &mut bool) -> bool {
        let node = self.cfg.node_name.clone();
        let excerpt = Excerpt {
            nodes: [node.clone()].into(),
            volumes: [vol_id].into(),
        };
        let conf = confgen::resource_conf(&self.state, res, Some(&excerpt));
        let rc = if attach {
            self.executor.attach(res, vol_id, &conf).await
        } else {
            self.executor.detach(res, vol_id, &conf).await
        };
        let mut changed = self.note_rc(res, rc);
        if rc == 0 {
            if let Some(asg) = self.state.assignment_mut(&node, res) {
                if let Some(vstate) = asg.vol_state_mut(vol_id) {
                    if attach {
                        vstate.set_cstate_flags(VSTATE_ATTACH, &mut self.serial);
                    } else {
                        vstate.clear_cstate_flags(VSTATE_ATTACH, &mut self.serial);
                    }
                }
            }
            changed = true;
        } else {
            self.step_failed(res, if attach { "attach" } else { "detach" }, rc, failed);
        }
        changed
    }

    // --- snapshot level ---

    async fn snapshot_actions(&mut self, res: &str) -> FlockResult<bool> {
        let node = self.cfg.node_name.clone();
        let snap_names = self
            .state
            .assignment(&node, res)
            .map(|a| a.snap_names())
            .unwrap_or_default();
        let mut changed = false;

        for snap in snap_names {
            let requires = self
                .state
                .assignment(&node, res)
                .and_then(|a| a.snap_assignment(&snap))
                .map(|sa| sa.requires_action())
                .unwrap_or(false);
            if !requires {
                continue;
            }

            let vol_ids = self
                .state
                .assignment(&node, res)
                .and_then(|a| a.snap_assignment(&snap))
                .map(|sa| sa.vol_ids())
                .unwrap_or_default();
            for vol_id in vol_ids {
                changed |= self.snapshot_volume_actions(res, &snap, vol_id).await;
            }

            // Roll the per-volume results up into the snapshot assignment
            if let Some(asg) = self.state.assignment_mut(&node, res) {
                if let Some(sa) = asg.snap_assignment_mut(&snap) {
                    let all_deployed =
                        sa.vol_states().all(|v| v.cstate() & SVSTATE_DEPLOY != 0);
                    let none_deployed = sa.vol_states().all(|v| v.cstate() == 0);
                    if sa.tstate() & SVSTATE_DEPLOY != 0 && all_deployed {
                        sa.set_cstate(SVSTATE_DEPLOY, &mut self.serial);
                        changed = true;
                    } else if sa.tstate() == 0 && none_deployed {
                        sa.set_cstate(0, &mut self.serial);
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }

    async fn snapshot_volume_actions(&mut self, res: &str, snap: &str, vol_id: u8) -> bool {
        let node = self.cfg.node_name.clone();
        let Some(sv) = self
            .state
            .assignment(&node, res)
            .and_then(|a| a.snap_assignment(snap))
            .and_then(|sa| sa.vol_state(vol_id))
        else {
            return false;
        };

        if sv.requires_undeploy() {
            let bd = sv.bd_name().map(str::to_string);
            if let Some(bd) = bd {
                if let Err(e) = self.backing.remove_snapshot(&bd).await {
                    warn!("cannot remove snapshot device {}: {}", bd, e);
                    self.failed_actions += 1;
                    self.note_snap_rc(res, snap, RC_STORAGE_FAILED);
                    return false;
                }
                self.pool_changed = true;
            }
            if let Some(asg) = self.state.assignment_mut(&node, res) {
                if let Some(sa) = asg.snap_assignment_mut(snap) {
                    if let Some(sv) = sa.vol_state_mut(vol_id) {
                        sv.set_bd_name(None, &mut self.serial);
                        sv.set_cstate(0, &mut self.serial);
                    }
                }
            }
            debug!("removed snapshot {}@{} volume {}", res, snap, vol_id);
            return true;
        }

        if sv.requires_deploy() {
            // The live volume must be fully deployed before it can be
            // snapshotted; otherwise wait for a later cycle
            let source = self
                .state
                .assignment(&node, res)
                .and_then(|a| a.vol_state(vol_id))
                .filter(|v| {
                    v.cstate() & VSTATE_DEPLOY != 0 && v.tstate() & VSTATE_DEPLOY != 0
                })
                .and_then(|v| v.bd_name().map(str::to_string));
            let Some(source) = source else {
                debug!("snapshot {}@{} volume {}: source not ready", res, snap, vol_id);
                return false;
            };

            let snap_dev = format!("{}_{}", res, snap);
            match self.backing.create_snapshot(&snap_dev, vol_id, &source).await {
                Ok(bd) => {
                    if let Some(asg) = self.state.assignment_mut(&node, res) {
                        if let Some(sa) = asg.snap_assignment_mut(snap) {
                            if let Some(sv) = sa.vol_state_mut(vol_id) {
                                sv.set_bd_name(Some(bd), &mut self.serial);
                                sv.set_cstate(SVSTATE_DEPLOY, &mut self.serial);
                            }
                        }
                    }
                    self.pool_changed = true;
                    debug!("created snapshot {}@{} volume {}", res, snap, vol_id);
                    return true;
                }
                Err(e) => {
                    warn!("cannot snapshot {}/{} as {}: {}", res, vol_id, snap, e);
                    self.failed_actions += 1;
                    self.note_snap_rc(res, snap, RC_STORAGE_FAILED);
                    return false;
                }
            }
        }
        false
    }

    // --- cleanup ---

    /// Physically delete what two-phase deletion has fully torn down:
    /// converged-empty assignments and volume states first, then
    /// REMOVE-flagged volumes, snapshots, resources and nodes that
    /// nothing occupies any longer.
    fn cleanup(&mut self) -> bool {
        let mut changed = false;

        for (node, res) in self.state.assignment_keys() {
            // Volume states of removed volumes, once fully undeployed
            let removable_vols: Vec<u8> = {
                let resource = self.state.resource(&res);
                self.state
                    .assignment(&node, &res)
                    .map(|a| {
                        a.vol_states()
                            .filter(|v| v.cstate() == 0 && v.tstate() == 0)
                            .filter(|v| {
                                resource
                                    .and_then(|r| r.volume(v.id()))
                                    .map(|vol| vol.has_flag(VOL_FLAG_REMOVE))
                                    .unwrap_or(true)
                            })
                            .map(|v| v.id())
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let removable_snaps: Vec<String> = self
                .state
                .assignment(&node, &res)
                .map(|a| {
                    a.snap_assignments()
                        .filter(|sa| sa.is_gone())
                        .map(|sa| sa.snapshot().to_string())
                        .collect()
                })
                .unwrap_or_default();
            if let Some(asg) = self.state.assignment_mut(&node, &res) {
                for vol_id in removable_vols {
                    asg.remove_vol_state(vol_id);
                    changed = true;
                }
                for snap in removable_snaps {
                    asg.remove_snap_assignment(&snap);
                    changed = true;
                }
            }

            let gone = self
                .state
                .assignment(&node, &res)
                .map(|a| a.is_gone() && a.snap_assignments().next().is_none())
                .unwrap_or(false);
            if gone {
                self.state.remove_assignment_entry(&node, &res);
                debug!("cleaned up assignment {}:{}", node, res);
                changed = true;
            }
        }

        for res_name in self.state.resource_names() {
            let (dead_vols, dead_snaps): (Vec<u8>, Vec<String>) = {
                let Some(resource) = self.state.resource(&res_name) else {
                    continue;
                };
                let dead_vols = resource
                    .volumes()
                    .filter(|v| v.has_flag(VOL_FLAG_REMOVE))
                    .filter(|v| {
                        self.state
                            .resource_assignments(&res_name)
                            .all(|a| a.vol_state(v.id()).is_none())
                    })
                    .map(|v| v.id())
                    .collect();
                let dead_snaps = resource
                    .snapshots()
                    .filter(|s| s.has_flag(SNAP_FLAG_REMOVE))
                    .filter(|s| {
                        self.state
                            .resource_assignments(&res_name)
                            .all(|a| a.snap_assignment(s.name()).is_none())
                    })
                    .map(|s| s.name().to_string())
                    .collect();
                (dead_vols, dead_snaps)
            };
            if let Some(resource) = self.state.resource_mut(&res_name) {
                for vol_id in dead_vols {
                    resource.remove_volume_entry(vol_id);
                    debug!("cleaned up volume {}/{}", res_name, vol_id);
                    changed = true;
                }
                for snap in dead_snaps {
                    resource.remove_snapshot_entry(&snap);
                    debug!("cleaned up snapshot {}@{}", res_name, snap);
                    changed = true;
                }
            }

            let dead_res = self
                .state
                .resource(&res_name)
                .map(|r| r.has_flag(RES_FLAG_REMOVE))
                .unwrap_or(false)
                && self.state.resource_assignments(&res_name).next().is_none();
            if dead_res {
                self.state.remove_resource_entry(&res_name);
                debug!("cleaned up resource {}", res_name);
                changed = true;
            }
        }

        for node_name in self.state.node_names() {
            let dead = self
                .state
                .node(&node_name)
                .map(|n| n.has_flag(flock_model::node::NODE_FLAG_REMOVE))
                .unwrap_or(false)
                && self.state.node_assignments(&node_name).next().is_none();
            if dead {
                self.state.remove_node_entry(&node_name);
                debug!("cleaned up node {}", node_name);
                changed = true;
            }
        }

        changed
    }

    // --- helpers ---

    fn asg_flag(&self, res: &str, f: impl Fn(&Assignment) -> bool) -> bool {
        self.state
            .assignment(&self.cfg.node_name, res)
            .map(f)
            .unwrap_or(false)
    }

    /// Record a step's return code on the assignment. Returns true when
    /// the recorded code changed (persist-worthy).
    fn note_rc(&mut self, res: &str, rc: i32) -> bool {
        let node = self.cfg.node_name.clone();
        if let Some(asg) = self.state.assignment_mut(&node, res) {
            if asg.rc() != rc {
                asg.set_rc(rc);
                return true;
            }
        }
        false
    }

    fn note_snap_rc(&mut self, res: &str, snap: &str, rc: i32) {
        let node = self.cfg.node_name.clone();
        if let Some(asg) = self.state.assignment_mut(&node, res) {
            if let Some(sa) = asg.snap_assignment_mut(snap) {
                sa.set_rc(rc);
            }
        }
    }

    fn step_failed(&mut self, res: &str, step: &str, rc: i32, failed: &mut bool) {
        warn!("{} failed for {} (rc={})", step, res, rc);
        self.failed_actions += 1;
        *failed = true;
    }

    /// Deactivate and delete a backing device. Returns false (leaving
    /// the device record in place for a retry) when either step fails.
    async fn release_device(&mut self, bd: &str) -> bool {
        if let Err(e) = self.backing.down(bd).await {
            warn!("cannot deactivate backing device {}: {}", bd, e);
            return false;
        }
        if let Err(e) = self.backing.remove(bd).await {
            warn!("cannot remove backing device {}: {}", bd, e);
            return false;
        }
        self.pool_changed = true;
        true
    }

    /// Nodes with a deployed or deploy-targeted assignment of `res`.
    fn deployed_nodes(&self, res: &str) -> BTreeSet<String> {
        self.state
            .resource_assignments(res)
            .filter(|a| (a.cstate() | a.tstate()) & STATE_DEPLOY != 0)
            .map(|a| a.node().to_string())
            .collect()
    }

    fn conf_full(&self, res: &str) -> String {
        confgen::resource_conf(&self.state, res, None)
    }

    fn conf_path(&self, res: &str) -> PathBuf {
        self.cfg.conf_dir.join(format!("{}.res", res))
    }

    async fn write_conf(&self, res: &str, conf: &str) -> FlockResult<()> {
        tokio::fs::create_dir_all(&self.cfg.conf_dir).await?;
        tokio::fs::write(self.conf_path(res), conf).await?;
        Ok(())
    }

    async fn remove_conf(&self, res: &str) {
        let _ = tokio::fs::remove_file(self.conf_path(res)).await;
    }
}

/// Role decision for assignment-level deployment.
///
/// A node becomes primary exactly when it holds data no peer holds a
/// better claim to: never when it discards its own data, always when it
/// overwrites its peers, and otherwise only if no non-diskless peer is
/// already deployed, restoring a snapshot, or overwriting. A node that
/// is itself restoring yields only to a restoring peer that is already
/// deployed. This guarantees that on first deployment exactly the
/// node(s) holding real data become primary and restored-snapshot nodes
/// never race to overwrite each other.
pub fn primary_deployment(state: &ClusterState, asg: &Assignment) -> bool {
    if asg.has_tstate_flag(ACT_DISCARD) && !asg.has_tstate_flag(ACT_OVERWRITE) {
        return false;
    }
    if asg.has_tstate_flag(ACT_OVERWRITE) {
        return true;
    }
    let local_restore = is_restoring(asg);
    for peer in state
        .resource_assignments(asg.resource())
        .filter(|p| p.node() != asg.node())
    {
        if peer.is_diskless() {
            continue;
        }
        if peer.has_tstate_flag(ACT_OVERWRITE) {
            return false;
        }
        let peer_restore = is_restoring(peer);
        let peer_deployed = peer.is_deployed();
        if !local_restore && (peer_restore || peer_deployed) {
            return false;
        }
        if local_restore && peer_restore && peer_deployed {
            return false;
        }
    }
    true
}

fn is_restoring(asg: &Assignment) -> bool {
    asg.vol_states()
        .any(|v| v.props().contains_key(PROP_RESTORE_SOURCE))
}
