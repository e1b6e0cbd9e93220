//! Resource configuration text generation.
//!
//! The external block-device configuration tool is driven entirely by a
//! generated textual description of a resource and its peers, delivered
//! on its standard input. Two forms exist: the full form covers every
//! assignment of the resource that is deployed or targeted for
//! deployment; the excerpt form is restricted to explicitly included
//! nodes and volumes and is used for intermediate multi-step
//! transitions (partial deploy/undeploy).

use std::collections::BTreeSet;
use std::fmt::Write;

use flock_model::assignment::{Assignment, STATE_DEPLOY, STATE_DISKLESS};
use flock_model::consts::{CTRL_RES_NAME, CTRL_RES_PORT};
use flock_model::node::NODE_FLAG_CONTROL_ROLE;
use flock_model::resource::VOL_FLAG_REMOVE;
use flock_model::ClusterState;

/// Restriction of a generated configuration to explicitly included
/// nodes and volumes.
#[derive(Debug, Clone, Default)]
pub struct Excerpt {
    pub nodes: BTreeSet<String>,
    pub volumes: BTreeSet<u8>,
}

impl Excerpt {
    fn allows_node(&self, name: &str) -> bool {
        self.nodes.contains(name)
    }

    fn allows_volume(&self, id: u8) -> bool {
        self.volumes.contains(&id)
    }
}

/// Generate the configuration text for one resource.
///
/// Assignments are included when they are deployed or targeted for
/// deployment; removed volumes are skipped. With `excerpt`, only the
/// listed nodes and volumes appear.
pub fn resource_conf(state: &ClusterState, res_name: &str, excerpt: Option<&Excerpt>) -> String {
    let mut out = String::new();
    let res = match state.resource(res_name) {
        Some(res) => res,
        None => return out,
    };

    let included: Vec<&Assignment> = state
        .resource_assignments(res_name)
        .filter(|asg| (asg.cstate() | asg.tstate()) & STATE_DEPLOY != 0)
        .filter(|asg| excerpt.map_or(true, |e| e.allows_node(asg.node())))
        .collect();

    let _ = writeln!(out, "resource \"{}\" {{", res.name());
    let _ = writeln!(out, "    net {{");
    let _ = writeln!(out, "        cram-hmac-alg sha256;");
    let _ = writeln!(out, "        shared-secret \"{}\";", res.secret());
    let _ = writeln!(out, "    }}");

    if included.len() > 1 {
        let hosts: Vec<&str> = included.iter().map(|a| a.node()).collect();
        let _ = writeln!(out, "    connection-mesh {{");
        let _ = writeln!(out, "        hosts {};", hosts.join(" "));
        let _ = writeln!(out, "    }}");
    }

    for asg in &included {
        let node = match state.node(asg.node()) {
            Some(node) => node,
            None => continue,
        };
        let _ = writeln!(out, "    on {} {{", node.name());
        let _ = writeln!(out, "        node-id {};", asg.node_id());
        let _ = writeln!(
            out,
            "        address {} {}:{};",
            node.af().label(),
            node.addr(),
            res.port()
        );
        let diskless = asg.tstate() & STATE_DISKLESS != 0;
        for vol in res.volumes().filter(|v| !v.has_flag(VOL_FLAG_REMOVE)) {
            if excerpt.is_some_and(|e| !e.allows_volume(vol.id())) {
                continue;
            }
            let _ = writeln!(out, "        volume {} {{", vol.id());
            let _ = writeln!(out, "            device minor {};", vol.minor());
            let bd = asg.vol_state(vol.id()).and_then(|v| v.bd_name());
            match bd {
                Some(bd) if !diskless => {
                    let _ = writeln!(out, "            disk {};", bd);
                    let _ = writeln!(out, "            meta-disk internal;");
                }
                _ => {
                    let _ = writeln!(out, "            disk none;");
                }
            }
            let _ = writeln!(out, "        }}");
        }
        let _ = writeln!(out, "    }}");
    }

    let _ = writeln!(out, "}}");
    out
}

/// Generate the local connection configuration for the control volume:
/// every node carrying the control role, one fixed volume backed by
/// `ctrl_disk` on each. Regenerated whenever a node's UPDATE flag
/// signals a membership change.
pub fn control_conf(state: &ClusterState, ctrl_disk: &str) -> String {
    let mut out = String::new();
    let members: Vec<_> = state
        .nodes()
        .filter(|n| n.has_flag(NODE_FLAG_CONTROL_ROLE))
        .collect();

    let _ = writeln!(out, "resource \"{}\" {{", CTRL_RES_NAME);
    if members.len() > 1 {
        let hosts: Vec<&str> = members.iter().map(|n| n.name()).collect();
        let _ = writeln!(out, "    connection-mesh {{");
        let _ = writeln!(out, "        hosts {};", hosts.join(" "));
        let _ = writeln!(out, "    }}");
    }
    for (node_id, node) in members.iter().enumerate() {
        let _ = writeln!(out, "    on {} {{", node.name());
        let _ = writeln!(out, "        node-id {};", node_id);
        let _ = writeln!(
            out,
            "        address {} {}:{};",
            node.af().label(),
            node.addr(),
            CTRL_RES_PORT
        );
        let _ = writeln!(out, "        volume 0 {{");
        let _ = writeln!(out, "            device minor 0;");
        let _ = writeln!(out, "            disk {};", ctrl_disk);
        let _ = writeln!(out, "            meta-disk internal;");
        let _ = writeln!(out, "        }}");
        let _ = writeln!(out, "    }}");
    }
    let _ = writeln!(out, "}}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_model::assignment::STATE_CONNECT;
    use flock_model::node::AddressFamily;
    use flock_model::SerialGen;

    fn sample_state() -> (ClusterState, SerialGen) {
        let mut serial = SerialGen::default();
        let mut state = ClusterState::new();
        state
            .create_node("n1", "10.0.0.1", AddressFamily::Ipv4, 0, &mut serial)
            .unwrap();
        state
            .create_node("n2", "10.0.0.2", AddressFamily::Ipv4, 0, &mut serial)
            .unwrap();
        state
            .create_resource("r1", 7700, "topsecret", &mut serial)
            .unwrap();
        state.create_volume("r1", 1 << 20, 100, &mut serial).unwrap();
        state
            .assign("n1", "r1", STATE_DEPLOY | STATE_CONNECT, &mut serial)
            .unwrap();
        state
            .assign("n2", "r1", STATE_DEPLOY | STATE_CONNECT, &mut serial)
            .unwrap();
        (state, serial)
    }

    #[test]
    fn test_full_conf_includes_both_nodes() {
        let (state, _) = sample_state();
        let conf = resource_conf(&state, "r1", None);
        assert!(conf.contains("resource \"r1\""));
        assert!(conf.contains("on n1 {"));
        assert!(conf.contains("on n2 {"));
        assert!(conf.contains("hosts n1 n2;"));
        assert!(conf.contains("shared-secret \"topsecret\";"));
        assert!(conf.contains("address ipv4 10.0.0.1:7700;"));
        assert!(conf.contains("device minor 100;"));
    }

    #[test]
    fn test_unbacked_volume_is_diskless() {
        let (state, _) = sample_state();
        let conf = resource_conf(&state, "r1", None);
        // No backing device allocated yet
        assert!(conf.contains("disk none;"));
    }

    #[test]
    fn test_backed_volume_lists_disk() {
        let (mut state, mut serial) = sample_state();
        state
            .assignment_mut("n1", "r1")
            .unwrap()
            .vol_state_mut(0)
            .unwrap()
            .set_bd_name(Some("/dev/pool/r1_00".to_string()), &mut serial);
        let conf = resource_conf(&state, "r1", None);
        assert!(conf.contains("disk /dev/pool/r1_00;"));
        assert!(conf.contains("meta-disk internal;"));
    }

    #[test]
    fn test_excerpt_restricts_nodes() {
        let (state, _) = sample_state();
        let excerpt = Excerpt {
            nodes: ["n1".to_string()].into(),
            volumes: [0u8].into(),
        };
        let conf = resource_conf(&state, "r1", Some(&excerpt));
        assert!(conf.contains("on n1 {"));
        assert!(!conf.contains("on n2 {"));
        // A single included node has no mesh
        assert!(!conf.contains("connection-mesh"));
    }

    #[test]
    fn test_undeployed_assignment_excluded() {
        let (mut state, mut serial) = sample_state();
        state.unassign("n2", "r1", false, &mut serial).unwrap();
        let conf = resource_conf(&state, "r1", None);
        assert!(!conf.contains("on n2 {"));
    }

    #[test]
    fn test_control_conf_lists_control_nodes() {
        let (mut state, mut serial) = sample_state();
        state
            .node_mut("n1")
            .unwrap()
            .raise_flags(NODE_FLAG_CONTROL_ROLE, &mut serial);
        state
            .node_mut("n2")
            .unwrap()
            .raise_flags(NODE_FLAG_CONTROL_ROLE, &mut serial);
        let conf = control_conf(&state, "/dev/pool/ctrl_00");
        assert!(conf.contains(&format!("resource \"{}\"", CTRL_RES_NAME)));
        assert!(conf.contains("hosts n1 n2;"));
        assert!(conf.contains("disk /dev/pool/ctrl_00;"));
    }
}
