//! Local port bookkeeping: proposals for new tunnels and the pre-flight
//! collision check. Ports are always recomputed from a full tree scan.

use crate::models::DEFAULT_SSH_PORT;
use crate::tree::TunnelTree;
use std::collections::BTreeSet;
use uuid::Uuid;

pub const FIRST_PROPOSED_PORT: u16 = 50001;
pub const PROPOSAL_FLOOR: u16 = 50000;
pub const MIN_LOCAL_PORT: u16 = 1025;
pub const MAX_LOCAL_PORT: u16 = 65534;

/// Ports typed into an edit form that is not saved yet.
#[derive(Debug, Clone, Default)]
pub struct EditFormPorts {
    pub local_port: u16,
    pub forward_ports: Vec<u16>,
}

/// The node a port is proposed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortTarget {
    Existing(Uuid),
    /// A node about to be created under the given parent.
    NewChildOf(Option<Uuid>),
}

/// A port the node would bind that an active node already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConflict {
    pub port: u16,
    pub holder: Uuid,
}

/// Every local port configured in the tree, primary and enabled forwards.
/// The primary port of `except` is left out; its forwards still count.
pub fn ports_in_use(tree: &TunnelTree, except: Option<Uuid>) -> BTreeSet<u16> {
    tree.iter()
        .flat_map(|n| {
            let mut ports = n.config.bound_ports();
            if Some(n.id()) == except && n.is_tunnel() && n.config.local_port != 0 {
                // bound_ports lists the primary port first
                ports.remove(0);
            }
            ports
        })
        .collect()
}

/// First port of `id` that is bound twice by the node itself, or already
/// bound by another Connecting/Connected node.
pub fn find_port_conflict(tree: &TunnelTree, id: Uuid) -> Option<PortConflict> {
    let node = tree.get(id)?;
    let wanted = node.config.bound_ports();
    if wanted.is_empty() {
        return None;
    }

    let mut seen = BTreeSet::new();
    if let Some(&port) = wanted.iter().find(|p| !seen.insert(**p)) {
        return Some(PortConflict { port, holder: id });
    }

    tree.iter()
        .filter(|other| other.id() != id && other.status.is_active())
        .find_map(|other| {
            let held = other.config.bound_ports();
            wanted
                .iter()
                .find(|p| held.contains(p))
                .map(|&port| PortConflict {
                    port,
                    holder: other.id(),
                })
        })
}

pub struct PortAllocator<'t> {
    tree: &'t TunnelTree,
}

impl<'t> PortAllocator<'t> {
    pub fn new(tree: &'t TunnelTree) -> Self {
        Self { tree }
    }

    /// Propose a free local port for `target`. Returns 0 when nothing fits.
    pub fn propose(&self, target: PortTarget, form: Option<&EditFormPorts>, exclude: &[u16]) -> u16 {
        let (self_id, parent) = match target {
            PortTarget::Existing(id) => (Some(id), self.tree.parent(id)),
            PortTarget::NewChildOf(parent) => (None, parent),
        };

        let mut used = ports_in_use(self.tree, self_id);
        if let Some(form) = form {
            used.extend(
                std::iter::once(form.local_port)
                    .chain(form.forward_ports.iter().copied())
                    .filter(|p| *p != 0),
            );
        }
        used.extend(exclude.iter().copied());

        let candidate = self.heuristic(self_id, parent);
        let mut port = candidate.max(u32::from(MIN_LOCAL_PORT));
        while port <= u32::from(MAX_LOCAL_PORT) && used.contains(&(port as u16)) {
            port += 1;
        }
        if port > u32::from(MAX_LOCAL_PORT) {
            tracing::warn!("No free local port left above {}", candidate);
            return 0;
        }
        port as u16
    }

    fn heuristic(&self, self_id: Option<Uuid>, parent: Option<Uuid>) -> u32 {
        if self.tree.tunnel_count() <= 1 {
            return u32::from(FIRST_PROPOSED_PORT);
        }

        let siblings: &[Uuid] = match parent {
            Some(p) => self.tree.children(p),
            None => self.tree.roots(),
        };
        let sibling_max = siblings
            .iter()
            .filter(|id| Some(**id) != self_id)
            .filter_map(|id| self.tree.get(*id))
            .filter(|n| n.is_tunnel() && n.config.remote_port == DEFAULT_SSH_PORT)
            .map(|n| n.config.local_port)
            .filter(|p| *p != 0)
            .max();
        if let Some(max) = sibling_max {
            return u32::from(max) + 1;
        }

        let parent_tunnel = match (self_id, parent) {
            (Some(id), _) => self.tree.effective_parent_tunnel(id),
            (None, Some(p)) if self.tree.get(p).is_some_and(|n| n.is_tunnel()) => Some(p),
            (None, Some(p)) => self.tree.effective_parent_tunnel(p),
            (None, None) => None,
        };
        if let Some(port) = parent_tunnel
            .and_then(|p| self.tree.get(p))
            .map(|n| n.config.local_port)
            .filter(|p| *p != 0)
        {
            return u32::from(port) + 1;
        }

        let ssh_max = self
            .tree
            .tunnels()
            .filter(|n| Some(n.id()) != self_id && n.config.remote_port == DEFAULT_SSH_PORT)
            .map(|n| n.config.local_port)
            .max()
            .unwrap_or(0)
            .max(PROPOSAL_FLOOR);
        u32::from(ssh_max) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectStatus, PortForward, TunnelConfig};

    fn tunnel(name: &str, remote_port: u16, local_port: u16) -> TunnelConfig {
        let mut cfg = TunnelConfig::new_tunnel(name, "host", remote_port);
        cfg.local_port = local_port;
        cfg
    }

    #[test]
    fn test_single_tunnel_gets_default() {
        let mut tree = TunnelTree::new();
        let folder = tree.insert(None, TunnelConfig::new_folder("f")).unwrap();
        let t = tree.insert(Some(folder), tunnel("t", 22, 0)).unwrap();
        let port = PortAllocator::new(&tree).propose(PortTarget::Existing(t), None, &[]);
        assert_eq!(port, FIRST_PROPOSED_PORT);
        assert!(port >= MIN_LOCAL_PORT);
    }

    #[test]
    fn test_siblings_propose_consecutive_ports() {
        let mut tree = TunnelTree::new();
        let a = tree.insert(None, tunnel("a", 22, 0)).unwrap();
        let b = tree.insert(None, tunnel("b", 22, 0)).unwrap();

        let first = PortAllocator::new(&tree).propose(PortTarget::Existing(a), None, &[]);
        tree.get_mut(a).unwrap().config.local_port = first;
        let second = PortAllocator::new(&tree).propose(PortTarget::Existing(b), None, &[]);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_child_follows_parent_port() {
        let mut tree = TunnelTree::new();
        let parent = tree.insert(None, tunnel("gw", 22, 40000)).unwrap();
        let folder = tree.insert(Some(parent), TunnelConfig::new_folder("f")).unwrap();
        let child = tree.insert(Some(folder), tunnel("db", 5432, 0)).unwrap();
        let port = PortAllocator::new(&tree).propose(PortTarget::Existing(child), None, &[]);
        assert_eq!(port, 40001);

        let new_port = PortAllocator::new(&tree).propose(PortTarget::NewChildOf(Some(folder)), None, &[]);
        // the existing child has remote 5432, so it is no sibling candidate
        assert_eq!(new_port, 40001);
    }

    #[test]
    fn test_floor_and_exclusions() {
        let mut tree = TunnelTree::new();
        let a = tree.insert(None, tunnel("a", 3306, 3306)).unwrap();
        let b = tree.insert(Some(a), tunnel("b", 80, 0)).unwrap();
        let port = PortAllocator::new(&tree).propose(PortTarget::Existing(b), None, &[3307, 3308]);
        assert_eq!(port, 3309);

        let mut tree = TunnelTree::new();
        tree.insert(None, tunnel("a", 80, 8080)).unwrap();
        tree.insert(None, tunnel("b", 80, 0)).unwrap();
        let form = EditFormPorts {
            local_port: 50001,
            forward_ports: vec![50002, 0],
        };
        let port = PortAllocator::new(&tree).propose(PortTarget::NewChildOf(None), Some(&form), &[]);
        assert_eq!(port, 50003);
    }

    #[test]
    fn test_clamp_and_exhaustion() {
        let mut tree = TunnelTree::new();
        let parent = tree.insert(None, tunnel("gw", 22, 80)).unwrap();
        let child = tree.insert(Some(parent), tunnel("c", 443, 0)).unwrap();
        assert_eq!(
            PortAllocator::new(&tree).propose(PortTarget::Existing(child), None, &[]),
            MIN_LOCAL_PORT
        );

        tree.get_mut(parent).unwrap().config.local_port = MAX_LOCAL_PORT;
        assert_eq!(
            PortAllocator::new(&tree).propose(PortTarget::Existing(child), None, &[]),
            0
        );
    }

    #[test]
    fn test_never_returns_used_port() {
        let mut tree = TunnelTree::new();
        let mut a = tunnel("a", 22, 50001);
        a.port_forwards.push(PortForward::new_local(50003, "x", 1));
        tree.insert(None, a).unwrap();
        tree.insert(None, tunnel("b", 22, 50002)).unwrap();
        let used = ports_in_use(&tree, None);
        for exclude in [vec![], vec![50004], vec![50004, 50005]] {
            let port = PortAllocator::new(&tree).propose(PortTarget::NewChildOf(None), None, &exclude);
            assert!(!used.contains(&port));
            assert!(!exclude.contains(&port));
        }
    }

    #[test]
    fn test_conflict_only_against_active_nodes() {
        let mut tree = TunnelTree::new();
        let a = tree.insert(None, tunnel("a", 22, 50001)).unwrap();
        let mut b_cfg = tunnel("b", 22, 50002);
        b_cfg.port_forwards.push(PortForward::new_dynamic(50001));
        let b = tree.insert(None, b_cfg).unwrap();

        assert_eq!(find_port_conflict(&tree, b), None);
        tree.get_mut(a).unwrap().status = ConnectStatus::Connecting;
        assert_eq!(
            find_port_conflict(&tree, b),
            Some(PortConflict {
                port: 50001,
                holder: a
            })
        );
        tree.get_mut(a).unwrap().status = ConnectStatus::MarkedForConnect;
        assert_eq!(find_port_conflict(&tree, b), None);
    }

    #[test]
    fn test_proposal_skips_own_forward_ports() {
        let mut tree = TunnelTree::new();
        let mut cfg = tunnel("socks", 22, 0);
        cfg.port_forwards.push(PortForward::new_dynamic(50001));
        let t = tree.insert(None, cfg).unwrap();

        let port = PortAllocator::new(&tree).propose(PortTarget::Existing(t), None, &[]);
        assert_eq!(port, 50002);

        // the stored primary port of the target itself stays available
        tree.get_mut(t).unwrap().config.local_port = 50002;
        let again = PortAllocator::new(&tree).propose(PortTarget::Existing(t), None, &[]);
        assert_eq!(again, 50002);
    }

    #[test]
    fn test_conflict_within_one_node() {
        let mut tree = TunnelTree::new();
        let mut cfg = tunnel("dup", 22, 50001);
        cfg.port_forwards.push(PortForward::new_dynamic(50001));
        let t = tree.insert(None, cfg).unwrap();

        assert_eq!(
            find_port_conflict(&tree, t),
            Some(PortConflict {
                port: 50001,
                holder: t
            })
        );

        tree.get_mut(t).unwrap().config.port_forwards[0].enabled = false;
        assert_eq!(find_port_conflict(&tree, t), None);
    }
}
