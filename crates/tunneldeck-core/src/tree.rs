//! Arena of tunnel nodes addressed by their stable UUID.
//!
//! The tree owns every [`TunnelNode`]; relationships are stored as ids so the
//! orchestrator can mutate runtime state of one node while reading others.

use crate::error::{Result, TunnelDeckError};
use crate::models::{TunnelConfig, TunnelNode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// On-disk shape of a node: its configuration with children nested inline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedNode {
    #[serde(flatten)]
    pub config: TunnelConfig,
    #[serde(rename = "Children", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PersistedNode>,
}

impl PersistedNode {
    pub fn leaf(config: TunnelConfig) -> Self {
        Self {
            config,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TunnelTree {
    nodes: HashMap<Uuid, TunnelNode>,
    roots: Vec<Uuid>,
}

impl TunnelTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the arena from persisted nodes. Duplicate UUIDs get a fresh id.
    pub fn from_persisted(nodes: Vec<PersistedNode>) -> Self {
        let mut tree = Self::new();
        for node in nodes {
            tree.insert_persisted(None, node);
        }
        tree
    }

    fn insert_persisted(&mut self, parent: Option<Uuid>, node: PersistedNode) {
        let mut config = node.config;
        if self.nodes.contains_key(&config.uuid) {
            tracing::warn!(
                "Duplicate node id {} for '{}', assigning a new one",
                config.uuid,
                config.name
            );
            config.uuid = Uuid::new_v4();
        }
        let id = config.uuid;
        self.attach(parent, TunnelNode::new(config));
        for child in node.children {
            self.insert_persisted(Some(id), child);
        }
    }

    pub fn to_persisted(&self) -> Vec<PersistedNode> {
        self.roots.iter().map(|id| self.persist_node(*id)).collect()
    }

    fn persist_node(&self, id: Uuid) -> PersistedNode {
        let node = &self.nodes[&id];
        PersistedNode {
            config: node.config.clone(),
            children: node.children.iter().map(|c| self.persist_node(*c)).collect(),
        }
    }

    fn attach(&mut self, parent: Option<Uuid>, mut node: TunnelNode) -> Uuid {
        let id = node.id();
        node.parent = parent;
        match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(p) => p.children.push(id),
            None => self.roots.push(id),
        }
        self.nodes.insert(id, node);
        id
    }

    /// Insert a node under `parent` (or at the top level).
    pub fn insert(&mut self, parent: Option<Uuid>, config: TunnelConfig) -> Result<Uuid> {
        if let Some(p) = parent {
            if !self.nodes.contains_key(&p) {
                return Err(TunnelDeckError::NodeNotFound(p));
            }
        }
        if self.nodes.contains_key(&config.uuid) {
            return Err(TunnelDeckError::Tree(format!(
                "node id {} already present",
                config.uuid
            )));
        }
        Ok(self.attach(parent, TunnelNode::new(config)))
    }

    /// Remove a node and its subtree. Every removed node must be inactive.
    pub fn remove(&mut self, id: Uuid) -> Result<Vec<TunnelNode>> {
        if !self.nodes.contains_key(&id) {
            return Err(TunnelDeckError::NodeNotFound(id));
        }
        let mut subtree = vec![id];
        subtree.extend(self.descendants(id));
        if let Some(busy) = subtree.iter().find(|n| self.nodes[*n].status.is_active()) {
            return Err(TunnelDeckError::Tree(format!(
                "'{}' still has a running process",
                self.nodes[busy].name()
            )));
        }

        match self.nodes[&id].parent {
            Some(p) => {
                if let Some(parent) = self.nodes.get_mut(&p) {
                    parent.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }

        Ok(subtree
            .into_iter()
            .filter_map(|n| self.nodes.remove(&n))
            .collect())
    }

    pub fn get(&self, id: Uuid) -> Option<&TunnelNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut TunnelNode> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[Uuid] {
        &self.roots
    }

    pub fn children(&self, id: Uuid) -> &[Uuid] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent(&self, id: Uuid) -> Option<Uuid> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    /// Number of ancestors; top-level nodes have depth 0.
    pub fn depth(&self, id: Uuid) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent(id);
        while let Some(p) = cursor {
            depth += 1;
            cursor = self.parent(p);
        }
        depth
    }

    /// Nearest ancestor of kind Tunnel, skipping folders.
    pub fn effective_parent_tunnel(&self, id: Uuid) -> Option<Uuid> {
        let mut cursor = self.parent(id);
        while let Some(p) = cursor {
            let node = self.nodes.get(&p)?;
            if node.is_tunnel() {
                return Some(p);
            }
            cursor = node.parent;
        }
        None
    }

    /// Depth-first pre-order walk of the subtree at `root`, or of the whole tree.
    pub fn walk(&self, root: Option<Uuid>) -> Vec<Uuid> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<Uuid> = match root {
            Some(r) if self.nodes.contains_key(&r) => vec![r],
            Some(_) => Vec::new(),
            None => self.roots.iter().rev().copied().collect(),
        };
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        order
    }

    /// Every node below `id`, excluding `id` itself.
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let mut all = self.walk(Some(id));
        if !all.is_empty() {
            all.remove(0);
        }
        all
    }

    pub fn iter(&self) -> impl Iterator<Item = &TunnelNode> {
        self.nodes.values()
    }

    pub fn tunnels(&self) -> impl Iterator<Item = &TunnelNode> {
        self.nodes.values().filter(|n| n.is_tunnel())
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels().count()
    }

    /// Look a node up by UUID, by `/`-separated name path, or by unique name.
    pub fn find(&self, query: &str) -> Option<Uuid> {
        if let Ok(id) = Uuid::parse_str(query) {
            if self.nodes.contains_key(&id) {
                return Some(id);
            }
        }
        if query.contains('/') {
            let mut level: &[Uuid] = &self.roots;
            let mut found = None;
            for part in query.split('/').filter(|p| !p.is_empty()) {
                let id = *level.iter().find(|id| self.nodes[*id].name() == part)?;
                found = Some(id);
                level = self.children(id);
            }
            return found;
        }
        let mut matches = self.walk(None).into_iter().filter(|id| self.nodes[id].name() == query);
        let first = matches.next()?;
        match matches.next() {
            Some(_) => None,
            None => Some(first),
        }
    }

    /// `/`-joined names from the top level down to `id`.
    pub fn path(&self, id: Uuid) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            match self.nodes.get(&c) {
                Some(node) => {
                    parts.push(node.name().to_string());
                    cursor = node.parent;
                }
                None => break,
            }
        }
        parts.reverse();
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectStatus, NodeKind};

    fn sample() -> (TunnelTree, Uuid, Uuid, Uuid, Uuid) {
        let mut tree = TunnelTree::new();
        let bastion = tree
            .insert(None, TunnelConfig::new_tunnel("bastion", "gw.example.com", 22))
            .unwrap();
        let folder = tree
            .insert(Some(bastion), TunnelConfig::new_folder("internal"))
            .unwrap();
        let db = tree
            .insert(Some(folder), TunnelConfig::new_tunnel("db", "localhost", 22))
            .unwrap();
        let other = tree
            .insert(None, TunnelConfig::new_tunnel("other", "o.example.com", 22))
            .unwrap();
        (tree, bastion, folder, db, other)
    }

    #[test]
    fn test_effective_parent_skips_folders() {
        let (tree, bastion, folder, db, other) = sample();
        assert_eq!(tree.effective_parent_tunnel(db), Some(bastion));
        assert_eq!(tree.effective_parent_tunnel(folder), Some(bastion));
        assert_eq!(tree.effective_parent_tunnel(bastion), None);
        assert_eq!(tree.effective_parent_tunnel(other), None);
        assert_eq!(tree.depth(db), 2);
    }

    #[test]
    fn test_walk_preorder() {
        let (tree, bastion, folder, db, other) = sample();
        assert_eq!(tree.walk(None), vec![bastion, folder, db, other]);
        assert_eq!(tree.walk(Some(folder)), vec![folder, db]);
        assert_eq!(tree.descendants(bastion), vec![folder, db]);
    }

    #[test]
    fn test_find_by_name_and_path() {
        let (tree, _, _, db, _) = sample();
        assert_eq!(tree.find("db"), Some(db));
        assert_eq!(tree.find("bastion/internal/db"), Some(db));
        assert_eq!(tree.find(&db.to_string()), Some(db));
        assert_eq!(tree.find("missing"), None);
        assert_eq!(tree.path(db), "bastion/internal/db");
    }

    #[test]
    fn test_remove_refuses_active_subtree() {
        let (mut tree, bastion, folder, db, _) = sample();
        tree.get_mut(db).unwrap().status = ConnectStatus::Connected;
        assert!(tree.remove(bastion).is_err());
        tree.get_mut(db).unwrap().status = ConnectStatus::Disconnected;
        let removed = tree.remove(folder).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(tree.children(bastion).is_empty());
        assert!(!tree.contains(db));
    }

    #[test]
    fn test_persisted_round_trip_keeps_shape() {
        let (tree, bastion, _, db, _) = sample();
        let persisted = tree.to_persisted();
        let json = serde_json::to_string(&persisted).unwrap();
        assert!(json.contains("\"Children\""));
        let restored: Vec<PersistedNode> = serde_json::from_str(&json).unwrap();
        let tree2 = TunnelTree::from_persisted(restored);
        assert_eq!(tree2.len(), 4);
        assert_eq!(tree2.effective_parent_tunnel(db), Some(bastion));
        assert_eq!(tree2.get(bastion).unwrap().config.kind, NodeKind::Tunnel);
    }
}
