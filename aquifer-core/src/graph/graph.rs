//! Scope Graph
//!
//! The central arena of scope nodes, indexed by stable identifiers.
//! All structural maintenance lives here: creating scopes, wiring and
//! unwiring parent edges (with cycle rejection *before* any mutation
//! commits), downward traversal for incremental re-resolution, and the
//! reclamation sweep.
//!
//! # Ownership
//!
//! The graph itself holds nodes strongly but knows who owns each node:
//! external handles, attached producers, child scopes, and live consumer
//! streams (held weakly by the node). The sweep repeatedly frees nodes
//! whose owner set is empty and prunes the adjacency they leave behind,
//! until a fixpoint — reclaiming a leaf can render its parent
//! reclaimable in the same pass.

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::grip::Grip;

use super::node::{ScopeId, ScopeNode};

/// The arena of scope nodes.
pub(crate) struct ScopeGraph {
    nodes: IndexMap<ScopeId, ScopeNode>,
}

impl ScopeGraph {
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
        }
    }

    /// Create a new scope with no parents (a root until linked).
    pub fn insert(&mut self, label: impl Into<String>) -> ScopeId {
        let id = ScopeId::new();
        let node = ScopeNode::new(id, label);
        debug!(scope = id.raw(), label = node.label(), "scope created");
        self.nodes.insert(id, node);
        id
    }

    pub fn contains(&self, id: ScopeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: ScopeId) -> Option<&ScopeNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: ScopeId) -> Option<&mut ScopeNode> {
        self.nodes.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScopeNode> {
        self.nodes.values()
    }

    /// Add (or re-prioritize) the parent edge `child → parent`.
    ///
    /// A cycle-forming edge is rejected by an upward reachability check
    /// before anything mutates; there is no apply-then-rollback path.
    pub fn add_parent(&mut self, child: ScopeId, parent: ScopeId, priority: i32) -> Result<()> {
        if !self.contains(child) {
            return Err(EngineError::UnknownScope(child));
        }
        if !self.contains(parent) {
            return Err(EngineError::UnknownScope(parent));
        }
        if child == parent || self.reaches_upward(parent, child) {
            return Err(EngineError::CycleDetected { child, parent });
        }

        self.nodes
            .get_mut(&child)
            .expect("checked above")
            .insert_parent(parent, priority);
        self.nodes
            .get_mut(&parent)
            .expect("checked above")
            .add_child(child);
        debug!(
            child = child.raw(),
            parent = parent.raw(),
            priority,
            "parent edge added"
        );
        Ok(())
    }

    /// Remove the parent edge `child → parent`. Returns whether an edge
    /// existed.
    pub fn remove_parent(&mut self, child: ScopeId, parent: ScopeId) -> bool {
        let removed = self
            .nodes
            .get_mut(&child)
            .map(|node| node.remove_parent(parent))
            .unwrap_or(false);
        if removed {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.remove_child(child);
            }
            debug!(child = child.raw(), parent = parent.raw(), "parent edge removed");
        }
        removed
    }

    /// True if `target` is reachable from `from` by walking parent
    /// edges. Used for cycle rejection.
    fn reaches_upward(&self, from: ScopeId, target: ScopeId) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                for edge in node.parents() {
                    queue.push_back(edge.id);
                }
            }
        }
        false
    }

    /// `start` plus everything reachable from it through child edges.
    pub fn descendants(&self, start: ScopeId) -> Vec<ScopeId> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                out.push(id);
                for child in node.children() {
                    queue.push_back(child);
                }
            }
        }
        out
    }

    /// Every (scope, grip) pair with a live consumer at or below
    /// `start`, restricted to `grips` when given.
    pub fn consumers_below(&self, start: ScopeId, grips: Option<&[Grip]>) -> Vec<(ScopeId, Grip)> {
        let mut out = Vec::new();
        for id in self.descendants(start) {
            let Some(node) = self.nodes.get(&id) else { continue };
            match grips {
                Some(grips) => {
                    for grip in grips {
                        if node.consumer(grip).is_some() {
                            out.push((id, grip.clone()));
                        }
                    }
                }
                None => {
                    for grip in node.live_consumer_grips() {
                        out.push((id, grip));
                    }
                }
            }
        }
        out
    }

    /// Reclaim every scope whose owner set is empty, repeating until a
    /// fixpoint. Returns the reclaimed IDs.
    pub fn sweep(&mut self) -> Vec<ScopeId> {
        let mut reclaimed = Vec::new();
        loop {
            // Stale weak consumers do not count as owners.
            for node in self.nodes.values_mut() {
                node.prune_dead_consumers();
            }

            let dead: Vec<ScopeId> = self
                .nodes
                .values()
                .filter(|node| node.is_reclaimable())
                .map(|node| node.id())
                .collect();
            if dead.is_empty() {
                break;
            }

            for id in dead {
                let node = self.nodes.shift_remove(&id).expect("selected above");
                for edge in node.parents() {
                    if let Some(parent) = self.nodes.get_mut(&edge.id) {
                        parent.remove_child(id);
                    }
                }
                debug!(scope = id.raw(), label = node.label(), "scope reclaimed");
                reclaimed.push(id);
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_parent_edges() {
        let mut graph = ScopeGraph::new();
        let root = graph.insert("root");
        let child = graph.insert("child");

        graph.add_parent(child, root, 0).unwrap();
        assert!(graph.node(child).unwrap().parents().iter().any(|e| e.id == root));
        assert!(graph.node(root).unwrap().children().any(|c| c == child));

        assert!(graph.remove_parent(child, root));
        assert!(graph.node(child).unwrap().is_root());
        assert!(!graph.node(root).unwrap().children().any(|c| c == child));
        assert!(!graph.remove_parent(child, root));
    }

    #[test]
    fn cycle_forming_edge_is_rejected_without_mutation() {
        let mut graph = ScopeGraph::new();
        let a = graph.insert("a");
        let b = graph.insert("b");
        let c = graph.insert("c");

        graph.add_parent(b, a, 0).unwrap();
        graph.add_parent(c, b, 0).unwrap();

        // a → c would close the loop a ← b ← c.
        let err = graph.add_parent(a, c, 0).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));

        // Edge counts are untouched.
        assert_eq!(graph.node(a).unwrap().parents().len(), 0);
        assert_eq!(graph.node(b).unwrap().parents().len(), 1);
        assert_eq!(graph.node(c).unwrap().parents().len(), 1);
        assert!(!graph.node(c).unwrap().children().any(|x| x == a));

        // Self-edges are cycles too.
        assert!(matches!(
            graph.add_parent(a, a, 0),
            Err(EngineError::CycleDetected { .. })
        ));
    }

    #[test]
    fn descendants_walk_child_edges() {
        let mut graph = ScopeGraph::new();
        let root = graph.insert("root");
        let mid = graph.insert("mid");
        let leaf = graph.insert("leaf");
        let other = graph.insert("other");

        graph.add_parent(mid, root, 0).unwrap();
        graph.add_parent(leaf, mid, 0).unwrap();

        let below = graph.descendants(root);
        assert!(below.contains(&root));
        assert!(below.contains(&mid));
        assert!(below.contains(&leaf));
        assert!(!below.contains(&other));
    }

    #[test]
    fn sweep_reclaims_ownerless_chains() {
        let mut graph = ScopeGraph::new();
        let root = graph.insert("root");
        let child = graph.insert("child");
        graph.add_parent(child, root, 0).unwrap();

        // The child is pinned by an external handle; the root is pinned
        // by the child.
        graph.node_mut(child).unwrap().add_handle();
        assert!(graph.sweep().is_empty());
        assert_eq!(graph.iter().count(), 2);

        // Releasing the handle frees the child, which in the same sweep
        // frees the now-childless root.
        graph.node_mut(child).unwrap().drop_handle();
        let reclaimed = graph.sweep();
        assert_eq!(reclaimed.len(), 2);
        assert_eq!(graph.iter().count(), 0);
    }

    #[test]
    fn unknown_scope_is_reported() {
        let mut graph = ScopeGraph::new();
        let a = graph.insert("a");
        let ghost = ScopeId::new();

        assert!(matches!(
            graph.add_parent(a, ghost, 0),
            Err(EngineError::UnknownScope(_))
        ));
        assert!(matches!(
            graph.add_parent(ghost, a, 0),
            Err(EngineError::UnknownScope(_))
        ));
    }
}
