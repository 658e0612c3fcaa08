//! Scope Nodes
//!
//! This module defines the per-node bookkeeping of the scope graph.
//! A scope is the inheritance and resolution boundary: it carries its
//! ordered parent edges, back-references to children, the producers
//! attached to it, the consumer streams requested at it (held weakly),
//! and the resolved-provider cache that makes unlinking O(1).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::graph::tap::TapId;
use crate::grip::Grip;
use crate::stream::Drip;

/// Unique identifier for a scope in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Generate a new unique scope ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

/// One parent link. Higher priority means closer precedence during
/// resolution; edges are kept stable-sorted by descending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParentEdge {
    pub id: ScopeId,
    pub priority: i32,
}

/// A node in the scope graph.
pub(crate) struct ScopeNode {
    id: ScopeId,
    label: String,

    /// Ordered parent edges, priority descending, stable among equals.
    parents: SmallVec<[ParentEdge; 2]>,

    /// Back-references to children (scopes listing this one as parent).
    children: IndexSet<ScopeId>,

    /// Producers attached here, per grip. The stack's top (last entry)
    /// is the active one; detaching it restores the previous.
    taps: HashMap<Grip, SmallVec<[TapId; 1]>>,

    /// Consumer streams requested at this scope, held weakly.
    consumers: HashMap<Grip, Weak<Drip>>,

    /// Resolved-provider cache: grip → the record currently serving it.
    providers: HashMap<Grip, TapId>,

    /// Count of live external handles.
    handles: usize,
}

impl ScopeNode {
    pub fn new(id: ScopeId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            parents: SmallVec::new(),
            children: IndexSet::new(),
            taps: HashMap::new(),
            consumers: HashMap::new(),
            providers: HashMap::new(),
            handles: 0,
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Parent edges in resolution order.
    pub fn parents(&self) -> &[ParentEdge] {
        &self.parents
    }

    /// A root has no parents. Resolution defers roots behind non-roots
    /// within one search depth.
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Insert a parent edge, keeping the list stable-sorted by
    /// descending priority. Re-adding an existing parent replaces its
    /// priority.
    pub fn insert_parent(&mut self, parent: ScopeId, priority: i32) {
        self.parents.retain(|edge| edge.id != parent);
        let at = self
            .parents
            .iter()
            .position(|edge| edge.priority < priority)
            .unwrap_or(self.parents.len());
        self.parents.insert(at, ParentEdge { id: parent, priority });
    }

    pub fn remove_parent(&mut self, parent: ScopeId) -> bool {
        let before = self.parents.len();
        self.parents.retain(|edge| edge.id != parent);
        self.parents.len() != before
    }

    pub fn children(&self) -> impl Iterator<Item = ScopeId> + '_ {
        self.children.iter().copied()
    }

    pub fn add_child(&mut self, child: ScopeId) {
        self.children.insert(child);
    }

    pub fn remove_child(&mut self, child: ScopeId) {
        self.children.shift_remove(&child);
    }

    /// The producer currently active here for `grip`, if any.
    pub fn active_tap(&self, grip: &Grip) -> Option<TapId> {
        self.taps.get(grip).and_then(|stack| stack.last().copied())
    }

    pub fn push_tap(&mut self, grip: Grip, tap: TapId) {
        self.taps.entry(grip).or_default().push(tap);
    }

    pub fn remove_tap(&mut self, grip: &Grip, tap: TapId) {
        if let Some(stack) = self.taps.get_mut(grip) {
            stack.retain(|id| *id != tap);
            if stack.is_empty() {
                self.taps.remove(grip);
            }
        }
    }

    pub fn has_taps(&self) -> bool {
        !self.taps.is_empty()
    }

    /// Upgrade the consumer stream for `grip`, if one is still alive.
    pub fn consumer(&self, grip: &Grip) -> Option<Arc<Drip>> {
        self.consumers.get(grip).and_then(Weak::upgrade)
    }

    pub fn set_consumer(&mut self, grip: Grip, drip: &Arc<Drip>) {
        self.consumers.insert(grip, Arc::downgrade(drip));
    }

    /// Grips with a live consumer at this scope.
    pub fn live_consumer_grips(&self) -> Vec<Grip> {
        self.consumers
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .map(|(grip, _)| grip.clone())
            .collect()
    }

    /// Drop weak consumer entries whose stream has been reclaimed.
    /// Returns the grips that went dead.
    pub fn prune_dead_consumers(&mut self) -> Vec<Grip> {
        let dead: Vec<Grip> = self
            .consumers
            .iter()
            .filter(|(_, weak)| weak.strong_count() == 0)
            .map(|(grip, _)| grip.clone())
            .collect();
        for grip in &dead {
            self.consumers.remove(grip);
        }
        dead
    }

    pub fn provider(&self, grip: &Grip) -> Option<TapId> {
        self.providers.get(grip).copied()
    }

    pub fn set_provider(&mut self, grip: Grip, tap: TapId) {
        self.providers.insert(grip, tap);
    }

    pub fn clear_provider(&mut self, grip: &Grip) -> Option<TapId> {
        self.providers.remove(grip)
    }

    pub fn add_handle(&mut self) {
        self.handles += 1;
    }

    pub fn drop_handle(&mut self) {
        self.handles = self.handles.saturating_sub(1);
    }

    /// A scope is reclaimable once nothing owns it: no external handle,
    /// no attached producer, no child scope, no live consumer stream.
    pub fn is_reclaimable(&self) -> bool {
        self.handles == 0
            && !self.has_taps()
            && self.children.is_empty()
            && self.consumers.values().all(|weak| weak.strong_count() == 0)
    }
}

impl std::fmt::Debug for ScopeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeNode")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("parents", &self.parents)
            .field("handles", &self.handles)
            .finish()
    }
}
