//! Nearest-Producer Resolution
//!
//! The selection algorithm: breadth-first search outward from the
//! consumer's scope. A scope holding an active local producer for the
//! grip terminates the search, so the consumer's own scope always wins
//! over any ancestor. Within one search depth, candidates are visited
//! in parent-priority order, except that root scopes (scopes with no
//! parents of their own) are deferred behind non-roots — a more
//! specific ancestor beats the global root even at tied priority.
//!
//! Selection is a pure read; the incremental re-resolution rules that
//! decide *when* to re-run it live with the engine, which knows about
//! records and streams.

use std::collections::HashSet;

use tracing::trace;

use crate::grip::Grip;

use super::graph::ScopeGraph;
use super::node::ScopeId;
use super::tap::TapId;

/// Find the nearest scope with an active producer for `grip`, starting
/// at `start`. Returns the providing scope and its record.
pub(crate) fn resolve(graph: &ScopeGraph, start: ScopeId, grip: &Grip) -> Option<(ScopeId, TapId)> {
    let mut visited: HashSet<ScopeId> = HashSet::new();
    visited.insert(start);
    let mut layer = vec![start];

    while !layer.is_empty() {
        // Check the current depth in order before going further out.
        for &scope in &layer {
            if let Some(node) = graph.node(scope) {
                if let Some(tap) = node.active_tap(grip) {
                    trace!(
                        grip = grip.path(),
                        start = start.raw(),
                        provider = scope.raw(),
                        "resolved"
                    );
                    return Some((scope, tap));
                }
            }
        }

        // Next depth: each scope contributes its parents in priority
        // order; roots are deferred behind non-roots within the layer.
        let mut inner = Vec::new();
        let mut roots = Vec::new();
        for &scope in &layer {
            let Some(node) = graph.node(scope) else { continue };
            for edge in node.parents() {
                if !visited.insert(edge.id) {
                    continue;
                }
                let is_root = graph
                    .node(edge.id)
                    .map(|parent| parent.is_root())
                    .unwrap_or(false);
                if is_root {
                    roots.push(edge.id);
                } else {
                    inner.push(edge.id);
                }
            }
        }
        inner.extend(roots);
        layer = inner;
    }

    trace!(grip = grip.path(), start = start.raw(), "no provider");
    None
}
