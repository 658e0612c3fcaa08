//! Diagnostics Snapshot
//!
//! A read-only structural dump of the runtime: scopes with their edges,
//! attached producers, and live streams with current values. Taking a
//! snapshot never mutates engine state; it is safe to call from tooling
//! at any point. The whole tree serializes with serde.

use serde::Serialize;

use crate::engine::Engine;
use crate::graph::ScopeId;

/// Snapshot of the whole engine.
#[derive(Debug, Serialize)]
pub struct EngineSnapshot {
    pub scopes: Vec<ScopeSnapshot>,
}

/// One scope with everything attached to it.
#[derive(Debug, Serialize)]
pub struct ScopeSnapshot {
    pub id: u64,
    pub label: String,
    pub parents: Vec<EdgeSnapshot>,
    pub taps: Vec<TapSnapshot>,
    pub streams: Vec<StreamSnapshot>,
}

/// One parent edge.
#[derive(Debug, Serialize)]
pub struct EdgeSnapshot {
    pub parent: u64,
    pub priority: i32,
}

/// One producer record homed at a scope.
#[derive(Debug, Serialize)]
pub struct TapSnapshot {
    pub id: u64,
    pub provides: Vec<String>,
    pub active: Vec<String>,
    pub destinations: Vec<u64>,
}

/// One live consumer stream.
#[derive(Debug, Serialize)]
pub struct StreamSnapshot {
    pub grip: String,
    pub value: crate::value::Value,
    pub subscribers: usize,
}

impl EngineSnapshot {
    /// Look up one scope's snapshot by ID.
    pub fn scope(&self, id: ScopeId) -> Option<&ScopeSnapshot> {
        self.scopes.iter().find(|scope| scope.id == id.raw())
    }

    /// Serialize the snapshot as pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl Engine {
    /// Take a read-only structural snapshot of the runtime.
    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.inner().state.read();

        let scopes = state
            .graph
            .iter()
            .map(|node| {
                let parents = node
                    .parents()
                    .iter()
                    .map(|edge| EdgeSnapshot {
                        parent: edge.id.raw(),
                        priority: edge.priority,
                    })
                    .collect();

                let taps = state
                    .records
                    .values()
                    .filter(|record| record.home == node.id())
                    .map(|record| TapSnapshot {
                        id: record.id.raw(),
                        provides: record
                            .tap
                            .spec()
                            .provides()
                            .iter()
                            .map(|grip| grip.path().to_string())
                            .collect(),
                        active: record
                            .active
                            .iter()
                            .map(|grip| grip.path().to_string())
                            .collect(),
                        destinations: record
                            .destinations
                            .keys()
                            .map(|scope| scope.raw())
                            .collect(),
                    })
                    .collect();

                let streams = node
                    .live_consumer_grips()
                    .into_iter()
                    .filter_map(|grip| {
                        let drip = node.consumer(&grip)?;
                        Some(StreamSnapshot {
                            grip: grip.path().to_string(),
                            value: drip.get(),
                            subscribers: drip.subscriber_count(),
                        })
                    })
                    .collect();

                ScopeSnapshot {
                    id: node.id().raw(),
                    label: node.label().to_string(),
                    parents,
                    taps,
                    streams,
                }
            })
            .collect();

        EngineSnapshot { scopes }
    }
}
