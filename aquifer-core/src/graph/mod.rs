//! Scope Graph
//!
//! This module implements the hierarchical scope graph producers attach
//! to and consumers resolve through.
//!
//! # Overview
//!
//! The graph is a DAG of scopes. Each scope lists its parents in
//! explicit priority order; resolution searches breadth-first outward
//! from the consumer's scope and stops at the nearest scope with an
//! active producer for the requested grip ("closest producer wins").
//!
//! # Design Decisions
//!
//! 1. Nodes live in a central arena indexed by stable IDs rather than
//!    being linked through `Arc` cycles. Ownership is explicit: a node
//!    records who keeps it alive (handles, producers, children, live
//!    streams) and a sweep reclaims the rest.
//!
//! 2. Both directions of every edge are maintained — parent lists for
//!    upward resolution, child back-references for the downward
//!    traversals that incremental re-resolution needs.
//!
//! 3. Cycle checks run against the committed graph before any edge
//!    mutation is applied, so failed calls leave no trace.

mod graph;
mod node;
mod resolver;
mod tap;

pub use node::ScopeId;
pub use tap::{Production, Tap, TapHooks, TapId, TapSpec};

pub(crate) use graph::ScopeGraph;
pub(crate) use node::{ParentEdge, ScopeNode};
pub(crate) use resolver::resolve;
pub(crate) use tap::{Destination, ProducerRecord};
