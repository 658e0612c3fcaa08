//! Aquifer Core
//!
//! This crate provides the core runtime of the Aquifer reactive
//! value-resolution framework. It implements:
//!
//! - Live single-value streams with two subscriber tiers
//! - A hierarchical scope graph with nearest-producer resolution
//! - Declarative, query-driven producer activation with contention
//!   ranking
//! - A cooperative task scheduler that coalesces all propagation
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value` / `grip`: the dynamic value type and the abstract keys
//!   consumers request
//! - `stream`: the `Drip` reactive cell handed to consumers
//! - `graph`: scopes, producers (`Tap`), and nearest-producer
//!   resolution
//! - `query`: bindings, scoring, and attribution deltas
//! - `activation`: the evaluator wired to a scope of the engine
//! - `sched`: the priority task queue everything propagates through
//! - `engine`: the facade tying the pieces together
//! - `snapshot`: a read-only structural dump for tooling
//!
//! # Example
//!
//! ```rust,ignore
//! use aquifer_core::{Engine, Grip};
//!
//! let engine = Engine::new();
//! let root = engine.scope("root");
//! let volume = Grip::new("audio", "volume", 50);
//!
//! // No producer yet: the stream holds the default.
//! let stream = root.stream(&volume);
//! assert_eq!(stream.get(), 50.into());
//!
//! // Attaching a producer re-resolves the consumer automatically.
//! root.attach(my_volume_tap)?;
//! engine.flush();
//! ```

pub mod activation;
pub mod engine;
pub mod error;
pub mod graph;
pub mod grip;
pub mod query;
pub mod sched;
pub mod snapshot;
pub mod stream;
pub mod value;

pub use activation::Activation;
pub use engine::{Engine, EngineConfig, ScopeRef, TapHandle};
pub use error::{EngineError, Result};
pub use graph::{Production, ScopeId, Tap, TapHooks, TapId, TapSpec};
pub use grip::Grip;
pub use query::{AttributionDelta, Binding, DeltaEntry, EvaluatorConfig, Query, QueryEvaluator};
pub use sched::{TaskHandle, TaskScheduler, TaskState};
pub use snapshot::EngineSnapshot;
pub use stream::{Drip, Subscription};
pub use value::Value;
