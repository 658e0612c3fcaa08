//! Engine Errors
//!
//! Structural-integrity violations are the only errors this runtime
//! raises: they are detected synchronously, before any partial state
//! commits. Everything else is either a lookup miss (the consumer gets
//! the default value), a natural race (no-op), or an isolated task
//! failure (reported out-of-band by the scheduler).

use thiserror::Error;

use crate::graph::ScopeId;

/// Errors raised by structural mutations of the runtime.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Adding this parent edge would make the scope graph cyclic.
    /// The graph is left untouched.
    #[error("linking scope {child:?} under {parent:?} would form a cycle")]
    CycleDetected { child: ScopeId, parent: ScopeId },

    /// A producer declared an output grip that also appears among its
    /// own input parameters.
    #[error("tap output {grip} collides with its own declared parameter")]
    ParamCollision { grip: String },

    /// An attribution delta assigned one output grip to more than one
    /// producer. The delta is rejected before any of it applies.
    #[error("attribution delta assigns {grip} to more than one producer")]
    AmbiguousDelta { grip: String },

    /// The referenced scope does not exist (or was already reclaimed).
    #[error("unknown scope {0:?}")]
    UnknownScope(ScopeId),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
