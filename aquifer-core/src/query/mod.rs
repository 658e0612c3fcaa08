//! Declarative Producer Activation
//!
//! Instead of attaching producers by hand, a policy layer can declare
//! *bindings*: "activate this producer for its output grips whenever
//! these input-grip conditions hold". The evaluator watches the input
//! grips, recomputes which bindings match as they change, resolves
//! contention between bindings that could supply the same output, and
//! emits a minimal attribution delta for the engine to apply.

mod binding;
mod evaluator;
mod partition;
mod query;

pub use binding::Binding;
pub use evaluator::{AttributionDelta, DeltaEntry, EvaluatorConfig, QueryEvaluator};
pub use query::Query;
