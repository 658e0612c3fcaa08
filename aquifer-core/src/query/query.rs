//! Queries
//!
//! A query is the condition side of a binding: a mapping from input
//! grip to the candidate values it accepts, each candidate carrying the
//! score it contributes when matched. A query matches only when *every*
//! condition's grip currently holds one of that condition's candidates;
//! a query with zero conditions never matches.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::grip::Grip;
use crate::value::Value;

/// Input-key conditions for one binding.
#[derive(Debug, Clone, Default)]
pub struct Query {
    conditions: IndexMap<Grip, IndexMap<Value, i64>>,
}

impl Query {
    /// An empty query. It stays unmatched until conditions are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `candidate` for `grip`, contributing `score` when the
    /// grip currently holds it. Repeated calls for one grip accumulate
    /// candidates.
    pub fn when(mut self, grip: Grip, candidate: impl Into<Value>, score: i64) -> Self {
        self.conditions
            .entry(grip)
            .or_default()
            .insert(candidate.into(), score);
        self
    }

    /// The input grips this query reads.
    pub fn inputs(&self) -> impl Iterator<Item = &Grip> {
        self.conditions.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub(crate) fn conditions(&self) -> &IndexMap<Grip, IndexMap<Value, i64>> {
        &self.conditions
    }

    /// Match against current values; an absent grip holds its default.
    /// Returns the summed per-condition score, or `None` on any miss.
    pub fn evaluate(&self, values: &HashMap<Grip, Value>) -> Option<i64> {
        if self.conditions.is_empty() {
            return None;
        }
        let mut total = 0;
        for (grip, candidates) in &self.conditions {
            let current = values
                .get(grip)
                .cloned()
                .unwrap_or_else(|| grip.default_value().clone());
            total += candidates.get(&current)?;
        }
        Some(total)
    }
}
