//! Bindings
//!
//! A binding pairs a query with the producer it activates and a base
//! score. The producer may be supplied up front or through a factory
//! invoked the first time the binding wins anything; deferred bindings
//! declare their output grips explicitly so partitioning and ranking
//! never need to build the tap.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::graph::Tap;
use crate::grip::Grip;

use super::query::Query;

enum TapSource {
    Ready(Arc<dyn Tap>),
    Deferred {
        factory: Box<dyn Fn() -> Arc<dyn Tap> + Send + Sync>,
        built: Mutex<Option<Arc<dyn Tap>>>,
    },
}

/// One query-to-producer activation rule.
pub struct Binding {
    id: String,
    query: Query,
    base_score: i64,
    outputs: Vec<Grip>,
    source: TapSource,
}

impl Binding {
    /// Bind `query` to an existing tap. Output grips are taken from the
    /// tap's declaration.
    pub fn new(id: impl Into<String>, query: Query, tap: Arc<dyn Tap>, base_score: i64) -> Self {
        Self {
            id: id.into(),
            query,
            base_score,
            outputs: tap.spec().provides().to_vec(),
            source: TapSource::Ready(tap),
        }
    }

    /// Bind `query` to a tap built lazily on first attribution.
    pub fn deferred<F>(
        id: impl Into<String>,
        query: Query,
        outputs: Vec<Grip>,
        factory: F,
        base_score: i64,
    ) -> Self
    where
        F: Fn() -> Arc<dyn Tap> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            query,
            base_score,
            outputs,
            source: TapSource::Deferred {
                factory: Box::new(factory),
                built: Mutex::new(None),
            },
        }
    }

    /// Binding identifier; ties rank lexicographically ascending on it.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn base_score(&self) -> i64 {
        self.base_score
    }

    /// The output grips this binding's producer contends for.
    pub fn outputs(&self) -> &[Grip] {
        &self.outputs
    }

    /// The producer, building and caching it on first use.
    pub fn tap(&self) -> Arc<dyn Tap> {
        match &self.source {
            TapSource::Ready(tap) => Arc::clone(tap),
            TapSource::Deferred { factory, built } => {
                let mut built = built.lock();
                Arc::clone(built.get_or_insert_with(factory))
            }
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.id)
            .field("base_score", &self.base_score)
            .field("outputs", &self.outputs)
            .finish()
    }
}
