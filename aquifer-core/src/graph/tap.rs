//! Taps: the producer contract and its bookkeeping
//!
//! A `Tap` supplies one or more grips. It declares what it provides and
//! which parameters it reads — *destination* parameters come from the
//! requesting scope, *home* parameters from the scope the tap is
//! attached to. Lifecycle hooks are optional capabilities announced
//! through explicit flags rather than probed dynamically, so the engine
//! can skip bookkeeping for taps that do not care.
//!
//! The engine keeps one `ProducerRecord` per (scope, tap) attachment
//! and one `Destination` per (record, destination scope). A Destination
//! tracks the live subset of grips actually delivered there; it grows
//! and shrinks as consumers attach and detach, and it lazily owns the
//! destination-parameter subscriptions that trigger re-production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::error::{EngineError, Result};
use crate::grip::Grip;
use crate::stream::{Drip, Subscription};
use crate::value::Value;

use super::node::ScopeId;

/// A parameter feed: the stream held alive plus the subscription that
/// triggers re-production when it changes.
pub(crate) type ParamFeed = (Arc<Drip>, Subscription);

/// Unique identifier for one producer attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapId(u64);

impl TapId {
    /// Generate a new unique tap ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for TapId {
    fn default() -> Self {
        Self::new()
    }
}

/// Which lifecycle hooks a tap actually implements.
///
/// The engine consults these flags instead of calling every hook on
/// every tap; a flag left false means the corresponding method is never
/// invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TapHooks {
    /// `attached` / `detached`: the tap joined or left a home scope.
    pub attachment: bool,
    /// `connected` / `disconnected`: a destination gained its first
    /// grip or lost its last one.
    pub connection: bool,
}

impl TapHooks {
    /// All hooks enabled.
    pub fn all() -> Self {
        Self {
            attachment: true,
            connection: true,
        }
    }
}

/// Static declaration of a tap: what it provides and what it reads.
#[derive(Debug, Clone)]
pub struct TapSpec {
    provides: Vec<Grip>,
    destination_params: Vec<Grip>,
    home_params: Vec<Grip>,
    hooks: TapHooks,
}

impl TapSpec {
    /// Declare a tap providing the given grips.
    pub fn new(provides: Vec<Grip>) -> Self {
        Self {
            provides,
            destination_params: Vec::new(),
            home_params: Vec::new(),
            hooks: TapHooks::default(),
        }
    }

    /// Parameters read from each requesting (destination) scope.
    pub fn with_destination_params(mut self, params: Vec<Grip>) -> Self {
        self.destination_params = params;
        self
    }

    /// Parameters read from the tap's own home scope.
    pub fn with_home_params(mut self, params: Vec<Grip>) -> Self {
        self.home_params = params;
        self
    }

    /// Announce implemented lifecycle hooks.
    pub fn with_hooks(mut self, hooks: TapHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn provides(&self) -> &[Grip] {
        &self.provides
    }

    pub fn destination_params(&self) -> &[Grip] {
        &self.destination_params
    }

    pub fn home_params(&self) -> &[Grip] {
        &self.home_params
    }

    pub fn hooks(&self) -> TapHooks {
        self.hooks
    }

    /// A tap must not consume a grip it also produces; that would feed
    /// its own output back into its recompute trigger.
    pub(crate) fn validate(&self) -> Result<()> {
        for grip in &self.provides {
            if self.destination_params.contains(grip) || self.home_params.contains(grip) {
                return Err(EngineError::ParamCollision {
                    grip: grip.path().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// One production request, targeted at a single destination scope.
///
/// The engine prepares the parameter view (destination parameters read
/// at the destination, home parameters read at the home scope) and
/// routes whatever the tap publishes to that destination's streams.
/// Broadcasts are the engine iterating destinations, not a special
/// target.
pub struct Production {
    destination: ScopeId,
    requested: Vec<Grip>,
    params: HashMap<Grip, Value>,
    updates: Vec<(Grip, Value)>,
}

impl Production {
    pub(crate) fn new(
        destination: ScopeId,
        requested: Vec<Grip>,
        params: HashMap<Grip, Value>,
    ) -> Self {
        Self {
            destination,
            requested,
            params,
            updates: Vec::new(),
        }
    }

    /// The destination scope this production is for.
    pub fn destination(&self) -> ScopeId {
        self.destination
    }

    /// The grips currently delivered to this destination.
    pub fn requested(&self) -> &[Grip] {
        &self.requested
    }

    /// Read a declared parameter; unresolved parameters yield the
    /// grip's default value.
    pub fn param(&self, grip: &Grip) -> Value {
        self.params
            .get(grip)
            .cloned()
            .unwrap_or_else(|| grip.default_value().clone())
    }

    /// Publish a value for one grip.
    pub fn publish(&mut self, grip: Grip, value: impl Into<Value>) {
        self.updates.push((grip, value.into()));
    }

    pub(crate) fn into_updates(self) -> Vec<(Grip, Value)> {
        self.updates
    }
}

/// A producer of values for one or more grips.
///
/// Implementations publish through [`Production::publish`] when asked
/// to produce. Hook methods default to no-ops and are only called when
/// the matching [`TapHooks`] flag is set.
pub trait Tap: Send + Sync {
    /// The tap's static declaration.
    fn spec(&self) -> &TapSpec;

    /// Produce values for one destination.
    fn produce(&self, production: &mut Production);

    /// The tap was attached to a home scope.
    fn attached(&self, _home: ScopeId) {}

    /// The tap was detached from its home scope.
    fn detached(&self, _home: ScopeId) {}

    /// A destination began receiving its first grip from this tap.
    fn connected(&self, _destination: ScopeId) {}

    /// A destination stopped receiving its last grip from this tap.
    fn disconnected(&self, _destination: ScopeId) {}
}

/// Per-destination bookkeeping for one producer record.
pub(crate) struct Destination {
    /// The live subset of grips actually delivered to this scope.
    /// Always a subset of the tap's declared provides.
    pub grips: IndexSet<Grip>,

    /// Destination-parameter feeds, created lazily on the destination's
    /// first use. Dropping them detaches the recompute triggers.
    pub param_subs: Option<Vec<ParamFeed>>,
}

impl Destination {
    pub fn new() -> Self {
        Self {
            grips: IndexSet::new(),
            param_subs: None,
        }
    }
}

/// One (scope, tap) attachment and the destinations it serves.
pub(crate) struct ProducerRecord {
    pub id: TapId,
    pub tap: Arc<dyn Tap>,
    pub home: ScopeId,

    /// The subset of declared provides this attachment is registered
    /// for. Direct registrations activate everything; attribution may
    /// activate a strict subset.
    pub active: IndexSet<Grip>,

    /// Destination scope → delivery bookkeeping.
    pub destinations: IndexMap<ScopeId, Destination>,

    /// Home-parameter feeds.
    pub home_subs: Vec<ParamFeed>,
}

impl ProducerRecord {
    pub fn new(id: TapId, tap: Arc<dyn Tap>, home: ScopeId, active: IndexSet<Grip>) -> Self {
        Self {
            id,
            tap,
            home,
            active,
            destinations: IndexMap::new(),
            home_subs: Vec::new(),
        }
    }

    /// All (destination, grip) pairs currently served.
    pub fn served_pairs(&self) -> Vec<(ScopeId, Grip)> {
        self.destinations
            .iter()
            .flat_map(|(scope, dest)| dest.grips.iter().map(|grip| (*scope, grip.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_param_collision_is_rejected() {
        let out = Grip::new("t", "out", 0);
        let knob = Grip::new("t", "knob", 0);

        let ok = TapSpec::new(vec![out.clone()]).with_destination_params(vec![knob.clone()]);
        assert!(ok.validate().is_ok());

        let bad = TapSpec::new(vec![out.clone()]).with_destination_params(vec![out.clone()]);
        assert!(matches!(
            bad.validate(),
            Err(EngineError::ParamCollision { .. })
        ));

        let bad_home = TapSpec::new(vec![out.clone()]).with_home_params(vec![out]);
        assert!(bad_home.validate().is_err());
    }

    #[test]
    fn production_reads_params_with_defaults() {
        let knob = Grip::new("t", "knob", 10);
        let other = Grip::new("t", "other", -1);

        let mut params = HashMap::new();
        params.insert(knob.clone(), Value::from(99));

        let production = Production::new(ScopeId::new(), vec![], params);
        assert_eq!(production.param(&knob), Value::from(99));
        // Undeclared/unresolved parameters fall back to the default.
        assert_eq!(production.param(&other), Value::from(-1));
    }

    #[test]
    fn production_collects_published_updates() {
        let out = Grip::new("t", "out", 0);
        let mut production = Production::new(ScopeId::new(), vec![out.clone()], HashMap::new());

        production.publish(out.clone(), 7);
        let updates = production.into_updates();
        assert_eq!(updates, vec![(out, Value::from(7))]);
    }
}
