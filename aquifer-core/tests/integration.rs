//! Integration Tests for the Resolution Runtime
//!
//! These tests exercise the full engine: scope graph, resolution,
//! producer bookkeeping, attribution, and scheduling working together.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use aquifer_core::{
    AttributionDelta, Binding, Engine, Grip, Production, Query, Tap, TapHooks, TapSpec, Value,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A producer publishing fixed values for the grips it declares.
struct ConstTap {
    spec: TapSpec,
    values: HashMap<Grip, Value>,
}

impl ConstTap {
    fn new(values: Vec<(Grip, Value)>) -> Arc<Self> {
        let provides = values.iter().map(|(grip, _)| grip.clone()).collect();
        Arc::new(Self {
            spec: TapSpec::new(provides),
            values: values.into_iter().collect(),
        })
    }

    fn single(grip: &Grip, value: impl Into<Value>) -> Arc<Self> {
        Self::new(vec![(grip.clone(), value.into())])
    }
}

impl Tap for ConstTap {
    fn spec(&self) -> &TapSpec {
        &self.spec
    }

    fn produce(&self, production: &mut Production) {
        for grip in production.requested().to_vec() {
            if let Some(value) = self.values.get(&grip) {
                production.publish(grip, value.clone());
            }
        }
    }
}

/// A producer scaling a base by a destination-read factor.
struct ScaledTap {
    spec: TapSpec,
    out: Grip,
    factor: Grip,
    base: i64,
}

impl ScaledTap {
    fn new(out: &Grip, factor: &Grip, base: i64) -> Arc<Self> {
        Arc::new(Self {
            spec: TapSpec::new(vec![out.clone()])
                .with_destination_params(vec![factor.clone()]),
            out: out.clone(),
            factor: factor.clone(),
            base,
        })
    }
}

impl Tap for ScaledTap {
    fn spec(&self) -> &TapSpec {
        &self.spec
    }

    fn produce(&self, production: &mut Production) {
        let factor = production.param(&self.factor).as_int().unwrap_or(1);
        production.publish(self.out.clone(), self.base * factor);
    }
}

/// A producer reading its gain from its own home scope.
struct HomeGainTap {
    spec: TapSpec,
    out: Grip,
    gain: Grip,
}

impl HomeGainTap {
    fn new(out: &Grip, gain: &Grip) -> Arc<Self> {
        Arc::new(Self {
            spec: TapSpec::new(vec![out.clone()]).with_home_params(vec![gain.clone()]),
            out: out.clone(),
            gain: gain.clone(),
        })
    }
}

impl Tap for HomeGainTap {
    fn spec(&self) -> &TapSpec {
        &self.spec
    }

    fn produce(&self, production: &mut Production) {
        let gain = production.param(&self.gain).as_int().unwrap_or(0);
        production.publish(self.out.clone(), gain * 10);
    }
}

/// A producer recording every lifecycle call.
struct HookTap {
    spec: TapSpec,
    out: Grip,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl HookTap {
    fn new(out: &Grip) -> (Arc<Self>, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tap = Arc::new(Self {
            spec: TapSpec::new(vec![out.clone()]).with_hooks(TapHooks::all()),
            out: out.clone(),
            log: Arc::clone(&log),
        });
        (tap, log)
    }
}

impl Tap for HookTap {
    fn spec(&self) -> &TapSpec {
        &self.spec
    }

    fn produce(&self, production: &mut Production) {
        production.publish(self.out.clone(), 1);
    }

    fn attached(&self, _home: aquifer_core::ScopeId) {
        self.log.lock().push("attached");
    }

    fn detached(&self, _home: aquifer_core::ScopeId) {
        self.log.lock().push("detached");
    }

    fn connected(&self, _destination: aquifer_core::ScopeId) {
        self.log.lock().push("connected");
    }

    fn disconnected(&self, _destination: aquifer_core::ScopeId) {
        self.log.lock().push("disconnected");
    }
}

fn delta_names(delta: &AttributionDelta) -> (Vec<(String, Vec<String>)>, Vec<(String, Vec<String>)>) {
    let side = |entries: &[aquifer_core::DeltaEntry]| {
        entries
            .iter()
            .map(|entry| {
                (
                    entry.binding.clone(),
                    entry
                        .grips
                        .iter()
                        .map(|grip| grip.name().to_string())
                        .collect(),
                )
            })
            .collect()
    };
    (side(&delta.added), side(&delta.removed))
}

// ---------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------

/// An unresolved grip silently yields its declared default.
#[test]
fn unresolved_grip_falls_back_to_default() {
    init_tracing();
    let engine = Engine::new();
    let root = engine.scope("root");
    let out = Grip::new("app", "out", 42);

    let stream = root.stream(&out);
    engine.flush();
    assert_eq!(stream.get(), Value::from(42));
}

/// The nearest producer wins; removing it reverts to the next-nearest,
/// with no consumer re-subscription involved.
#[test]
fn closest_producer_wins_and_reverts() {
    init_tracing();
    let engine = Engine::new();
    let root = engine.scope("root");
    let child = root.child("child");
    let out = Grip::new("app", "out", 0);

    let _p1 = root.attach(ConstTap::single(&out, 7)).unwrap();
    let at_child = child.stream(&out);
    let at_root = root.stream(&out);
    engine.flush();
    assert_eq!(at_child.get(), Value::from(7));
    assert_eq!(at_root.get(), Value::from(7));

    // A nearer producer takes over the child but not the root.
    let p2 = child.attach(ConstTap::single(&out, 9)).unwrap();
    engine.flush();
    assert_eq!(at_child.get(), Value::from(9));
    assert_eq!(at_root.get(), Value::from(7));

    // Unregistering reverts to the next-nearest provider.
    drop(p2);
    engine.flush();
    assert_eq!(at_child.get(), Value::from(7));
}

/// Switching providers notifies existing queued subscribers.
#[test]
fn provider_switch_reaches_existing_subscribers() {
    init_tracing();
    let engine = Engine::new();
    let root = engine.scope("root");
    let out = Grip::new("app", "out", 0);

    let stream = root.stream(&out);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let _sub = stream.subscribe(move |value| seen_clone.lock().push(value.clone()));

    let _tap = root.attach(ConstTap::single(&out, 5)).unwrap();
    engine.flush();

    assert_eq!(*seen.lock(), vec![Value::from(5)]);
}

/// Detaching the only producer pushes the default for determinism.
#[test]
fn losing_every_provider_degrades_to_default() {
    init_tracing();
    let engine = Engine::new();
    let root = engine.scope("root");
    let child = root.child("child");
    let out = Grip::new("app", "out", -1);

    let tap = root.attach(ConstTap::single(&out, 10)).unwrap();
    let stream = child.stream(&out);
    engine.flush();
    assert_eq!(stream.get(), Value::from(10));

    drop(tap);
    engine.flush();
    assert_eq!(stream.get(), Value::from(-1));
}

/// A cycle-forming edge fails and leaves the graph and resolution
/// untouched.
#[test]
fn cycle_rejected_without_structural_damage() {
    init_tracing();
    let engine = Engine::new();
    let a = engine.scope("a");
    let b = a.child("b");
    let c = b.child("c");
    let out = Grip::new("app", "out", 0);

    let _tap = a.attach(ConstTap::single(&out, 3)).unwrap();
    let stream = c.stream(&out);
    engine.flush();
    assert_eq!(stream.get(), Value::from(3));

    let before = engine.snapshot();
    assert!(a.add_parent(&c, 0).is_err());
    let after = engine.snapshot();

    // Edge lists are unchanged scope by scope.
    for (lhs, rhs) in before.scopes.iter().zip(after.scopes.iter()) {
        assert_eq!(lhs.id, rhs.id);
        assert_eq!(lhs.parents.len(), rhs.parents.len());
    }

    // Resolution still flows through the old chain.
    engine.flush();
    assert_eq!(stream.get(), Value::from(3));
}

/// Adding and removing parent edges re-resolves affected consumers.
#[test]
fn parent_edge_changes_reresolve_consumers() {
    init_tracing();
    let engine = Engine::new();
    let plain = engine.scope("plain");
    let themed = engine.scope("themed");
    let child = plain.child("child");
    let out = Grip::new("app", "out", 0);

    let _tap = themed.attach(ConstTap::single(&out, 8)).unwrap();
    let stream = child.stream(&out);
    engine.flush();
    assert_eq!(stream.get(), Value::from(0));

    child.add_parent(&themed, 1).unwrap();
    engine.flush();
    assert_eq!(stream.get(), Value::from(8));

    assert!(child.remove_parent(&themed));
    engine.flush();
    assert_eq!(stream.get(), Value::from(0));
}

// ---------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------

/// Destination-parameter changes re-run production for that
/// destination only.
#[test]
fn destination_params_drive_recompute() {
    init_tracing();
    let engine = Engine::new();
    let root = engine.scope("root");
    let child = root.child("child");
    let out = Grip::new("app", "out", 0);
    let factor = Grip::new("app", "factor", 1);

    let _tap = root.attach(ScaledTap::new(&out, &factor, 10)).unwrap();
    let stream = child.stream(&out);
    engine.flush();
    assert_eq!(stream.get(), Value::from(10));

    child.stream(&factor).next(Value::from(3));
    engine.flush();
    assert_eq!(stream.get(), Value::from(30));
}

/// Home-parameter changes re-produce every destination of the record.
#[test]
fn home_params_drive_recompute_for_all_destinations() {
    init_tracing();
    let engine = Engine::new();
    let root = engine.scope("root");
    let left = root.child("left");
    let right = root.child("right");
    let out = Grip::new("app", "out", 0);
    let gain = Grip::new("app", "gain", 1);

    let _tap = root.attach(HomeGainTap::new(&out, &gain)).unwrap();
    let at_left = left.stream(&out);
    let at_right = right.stream(&out);
    engine.flush();
    assert_eq!(at_left.get(), Value::from(10));
    assert_eq!(at_right.get(), Value::from(10));

    root.stream(&gain).next(Value::from(4));
    engine.flush();
    assert_eq!(at_left.get(), Value::from(40));
    assert_eq!(at_right.get(), Value::from(40));
}

// ---------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------

/// Hooks fire in attach → connect → disconnect → detach order.
#[test]
fn lifecycle_hooks_fire_in_order() {
    init_tracing();
    let engine = Engine::new();
    let root = engine.scope("root");
    let child = root.child("child");
    let out = Grip::new("app", "out", 0);

    let (tap, log) = HookTap::new(&out);
    let handle = root.attach(tap).unwrap();
    engine.flush();
    assert_eq!(*log.lock(), vec!["attached"]);

    let stream = child.stream(&out);
    engine.flush();
    assert_eq!(*log.lock(), vec!["attached", "connected"]);

    // Reclaiming the stream disconnects the destination.
    drop(stream);
    engine.sweep();
    engine.flush();
    assert_eq!(*log.lock(), vec!["attached", "connected", "disconnected"]);

    drop(handle);
    engine.flush();
    assert_eq!(
        *log.lock(),
        vec!["attached", "connected", "disconnected", "detached"]
    );
}

/// Ownerless scopes are reclaimed; each owner kind keeps one alive.
#[test]
fn sweep_reclaims_only_ownerless_scopes() {
    init_tracing();
    let engine = Engine::new();
    let root = engine.scope("root");
    let out = Grip::new("app", "out", 0);

    let pinned_by_stream = root.child("by-stream");
    let stream = pinned_by_stream.stream(&out);
    let by_stream_id = pinned_by_stream.id();
    drop(pinned_by_stream);

    let pinned_by_tap = root.child("by-tap");
    let tap = pinned_by_tap.attach(ConstTap::single(&out, 1)).unwrap();
    let by_tap_id = pinned_by_tap.id();
    drop(pinned_by_tap);

    let unowned = root.child("unowned");
    let unowned_id = unowned.id();
    drop(unowned);

    engine.flush();
    let snapshot = engine.snapshot();
    assert!(snapshot.scope(by_stream_id).is_some());
    assert!(snapshot.scope(by_tap_id).is_some());
    assert!(snapshot.scope(unowned_id).is_none());

    // Releasing the remaining owners frees the rest.
    drop(stream);
    drop(tap);
    engine.sweep();
    engine.flush();
    engine.sweep();
    let snapshot = engine.snapshot();
    assert!(snapshot.scope(by_stream_id).is_none());
    assert!(snapshot.scope(by_tap_id).is_none());
}

// ---------------------------------------------------------------------
// Attribution
// ---------------------------------------------------------------------

/// The mode-switch scenario: attribution transfers contested grips and
/// consumers follow automatically.
#[test]
fn mode_attribution_scenario() {
    init_tracing();
    let engine = Engine::new();
    let scope = engine.scope("app");
    let mode = Grip::new("app", "mode", "");
    let x = Grip::new("app", "x", 0);
    let y = Grip::new("app", "y", 0);

    let tap_a = ConstTap::single(&x, 70);
    let tap_b = ConstTap::new(vec![(x.clone(), Value::from(80)), (y.clone(), Value::from(90))]);

    let activation = engine.activation(&scope);
    let deltas: Arc<Mutex<Vec<AttributionDelta>>> = Arc::new(Mutex::new(Vec::new()));
    let deltas_clone = Arc::clone(&deltas);
    activation.on_delta(move |delta| deltas_clone.lock().push(delta.clone()));

    activation.add_binding(Binding::new(
        "q1",
        Query::new().when(mode.clone(), "a", 10),
        tap_a,
        0,
    ));
    activation.add_binding(Binding::new(
        "q2",
        Query::new().when(mode.clone(), "b", 10),
        tap_b,
        0,
    ));

    let x_stream = scope.stream(&x);
    let y_stream = scope.stream(&y);
    engine.flush();
    assert!(deltas.lock().is_empty());
    assert_eq!(x_stream.get(), Value::from(0));

    scope.stream(&mode).next(Value::from("a"));
    engine.flush();
    {
        let deltas = deltas.lock();
        assert_eq!(deltas.len(), 1);
        let (added, removed) = delta_names(&deltas[0]);
        assert_eq!(added, vec![("q1".to_string(), vec!["x".to_string()])]);
        assert!(removed.is_empty());
    }
    assert_eq!(x_stream.get(), Value::from(70));
    assert_eq!(y_stream.get(), Value::from(0));

    scope.stream(&mode).next(Value::from("b"));
    engine.flush();
    {
        let deltas = deltas.lock();
        assert_eq!(deltas.len(), 2);
        let (added, removed) = delta_names(&deltas[1]);
        assert_eq!(
            added,
            vec![("q2".to_string(), vec!["x".to_string(), "y".to_string()])]
        );
        assert_eq!(removed, vec![("q1".to_string(), vec!["x".to_string()])]);
    }
    assert_eq!(x_stream.get(), Value::from(80));
    assert_eq!(y_stream.get(), Value::from(90));
}

/// Re-evaluating with unchanged inputs produces no further deltas.
#[test]
fn attribution_is_idempotent() {
    init_tracing();
    let engine = Engine::new();
    let scope = engine.scope("app");
    let mode = Grip::new("app", "mode", "");
    let x = Grip::new("app", "x", 0);

    let activation = engine.activation(&scope);
    let count = Arc::new(Mutex::new(0usize));
    let count_clone = Arc::clone(&count);
    activation.on_delta(move |_| *count_clone.lock() += 1);

    activation.add_binding(Binding::new(
        "q1",
        Query::new().when(mode.clone(), "a", 10),
        ConstTap::single(&x, 1),
        0,
    ));

    scope.stream(&mode).next(Value::from("a"));
    engine.flush();
    assert_eq!(*count.lock(), 1);

    // Same value again: the stream no-ops and nothing re-evaluates.
    scope.stream(&mode).next(Value::from("a"));
    engine.flush();
    assert_eq!(*count.lock(), 1);
}

/// Removing an attributed binding releases its grips back to defaults.
#[test]
fn removing_attributed_binding_releases_grips() {
    init_tracing();
    let engine = Engine::new();
    let scope = engine.scope("app");
    let mode = Grip::new("app", "mode", "");
    let x = Grip::new("app", "x", 0);

    let activation = engine.activation(&scope);
    activation.add_binding(Binding::new(
        "q1",
        Query::new().when(mode.clone(), "a", 10),
        ConstTap::single(&x, 5),
        0,
    ));

    let stream = scope.stream(&x);
    scope.stream(&mode).next(Value::from("a"));
    engine.flush();
    assert_eq!(stream.get(), Value::from(5));

    activation.remove_binding("q1");
    engine.flush();
    assert_eq!(stream.get(), Value::from(0));

    // Unknown ids are a quiet no-op.
    activation.remove_binding("ghost");
    engine.flush();
}

// ---------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------

/// The snapshot reflects structure, serializes, and never mutates the
/// engine.
#[test]
fn snapshot_reflects_structure() {
    init_tracing();
    let engine = Engine::new();
    let root = engine.scope("root");
    let child = root.child("child");
    let out = Grip::new("app", "out", 0);

    let _tap = root.attach(ConstTap::single(&out, 7)).unwrap();
    let _stream = child.stream(&out);
    engine.flush();

    let snapshot = engine.snapshot();
    let root_snap = snapshot.scope(root.id()).unwrap();
    assert_eq!(root_snap.label, "root");
    assert_eq!(root_snap.taps.len(), 1);
    assert_eq!(root_snap.taps[0].provides, vec!["app:out".to_string()]);
    assert_eq!(root_snap.taps[0].destinations, vec![child.id().raw()]);

    let child_snap = snapshot.scope(child.id()).unwrap();
    assert_eq!(child_snap.parents.len(), 1);
    assert_eq!(child_snap.parents[0].parent, root.id().raw());
    assert_eq!(child_snap.streams.len(), 1);
    assert_eq!(child_snap.streams[0].value, Value::from(7));

    let json = snapshot.to_json().unwrap();
    assert!(json.contains("app:out"));

    // Taking a snapshot is read-only.
    let again = engine.snapshot();
    assert_eq!(snapshot.scopes.len(), again.scopes.len());
}
