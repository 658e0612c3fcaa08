//! Engine
//!
//! The engine owns the scope graph, the producer records, and the task
//! scheduler, and wires them into the registration surface consumers
//! and producers actually use: create scopes, attach taps, request
//! streams.
//!
//! # Locking discipline
//!
//! All structural state sits behind one `RwLock`. User code (tap hooks,
//! `produce`, stream subscribers) is never called with that lock held:
//! every mutation first collects the follow-up work — hooks to fire,
//! productions to run, defaults to push, parameter subscriptions to
//! create — and runs it after the lock is released. Scheduled callbacks
//! hold the engine weakly, so an engine dropped with work still queued
//! degrades to no-ops.
//!
//! # Incremental re-resolution
//!
//! Each structural trigger re-runs nearest-producer selection only for
//! the consumers it can affect:
//!
//! - attaching a tap: consumers of its grips at or below its scope
//! - detaching a tap: exactly the (destination, grip) pairs it served
//! - parent-edge changes on a scope: consumers at or below that scope
//! - a new consumer: that single (scope, grip) pair
//! - a reclaimed stream: unlinks that single pair

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::graph::{
    resolve, Destination, Production, ProducerRecord, ScopeGraph, ScopeId, Tap, TapId,
};
use crate::grip::Grip;
use crate::query::EvaluatorConfig;
use crate::sched::{priority, TaskScheduler};
use crate::stream::Drip;
use crate::value::Value;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tuning for query evaluators created by [`Engine::activation`].
    pub evaluator: EvaluatorConfig,

    /// Schedule a reclamation sweep whenever an external scope handle
    /// drops. On by default.
    pub sweep_on_handle_drop: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluator: EvaluatorConfig::default(),
            sweep_on_handle_drop: true,
        }
    }
}

pub(crate) struct EngineState {
    pub graph: ScopeGraph,
    pub records: IndexMap<TapId, ProducerRecord>,
}

pub(crate) struct EngineInner {
    pub sched: Arc<TaskScheduler>,
    pub state: RwLock<EngineState>,
    pub config: EngineConfig,
}

/// The reactive resolution runtime.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Cloneable external handle to a scope. The scope stays alive while
/// any handle (or stream, producer, or child scope) does; dropping the
/// last owner makes it sweepable.
pub struct ScopeRef {
    inner: Arc<EngineInner>,
    id: ScopeId,
}

/// RAII registration of one tap. Dropping it detaches the tap.
pub struct TapHandle {
    inner: Arc<EngineInner>,
    id: TapId,
}

// ---------------------------------------------------------------------
// Deferred side effects, collected under the lock and run after it.
// ---------------------------------------------------------------------

enum HookCall {
    Connected(Arc<dyn Tap>, ScopeId),
    Disconnected(Arc<dyn Tap>, ScopeId),
}

#[derive(Default)]
struct Actions {
    hooks: Vec<HookCall>,
    /// Destinations needing lazily-created parameter subscriptions.
    param_subs: Vec<(TapId, ScopeId)>,
    /// Productions to request, deduplicated.
    produces: IndexSet<(TapId, ScopeId)>,
    /// Streams to push back to their grip's default value.
    defaults: Vec<(Arc<Drip>, Value)>,
    /// Emptied destination bookkeeping, released after the lock so the
    /// subscription drops cannot re-enter it.
    graveyard: Vec<Destination>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                sched: Arc::new(TaskScheduler::new()),
                state: RwLock::new(EngineState {
                    graph: ScopeGraph::new(),
                    records: IndexMap::new(),
                }),
                config,
            }),
        }
    }

    /// Create a new root scope.
    pub fn scope(&self, label: impl Into<String>) -> ScopeRef {
        let id = {
            let mut state = self.inner.state.write();
            let id = state.graph.insert(label);
            state
                .graph
                .node_mut(id)
                .expect("just inserted")
                .add_handle();
            id
        };
        ScopeRef {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Drain the scheduler: runs every queued propagation step.
    pub fn flush(&self) {
        self.inner.sched.flush();
    }

    /// Register the auto-flush waker (see [`TaskScheduler::set_waker`]).
    pub fn set_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.sched.set_waker(waker);
    }

    /// Reclaim every scope nothing owns anymore.
    pub fn sweep(&self) {
        self.inner.sweep();
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeRef {
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Create a child scope under this one with the given edge priority.
    pub fn child_with_priority(&self, label: impl Into<String>, priority: i32) -> ScopeRef {
        let id = {
            let mut state = self.inner.state.write();
            let id = state.graph.insert(label);
            state
                .graph
                .add_parent(id, self.id, priority)
                .expect("fresh child cannot form a cycle");
            state
                .graph
                .node_mut(id)
                .expect("just inserted")
                .add_handle();
            id
        };
        // A fresh child has no consumers, so no re-resolution is due.
        ScopeRef {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Create a child scope with default edge priority.
    pub fn child(&self, label: impl Into<String>) -> ScopeRef {
        self.child_with_priority(label, 0)
    }

    /// Link this scope under an additional parent. Fails on unknown
    /// scopes and on cycle-forming edges, without mutating anything.
    pub fn add_parent(&self, parent: &ScopeRef, priority: i32) -> Result<()> {
        let affected = {
            let mut state = self.inner.state.write();
            state.graph.add_parent(self.id, parent.id, priority)?;
            state.graph.consumers_below(self.id, None)
        };
        self.inner.relink(affected);
        Ok(())
    }

    /// Remove a parent edge. Returns whether an edge existed.
    pub fn remove_parent(&self, parent: &ScopeRef) -> bool {
        let affected = {
            let mut state = self.inner.state.write();
            if !state.graph.remove_parent(self.id, parent.id) {
                return false;
            }
            state.graph.consumers_below(self.id, None)
        };
        self.inner.relink(affected);
        true
    }

    /// Attach a producer to this scope, activating every grip it
    /// declares.
    pub fn attach(&self, tap: Arc<dyn Tap>) -> Result<TapHandle> {
        let id = self.inner.attach_tap(self.id, tap, None)?;
        Ok(TapHandle {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Request the live stream for `grip` at this scope.
    ///
    /// The stream is created on first request and reused afterwards; it
    /// starts at the grip's default and follows the nearest producer.
    pub fn stream(&self, grip: &Grip) -> Arc<Drip> {
        self.inner
            .stream_at(self.id, grip)
            .expect("scope is alive while a handle exists")
    }
}

impl Clone for ScopeRef {
    fn clone(&self) -> Self {
        if let Some(node) = self.inner.state.write().graph.node_mut(self.id) {
            node.add_handle();
        }
        Self {
            inner: Arc::clone(&self.inner),
            id: self.id,
        }
    }
}

impl Drop for ScopeRef {
    fn drop(&mut self) {
        if let Some(node) = self.inner.state.write().graph.node_mut(self.id) {
            node.drop_handle();
        }
        if self.inner.config.sweep_on_handle_drop {
            self.inner
                .sched
                .submit_weak(priority::SWEEP, &self.inner, |inner| inner.sweep());
        }
    }
}

impl TapHandle {
    pub fn id(&self) -> TapId {
        self.id
    }
}

impl Drop for TapHandle {
    fn drop(&mut self) {
        self.inner.detach_tap(self.id);
    }
}

// ---------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------

impl EngineInner {
    /// Attach `tap` at `scope`. `active` restricts the registration to
    /// a subset of the declared provides (used by attribution); `None`
    /// activates everything.
    pub(crate) fn attach_tap(
        self: &Arc<Self>,
        scope: ScopeId,
        tap: Arc<dyn Tap>,
        active: Option<Vec<Grip>>,
    ) -> Result<TapId> {
        tap.spec().validate()?;
        let active: IndexSet<Grip> = match active {
            Some(grips) => grips.into_iter().collect(),
            None => tap.spec().provides().iter().cloned().collect(),
        };

        let id = TapId::new();
        let affected = {
            let mut state = self.state.write();
            let node = state
                .graph
                .node_mut(scope)
                .ok_or(EngineError::UnknownScope(scope))?;
            for grip in &active {
                node.push_tap(grip.clone(), id);
            }
            let record = ProducerRecord::new(id, Arc::clone(&tap), scope, active.clone());
            state.records.insert(id, record);

            let grips: Vec<Grip> = active.iter().cloned().collect();
            state.graph.consumers_below(scope, Some(grips.as_slice()))
        };
        debug!(tap = id.raw(), scope = scope.raw(), "tap attached");

        if tap.spec().hooks().attachment {
            tap.attached(scope);
        }

        // Home-parameter subscriptions: each change re-produces every
        // destination this record serves.
        let home_params = tap.spec().home_params().to_vec();
        if !home_params.is_empty() {
            let mut subs = Vec::new();
            for grip in home_params {
                if let Ok(drip) = self.stream_at(scope, &grip) {
                    let weak = Arc::downgrade(self);
                    let sub = drip.subscribe(move |_| {
                        if let Some(inner) = weak.upgrade() {
                            inner.reproduce_record(id);
                        }
                    });
                    subs.push((drip, sub));
                }
            }
            let mut state = self.state.write();
            if let Some(record) = state.records.get_mut(&id) {
                record.home_subs = subs;
            }
        }

        self.relink(affected);
        Ok(id)
    }

    /// Detach a record entirely, firing hooks and re-resolving every
    /// pair it served.
    pub(crate) fn detach_tap(self: &Arc<Self>, id: TapId) {
        let (record, served) = {
            let mut state = self.state.write();
            let Some(record) = state.records.shift_remove(&id) else {
                return;
            };
            let active: Vec<Grip> = record.active.iter().cloned().collect();
            if let Some(node) = state.graph.node_mut(record.home) {
                for grip in &active {
                    node.remove_tap(grip, id);
                }
            }
            // Served pairs lose their provider-cache entries up front;
            // relink recomputes them from scratch.
            let served = record.served_pairs();
            for (dest, grip) in &served {
                if let Some(node) = state.graph.node_mut(*dest) {
                    if node.provider(grip) == Some(id) {
                        node.clear_provider(grip);
                    }
                }
            }
            (record, served)
        };
        debug!(tap = id.raw(), scope = record.home.raw(), "tap detached");

        let hooks = record.tap.spec().hooks();
        if hooks.connection {
            for (dest, destination) in &record.destinations {
                if !destination.grips.is_empty() {
                    record.tap.disconnected(*dest);
                }
            }
        }
        if hooks.attachment {
            record.tap.detached(record.home);
        }
        drop(record);

        self.relink(served);
    }

    /// Restrict an attribution-managed record to fewer active grips.
    /// Returns true when the record is left empty (caller detaches it).
    pub(crate) fn deactivate_grips(self: &Arc<Self>, id: TapId, grips: &[Grip]) -> bool {
        let (affected, empty) = {
            let mut state = self.state.write();
            let Some(record) = state.records.get_mut(&id) else {
                return false;
            };
            let home = record.home;
            for grip in grips {
                record.active.shift_remove(grip);
            }
            let empty = record.active.is_empty();

            // Relinking unlinks these pairs through the provider cache,
            // shrinking this record's destinations as it goes.
            let affected: Vec<(ScopeId, Grip)> = record
                .served_pairs()
                .into_iter()
                .filter(|(_, grip)| grips.contains(grip))
                .collect();

            if let Some(node) = state.graph.node_mut(home) {
                for grip in grips {
                    node.remove_tap(grip, id);
                }
            }
            (affected, empty)
        };
        self.relink(affected);
        empty
    }

    /// Widen an attribution-managed record with newly-won grips.
    pub(crate) fn activate_grips(self: &Arc<Self>, id: TapId, grips: &[Grip]) {
        let affected = {
            let mut state = self.state.write();
            let Some(record) = state.records.get_mut(&id) else {
                return;
            };
            let home = record.home;
            for grip in grips {
                record.active.insert(grip.clone());
            }
            if let Some(node) = state.graph.node_mut(home) {
                for grip in grips {
                    node.push_tap(grip.clone(), id);
                }
            }
            state.graph.consumers_below(home, Some(grips))
        };
        self.relink(affected);
    }

    /// Create or reuse the consumer stream for (scope, grip) and link
    /// it to its nearest producer.
    pub(crate) fn stream_at(self: &Arc<Self>, scope: ScopeId, grip: &Grip) -> Result<Arc<Drip>> {
        let (drip, fresh) = {
            let mut state = self.state.write();
            let node = state
                .graph
                .node_mut(scope)
                .ok_or(EngineError::UnknownScope(scope))?;
            match node.consumer(grip) {
                Some(existing) => (existing, false),
                None => {
                    let drip = Drip::new(
                        grip.clone(),
                        scope,
                        grip.default_value().clone(),
                        Arc::clone(&self.sched),
                    );
                    node.set_consumer(grip.clone(), &drip);
                    (drip, true)
                }
            }
        };
        if fresh {
            self.relink(vec![(scope, grip.clone())]);
            // A recreated stream can find the pair already linked (the
            // provider cache outlives a reclaimed predecessor), which
            // relinking treats as unchanged. Produce explicitly so the
            // new stream starts from a produced value, not the default.
            let provider = {
                let state = self.state.read();
                state.graph.node(scope).and_then(|node| node.provider(grip))
            };
            if let Some(id) = provider {
                self.produce_for(id, scope);
            }
        }
        Ok(drip)
    }

    /// Re-run selection for the given consumer pairs and rewire links
    /// that changed.
    pub(crate) fn relink(self: &Arc<Self>, pairs: Vec<(ScopeId, Grip)>) {
        if pairs.is_empty() {
            return;
        }
        let mut actions = Actions::default();
        {
            let mut state = self.state.write();
            for (scope, grip) in pairs {
                Self::relink_pair(&mut state, scope, &grip, &mut actions);
            }
        }
        self.run(actions);
    }

    fn relink_pair(state: &mut EngineState, scope: ScopeId, grip: &Grip, actions: &mut Actions) {
        let Some(node) = state.graph.node(scope) else { return };
        let old = node.provider(grip);
        let consumer = node.consumer(grip);

        // A reclaimed stream unlinks; its pair may relink later if the
        // stream is requested again.
        let Some(drip) = consumer else {
            if let Some(old_id) = old {
                Self::unlink_pair(state, old_id, scope, grip, actions);
                if let Some(node) = state.graph.node_mut(scope) {
                    node.clear_provider(grip);
                }
            }
            return;
        };

        let new = resolve(&state.graph, scope, grip).map(|(_, tap)| tap);
        if old == new {
            return;
        }

        if let Some(old_id) = old {
            Self::unlink_pair(state, old_id, scope, grip, actions);
        }

        match new {
            Some(new_id) => {
                if let Some(node) = state.graph.node_mut(scope) {
                    node.set_provider(grip.clone(), new_id);
                }
                if let Some(record) = state.records.get_mut(&new_id) {
                    let destination = record
                        .destinations
                        .entry(scope)
                        .or_insert_with(Destination::new);
                    let first = destination.grips.is_empty();
                    destination.grips.insert(grip.clone());

                    if first {
                        if record.tap.spec().hooks().connection {
                            actions
                                .hooks
                                .push(HookCall::Connected(Arc::clone(&record.tap), scope));
                        }
                        if !record.tap.spec().destination_params().is_empty()
                            && destination.param_subs.is_none()
                        {
                            actions.param_subs.push((new_id, scope));
                        }
                    }
                    actions.produces.insert((new_id, scope));
                }
            }
            None => {
                if let Some(node) = state.graph.node_mut(scope) {
                    node.clear_provider(grip);
                }
                // Degrading to "no provider" pushes the default so the
                // consumer's state stays deterministic.
                actions
                    .defaults
                    .push((drip, grip.default_value().clone()));
            }
        }
    }

    /// Remove `grip` from the destination `old` serves at `scope`,
    /// collecting disconnect work when the destination empties.
    fn unlink_pair(
        state: &mut EngineState,
        old: TapId,
        scope: ScopeId,
        grip: &Grip,
        actions: &mut Actions,
    ) {
        let Some(record) = state.records.get_mut(&old) else { return };
        let Some(destination) = record.destinations.get_mut(&scope) else { return };
        destination.grips.shift_remove(grip);
        if destination.grips.is_empty() {
            let dropped = record.destinations.shift_remove(&scope);
            if record.tap.spec().hooks().connection {
                actions
                    .hooks
                    .push(HookCall::Disconnected(Arc::clone(&record.tap), scope));
            }
            // Parameter subscriptions die with the destination; their
            // drops run outside the lock via the graveyard.
            if let Some(destination) = dropped {
                actions.graveyard.push(destination);
            }
        }
    }

    /// Run collected side effects with no lock held.
    fn run(self: &Arc<Self>, actions: Actions) {
        let Actions {
            hooks,
            param_subs,
            produces,
            defaults,
            graveyard,
        } = actions;

        // Subscriptions (and their streams) drop first so later steps
        // observe the settled subscriber sets.
        drop(graveyard);

        for (tap, dest) in param_subs {
            self.create_destination_params(tap, dest);
        }

        for hook in hooks {
            match hook {
                HookCall::Connected(tap, scope) => tap.connected(scope),
                HookCall::Disconnected(tap, scope) => tap.disconnected(scope),
            }
        }

        for (tap, dest) in produces {
            self.produce_for(tap, dest);
        }

        for (drip, default) in defaults {
            drip.next(default);
        }
    }

    /// Lazily create the destination-parameter subscriptions for one
    /// destination: parameter changes trigger re-production there.
    fn create_destination_params(self: &Arc<Self>, id: TapId, dest: ScopeId) {
        let params: Vec<Grip> = {
            let state = self.state.read();
            match state.records.get(&id) {
                Some(record) => record.tap.spec().destination_params().to_vec(),
                None => return,
            }
        };

        let mut subs = Vec::new();
        for grip in params {
            if let Ok(drip) = self.stream_at(dest, &grip) {
                let weak = Arc::downgrade(self);
                let sub = drip.subscribe(move |_| {
                    if let Some(inner) = weak.upgrade() {
                        inner.produce_for(id, dest);
                    }
                });
                subs.push((drip, sub));
            }
        }

        let mut state = self.state.write();
        if let Some(record) = state.records.get_mut(&id) {
            if let Some(destination) = record.destinations.get_mut(&dest) {
                destination.param_subs = Some(subs);
            }
        }
    }

    /// Ask a record to produce for one destination and route what it
    /// publishes into that destination's live streams.
    pub(crate) fn produce_for(self: &Arc<Self>, id: TapId, dest: ScopeId) {
        let (tap, production, sinks) = {
            let state = self.state.read();
            let Some(record) = state.records.get(&id) else { return };
            let Some(destination) = record.destinations.get(&dest) else { return };
            let requested: Vec<Grip> = destination.grips.iter().cloned().collect();

            let mut params = HashMap::new();
            if let Some(node) = state.graph.node(dest) {
                for grip in record.tap.spec().destination_params() {
                    if let Some(drip) = node.consumer(grip) {
                        params.insert(grip.clone(), drip.get());
                    }
                }
            }
            if let Some(node) = state.graph.node(record.home) {
                for grip in record.tap.spec().home_params() {
                    if let Some(drip) = node.consumer(grip) {
                        params.insert(grip.clone(), drip.get());
                    }
                }
            }

            let mut sinks: HashMap<Grip, Arc<Drip>> = HashMap::new();
            if let Some(node) = state.graph.node(dest) {
                for grip in &requested {
                    if let Some(drip) = node.consumer(grip) {
                        sinks.insert(grip.clone(), drip);
                    }
                }
            }

            (
                Arc::clone(&record.tap),
                Production::new(dest, requested, params),
                sinks,
            )
        };

        let mut production = production;
        tap.produce(&mut production);

        // Only grips this destination actually receives are delivered;
        // the rest of the publication is dropped on the floor.
        for (grip, value) in production.into_updates() {
            if let Some(drip) = sinks.get(&grip) {
                drip.next(value);
            }
        }
    }

    /// Re-produce every destination of one record (home parameters
    /// changed).
    pub(crate) fn reproduce_record(self: &Arc<Self>, id: TapId) {
        let dests: Vec<ScopeId> = {
            let state = self.state.read();
            match state.records.get(&id) {
                Some(record) => record.destinations.keys().copied().collect(),
                None => return,
            }
        };
        for dest in dests {
            self.produce_for(id, dest);
        }
    }

    /// Unlink dead consumer streams, then reclaim ownerless scopes.
    pub(crate) fn sweep(self: &Arc<Self>) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.write();

            // Consumer-removed trigger for every reclaimed stream.
            let scopes: Vec<ScopeId> = state.graph.iter().map(|node| node.id()).collect();
            for scope in scopes {
                let dead = match state.graph.node_mut(scope) {
                    Some(node) => node.prune_dead_consumers(),
                    None => continue,
                };
                for grip in dead {
                    if let Some(old) = state
                        .graph
                        .node(scope)
                        .and_then(|node| node.provider(&grip))
                    {
                        Self::unlink_pair(&mut state, old, scope, &grip, &mut actions);
                        if let Some(node) = state.graph.node_mut(scope) {
                            node.clear_provider(&grip);
                        }
                    }
                }
            }

            let reclaimed = state.graph.sweep();
            for scope in reclaimed {
                for record in state.records.values_mut() {
                    if let Some(destination) = record.destinations.shift_remove(&scope) {
                        actions.graveyard.push(destination);
                    }
                }
            }
        }
        self.run(actions);
    }
}
