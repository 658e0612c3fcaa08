//! Activation: query-driven producer attribution, wired to a scope
//!
//! An `Activation` binds a [`QueryEvaluator`] to one scope. It watches
//! the evaluator's input grips through immediate stream subscriptions —
//! the evaluator must react within the same turn an input changes — and
//! schedules the resulting attribution delta as a single task, so a
//! batch of producer transfers commits atomically before any affected
//! consumer re-resolves.
//!
//! Applying a delta turns attribution into ordinary (partial) producer
//! registrations at the activation's scope: lost grips shrink or detach
//! the binding's record, won grips attach or widen it, and normal
//! incremental re-resolution does the rest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::engine::{Engine, EngineInner, ScopeRef};
use crate::error::{EngineError, Result};
use crate::graph::TapId;
use crate::grip::Grip;
use crate::query::{AttributionDelta, Binding, QueryEvaluator};
use crate::sched::priority;
use crate::stream::{Drip, Subscription};
use crate::value::Value;

type DeltaObserver = Box<dyn Fn(&AttributionDelta) + Send + Sync>;

/// A query evaluator bound to one scope of the engine.
pub struct Activation {
    inner: Arc<EngineInner>,
    scope: ScopeRef,
    eval: Mutex<QueryEvaluator>,

    /// Input streams under immediate subscription, one per watched grip.
    inputs: Mutex<HashMap<Grip, (Arc<Drip>, Subscription)>>,

    /// Binding id → the record its attribution currently owns.
    managed: Mutex<HashMap<String, TapId>>,

    observers: Mutex<Vec<DeltaObserver>>,
}

impl Engine {
    /// Create an activation bound to `scope`, using the engine's
    /// evaluator configuration.
    pub fn activation(&self, scope: &ScopeRef) -> Arc<Activation> {
        let inner = Arc::clone(self.inner());
        let eval = QueryEvaluator::new(inner.config.evaluator.clone());
        Arc::new(Activation {
            inner,
            scope: scope.clone(),
            eval: Mutex::new(eval),
            inputs: Mutex::new(HashMap::new()),
            managed: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        })
    }
}

impl Activation {
    /// Register a binding and schedule a re-evaluation.
    pub fn add_binding(self: &Arc<Self>, binding: Binding) {
        debug!(binding = binding.id(), "binding added");
        self.eval.lock().add_binding(binding);
        self.sync_inputs();
        self.schedule_evaluation();
    }

    /// Remove a binding by id; unknown ids are a no-op.
    pub fn remove_binding(self: &Arc<Self>, id: &str) {
        self.eval.lock().remove_binding(id);
        self.sync_inputs();
        self.schedule_evaluation();
    }

    /// Observe every applied attribution delta (diagnostics surface).
    pub fn on_delta<F>(&self, observer: F)
    where
        F: Fn(&AttributionDelta) + Send + Sync + 'static,
    {
        self.observers.lock().push(Box::new(observer));
    }

    /// Current attribution: output grip → winning binding id.
    pub fn attributed(&self) -> IndexMap<Grip, String> {
        self.eval.lock().winners().clone()
    }

    /// Apply an attribution delta to the graph.
    ///
    /// Validated before anything commits: a delta assigning one grip to
    /// more than one producer is rejected whole. Removals apply before
    /// additions so a transferred grip never has two managed owners.
    pub fn apply(self: &Arc<Self>, delta: &AttributionDelta) -> Result<()> {
        let mut seen: HashSet<&Grip> = HashSet::new();
        for entry in &delta.added {
            for grip in &entry.grips {
                if !seen.insert(grip) {
                    return Err(EngineError::AmbiguousDelta {
                        grip: grip.path().to_string(),
                    });
                }
            }
        }

        {
            let mut managed = self.managed.lock();

            for entry in &delta.removed {
                let Some(&tap_id) = managed.get(&entry.binding) else {
                    continue;
                };
                let emptied = self.inner.deactivate_grips(tap_id, &entry.grips);
                if emptied {
                    managed.remove(&entry.binding);
                    self.inner.detach_tap(tap_id);
                }
            }

            for entry in &delta.added {
                match managed.get(&entry.binding) {
                    Some(&tap_id) => self.inner.activate_grips(tap_id, &entry.grips),
                    None => {
                        let tap_id = self.inner.attach_tap(
                            self.scope.id(),
                            Arc::clone(&entry.tap),
                            Some(entry.grips.clone()),
                        )?;
                        managed.insert(entry.binding.clone(), tap_id);
                    }
                }
            }
        }

        for observer in self.observers.lock().iter() {
            observer(delta);
        }
        Ok(())
    }

    /// Evaluate against the current input snapshot. Runs synchronously;
    /// used by the immediate input subscriptions.
    fn input_changed(self: &Arc<Self>, changed: &Grip) {
        let delta = self.evaluate(std::slice::from_ref(changed));
        if delta.is_empty() {
            return;
        }
        // Delta application is its own task: the structural edits land
        // atomically, before any affected consumer re-resolves.
        self.inner
            .sched
            .submit_weak(priority::DELTA, self, move |activation| {
                if let Err(err) = activation.apply(&delta) {
                    error!("attribution delta rejected: {err}");
                }
            });
    }

    fn evaluate(&self, changed: &[Grip]) -> AttributionDelta {
        let values = self.snapshot_values();
        self.eval.lock().on_inputs_changed(changed, &values)
    }

    fn snapshot_values(&self) -> HashMap<Grip, Value> {
        self.inputs
            .lock()
            .iter()
            .map(|(grip, (drip, _))| (grip.clone(), drip.get()))
            .collect()
    }

    /// Bring the input subscriptions in line with the evaluator's
    /// current input set.
    fn sync_inputs(self: &Arc<Self>) {
        let watched = self.eval.lock().input_grips();

        let missing: Vec<Grip> = {
            let mut inputs = self.inputs.lock();
            inputs.retain(|grip, _| watched.contains(grip));
            watched
                .into_iter()
                .filter(|grip| !inputs.contains_key(grip))
                .collect()
        };

        // Streams are requested with no activation lock held: creating
        // one can trigger production into other watched inputs.
        for grip in missing {
            let Ok(drip) = self.inner.stream_at(self.scope.id(), &grip) else {
                continue;
            };
            let weak = Arc::downgrade(self);
            let watched_grip = grip.clone();
            let sub = drip.subscribe_priority(move |_| {
                if let Some(activation) = weak.upgrade() {
                    activation.input_changed(&watched_grip);
                }
            });
            self.inputs.lock().insert(grip, (drip, sub));
        }
    }

    /// Structural changes re-evaluate in their own scheduled task.
    fn schedule_evaluation(self: &Arc<Self>) {
        self.inner
            .sched
            .submit_weak(priority::DELTA, self, |activation| {
                let delta = activation.evaluate(&[]);
                if delta.is_empty() {
                    return;
                }
                if let Err(err) = activation.apply(&delta) {
                    error!("attribution delta rejected: {err}");
                }
            });
    }
}
