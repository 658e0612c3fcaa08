//! Drip: the single-value reactive stream
//!
//! A `Drip` is a live cell holding the last value delivered for one
//! (grip, destination scope) pairing. Consumers read it with `get` and
//! observe changes through one of two subscriber tiers:
//!
//! - **Immediate** subscribers run synchronously inside the `next` call,
//!   in registration order. They exist for internal plumbing that must
//!   react within the same turn (the query evaluator watching its input
//!   grips); callers accept the reentrancy risk.
//! - **Queued** subscribers are notified through exactly one scheduled
//!   task no matter how many `next` calls land before the task drains,
//!   and observe the final value only.
//!
//! # Lifecycle hooks
//!
//! `on_first_subscriber` hooks fire synchronously on every 0→1
//! subscriber transition. `on_zero_subscribers` hooks are checked one
//! scheduled task after a detach, so a detach immediately followed by a
//! reattach in the same turn does not spuriously fire teardown.
//!
//! All operations are total; nothing here returns an error. Notifying a
//! drip whose owner was reclaimed degrades to a no-op (the queued-notify
//! task holds the drip weakly).

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::graph::ScopeId;
use crate::grip::Grip;
use crate::sched::{priority, TaskScheduler};
use crate::value::Value;

use super::subscriber::SubscriberId;

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;
type HookFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct SubscriberLists {
    immediate: Vec<(SubscriberId, Callback)>,
    queued: Vec<(SubscriberId, Callback)>,
}

impl SubscriberLists {
    fn len(&self) -> usize {
        self.immediate.len() + self.queued.len()
    }

    fn remove(&mut self, id: SubscriberId) {
        self.immediate.retain(|(sub, _)| *sub != id);
        self.queued.retain(|(sub, _)| *sub != id);
    }
}

#[derive(Default)]
struct Hooks {
    on_first: Vec<HookFn>,
    on_zero: Vec<HookFn>,
}

/// A live, auto-updating value cell for one (grip, destination scope).
pub struct Drip {
    grip: Grip,
    scope: ScopeId,
    value: RwLock<Value>,
    subs: Mutex<SubscriberLists>,
    hooks: Mutex<Hooks>,
    /// True while a queued-notify task is outstanding.
    pending_notify: AtomicBool,
    sched: Arc<TaskScheduler>,
}

/// RAII handle for one subscription. Dropping it unsubscribes.
pub struct Subscription {
    drip: Weak<Drip>,
    id: SubscriberId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(drip) = self.drip.upgrade() {
            drip.unsubscribe(self.id);
        }
    }
}

impl Drip {
    pub(crate) fn new(
        grip: Grip,
        scope: ScopeId,
        initial: Value,
        sched: Arc<TaskScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            grip,
            scope,
            value: RwLock::new(initial),
            subs: Mutex::new(SubscriberLists::default()),
            hooks: Mutex::new(Hooks::default()),
            pending_notify: AtomicBool::new(false),
            sched,
        })
    }

    /// The grip this stream delivers.
    pub fn grip(&self) -> &Grip {
        &self.grip
    }

    /// The destination scope this stream was requested at.
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// The last delivered value.
    pub fn get(&self) -> Value {
        self.value.read().clone()
    }

    /// Push a new value.
    ///
    /// A value equal to the current one is a no-op. Otherwise immediate
    /// subscribers run synchronously in registration order, and one
    /// coalesced queued notification is scheduled if none is pending.
    pub fn next(self: &Arc<Self>, value: Value) {
        {
            let mut current = self.value.write();
            if *current == value {
                return;
            }
            *current = value.clone();
        }

        // Snapshot outside the lock: an immediate subscriber may
        // subscribe, unsubscribe, or push values reentrantly.
        let immediate: Vec<Callback> = {
            let subs = self.subs.lock();
            subs.immediate.iter().map(|(_, f)| Arc::clone(f)).collect()
        };
        for f in immediate {
            f(&value);
        }

        if !self.pending_notify.swap(true, Ordering::SeqCst) {
            self.sched
                .submit_weak(priority::NOTIFY, self, |drip| drip.flush_queued());
        }
    }

    /// Register a queued subscriber. Returns the RAII subscription.
    pub fn subscribe<F>(self: &Arc<Self>, f: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.attach(f, false)
    }

    /// Register an immediate (synchronous) subscriber.
    pub fn subscribe_priority<F>(self: &Arc<Self>, f: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.attach(f, true)
    }

    /// Register a hook fired on every 0→1 subscriber transition.
    pub fn on_first_subscriber<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.lock().on_first.push(Arc::new(f));
    }

    /// Register a hook fired once the subscriber count has settled at
    /// zero for a full scheduler turn after a detach.
    pub fn on_zero_subscribers<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.lock().on_zero.push(Arc::new(f));
    }

    /// Current number of subscribers across both tiers.
    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().len()
    }

    fn attach<F>(self: &Arc<Self>, f: F, immediate: bool) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = SubscriberId::new();
        let was_empty = {
            let mut subs = self.subs.lock();
            let was_empty = subs.len() == 0;
            let entry = (id, Arc::new(f) as Callback);
            if immediate {
                subs.immediate.push(entry);
            } else {
                subs.queued.push(entry);
            }
            was_empty
        };

        if was_empty {
            let hooks: Vec<HookFn> = self.hooks.lock().on_first.iter().map(Arc::clone).collect();
            for hook in hooks {
                hook();
            }
        }

        Subscription {
            drip: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(self: &Arc<Self>, id: SubscriberId) {
        self.subs.lock().remove(id);

        // The zero check is deferred by one task so detach-then-reattach
        // within a turn never observes an empty subscriber set.
        self.sched
            .submit_weak(priority::LIFECYCLE, self, |drip| {
                if drip.subscriber_count() == 0 {
                    let hooks: Vec<HookFn> =
                        drip.hooks.lock().on_zero.iter().map(Arc::clone).collect();
                    for hook in hooks {
                        hook();
                    }
                }
            });
    }

    fn flush_queued(self: &Arc<Self>) {
        // Clear the flag first: a `next` issued by a callback schedules
        // a fresh notification instead of being swallowed.
        self.pending_notify.store(false, Ordering::SeqCst);

        let value = self.get();
        let queued: Vec<Callback> = {
            let subs = self.subs.lock();
            subs.queued.iter().map(|(_, f)| Arc::clone(f)).collect()
        };
        for f in queued {
            f(&value);
        }
    }
}

impl std::fmt::Debug for Drip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drip")
            .field("grip", &self.grip)
            .field("scope", &self.scope)
            .field("value", &self.get())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
