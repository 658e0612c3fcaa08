//! Task Scheduler
//!
//! A priority queue of callbacks drained cooperatively. Two submission
//! modes exist:
//!
//! - `submit`: the callback is kept alive while queued.
//! - `submit_weak`: the callback runs against an `Arc` referent held
//!   weakly; if the referent was reclaimed by drain time the task
//!   silently completes as a no-op. This is the mode for observer
//!   callbacks owned by transient objects (streams, destinations).
//!
//! # Draining
//!
//! `flush` is re-entrant-safe: a drain already in progress absorbs a
//! nested flush request, and tasks enqueued during the drain are still
//! processed by it (the loop re-checks the heap every iteration). A
//! task that panics is caught, reported through `tracing::error!`, and
//! marked completed; the rest of the queue drains normally.
//!
//! # Auto-flush
//!
//! The scheduler does not own an event loop. Hosts register a waker
//! callback which is invoked exactly once per idle-to-busy transition;
//! the host is expected to call `flush` soon after, from its own loop.
//! Tests simply call `flush` manually.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

use super::task::TaskHandle;

type Job = Box<dyn FnOnce() + Send>;
type Waker = Box<dyn Fn() + Send + Sync>;

struct QueuedTask {
    priority: u32,
    seq: u64,
    job: Job,
    handle: Arc<TaskHandle>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Reversed so the std max-heap pops the smallest (priority, seq).
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

/// The cooperative task scheduler.
pub struct TaskScheduler {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    seq: AtomicU64,
    draining: AtomicBool,
    /// True once a waker has fired for the current busy period.
    woken: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl TaskScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            woken: AtomicBool::new(false),
            waker: Mutex::new(None),
        }
    }

    /// Submit a task. The callback stays alive while queued.
    pub fn submit<F>(&self, priority: u32, job: F) -> Arc<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = TaskHandle::new();
        let task = QueuedTask {
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            job: Box::new(job),
            handle: Arc::clone(&handle),
        };
        self.queue.lock().push(task);
        self.signal();
        handle
    }

    /// Submit a task bound to `target` through a weak reference.
    ///
    /// If every strong reference to `target` is gone by the time the
    /// queue drains, the task completes as a no-op.
    pub fn submit_weak<T, F>(&self, priority: u32, target: &Arc<T>, job: F) -> Arc<TaskHandle>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        let weak: Weak<T> = Arc::downgrade(target);
        self.submit(priority, move || {
            if let Some(target) = weak.upgrade() {
                job(target);
            }
        })
    }

    /// Register the auto-flush waker. Invoked once per idle-to-busy
    /// transition; the host should flush soon after.
    pub fn set_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.waker.lock() = Some(Box::new(waker));
    }

    /// Number of queued (not yet drained) tasks.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drain the queue in (priority, sequence) order.
    ///
    /// Nested calls made while a drain is running return immediately;
    /// the outer drain picks up whatever they would have processed.
    pub fn flush(&self) {
        if self.draining.swap(true, AtomicOrdering::SeqCst) {
            return;
        }

        loop {
            let task = self.queue.lock().pop();
            let Some(task) = task else { break };

            // A cancelled task is popped and dropped without running.
            if !task.handle.begin() {
                continue;
            }

            if let Err(payload) = catch_unwind(AssertUnwindSafe(task.job)) {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(priority = task.priority, seq = task.seq, "scheduled task panicked: {msg}");
            }
            task.handle.complete();
        }

        self.draining.store(false, AtomicOrdering::SeqCst);
        self.woken.store(false, AtomicOrdering::SeqCst);
    }

    // One wake per idle-to-busy transition; submissions during a drain
    // are absorbed by that drain and never wake.
    fn signal(&self) {
        if self.draining.load(AtomicOrdering::SeqCst) {
            return;
        }
        if self.woken.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let waker = self.waker.lock();
        if let Some(waker) = waker.as_ref() {
            waker();
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}
