//! Task Handles
//!
//! Every submission returns a handle exposing the task's lifecycle.
//! The lifecycle is a one-way street: pending → running → completed,
//! with a single detour pending → cancelled. Cancellation only wins
//! while the task is still pending; once a task has started it owns
//! its turn.

use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, not yet started.
    Pending,

    /// Currently executing.
    Running,

    /// Finished. A task that panicked, or whose weak referent was
    /// reclaimed before drain, still ends up here.
    Completed,

    /// Cancelled before it started. Terminal.
    Cancelled,
}

/// Shared handle to one scheduled task.
#[derive(Debug)]
pub struct TaskHandle {
    state: Mutex<TaskState>,
}

impl TaskHandle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TaskState::Pending),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Attempt to cancel the task. Succeeds only while pending.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TaskState::Pending {
            *state = TaskState::Cancelled;
            true
        } else {
            false
        }
    }

    /// Transition pending → running. Returns false if the task was
    /// cancelled in the meantime (the drain loop then skips it).
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TaskState::Pending {
            *state = TaskState::Running;
            true
        } else {
            false
        }
    }

    /// Transition running → completed.
    pub(crate) fn complete(&self) {
        *self.state.lock() = TaskState::Completed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_starts_pending() {
        let handle = TaskHandle::new();
        assert_eq!(handle.state(), TaskState::Pending);
    }

    #[test]
    fn cancel_only_wins_while_pending() {
        let handle = TaskHandle::new();
        assert!(handle.cancel());
        assert_eq!(handle.state(), TaskState::Cancelled);

        // Second cancel is a no-op failure.
        assert!(!handle.cancel());

        let handle = TaskHandle::new();
        assert!(handle.begin());
        assert!(!handle.cancel());
        handle.complete();
        assert_eq!(handle.state(), TaskState::Completed);
        assert!(!handle.cancel());
    }

    #[test]
    fn begin_refuses_cancelled_tasks() {
        let handle = TaskHandle::new();
        handle.cancel();
        assert!(!handle.begin());
        assert_eq!(handle.state(), TaskState::Cancelled);
    }
}
