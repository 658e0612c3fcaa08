//! Subscriber identifiers for value streams.
//!
//! A subscriber is any callback attached to a stream, in either tier
//! (immediate or queued). Each registration gets a unique ID so that a
//! `Subscription` handle can later remove exactly its own entry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for one stream subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}
