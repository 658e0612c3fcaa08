//! Value Streams
//!
//! The single-value reactive primitive the runtime hands to consumers.
//! A stream is unique per (grip, destination scope) for the lifetime of
//! that pairing; the scope graph holds it weakly and the consumer's
//! `Arc` keeps it alive.

mod drip;
mod subscriber;

pub use drip::{Drip, Subscription};
pub use subscriber::SubscriberId;
