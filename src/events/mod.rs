//! Lifecycle notifications.
//!
//! Every task and step transition is announced on a broadcast channel.
//! Subscribers (logging, metrics, webhooks) live outside the engine; a
//! receiver that falls behind the channel capacity misses events.

pub mod publisher;

pub use publisher::{EntityType, EventPublisher, LifecycleEvent};
