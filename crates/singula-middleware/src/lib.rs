//! `singula-middleware` – in-process routing
//!
//! Moves data between the axis layer, the safety governor and external
//! observers without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.
//! - [`frame_hub`] – Upstream heartbeat fan-out with per-subscriber
//!   drop-oldest buffering.

pub mod bus;
pub mod frame_hub;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use frame_hub::{FrameHub, HeartbeatReader, HeartbeatSubscription};
