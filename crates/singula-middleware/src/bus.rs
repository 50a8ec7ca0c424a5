//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Slow subscribers lose the oldest messages and observe a
//! `Lagged` error instead of stalling the publisher.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Axis`] | Drive status changes, faults, speed feedback |
//! | [`Topic::Safety`] | Isolator transitions and visible-state changes |
//! | [`Topic::Commands`] | Start / Stop / Reset requests seen by the governor |

use singula_types::Event;
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Per-axis driver traffic re-broadcast by the event aggregator.
    Axis,
    /// Safety posture and operator-visible state transitions.
    Safety,
    /// Control-plane requests (Start / Stop / Reset).
    Commands,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    axis: broadcast::Sender<Event>,
    safety: broadcast::Sender<Event>,
    commands: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (axis, _) = broadcast::channel(capacity);
        let (safety, _) = broadcast::channel(capacity);
        let (commands, _) = broadcast::channel(capacity);
        Self {
            axis,
            safety,
            commands,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event.
    /// Zero receivers is a normal condition (nobody is observing that topic
    /// yet), not an error.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        match self.topic_sender(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(_)) => {
                trace!(?topic, "event dropped: no subscribers");
                0
            }
        }
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Axis => &self.axis,
            Topic::Safety => &self.safety,
            Topic::Commands => &self.commands,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`TopicReceiver::recv`].
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use singula_types::{EventPayload, SystemState};

    fn make_event(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::SystemStateChanged {
                from: SystemState::Ready,
                to: SystemState::Running,
            },
        )
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>>
    {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::Safety);
        let mut subscriber2 = bus.subscribe_to(Topic::Safety);

        let event = make_event("singula-kernel::test");
        assert_eq!(bus.publish_to(Topic::Safety, event.clone()), 2);

        assert_eq!(subscriber1.recv().await?.id, event.id);
        assert_eq!(subscriber2.recv().await?.id, event.id);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_to(Topic::Axis, make_event("test")), 0);
    }

    /// A subscriber on `Commands` must not receive events published to
    /// `Safety` because they are routed through separate channels.
    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events() {
        let bus = EventBus::default();
        let mut commands = bus.subscribe_to(Topic::Commands);
        let _safety = bus.subscribe_to(Topic::Safety);

        bus.publish_to(Topic::Safety, make_event("singula-kernel::test"));

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), commands.recv()).await;
        assert!(
            result.is_err(),
            "Commands subscriber must not receive a Safety event"
        );
        assert_eq!(commands.topic(), Topic::Commands);
    }

    /// Flooding a low-capacity channel while a subscriber sleeps must produce
    /// a `Lagged` error rather than panicking or blocking.
    #[tokio::test]
    async fn topic_channel_lag_on_slow_subscriber() {
        let bus = EventBus::new(16);
        let mut slow_sub = bus.subscribe_to(Topic::Axis);

        for _ in 0..1_000 {
            bus.publish_to(Topic::Axis, make_event("flood::axis"));
        }

        let result = slow_sub.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(Topic::Axis), 0);
        let rx = bus.subscribe_to(Topic::Axis);
        assert_eq!(bus.subscriber_count(Topic::Axis), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(Topic::Axis), 0);
    }
}
