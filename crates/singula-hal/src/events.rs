//! Per-drive event handler lists.
//!
//! A drive raises its events inline on whatever task issued the command.  The
//! handlers registered here must therefore be cheap; the
//! [`AxisEventAggregator`][crate::aggregator::AxisEventAggregator] installs
//! handlers that only schedule work and return.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use singula_types::{AxisEvent, AxisEventKind};

/// Callback invoked with every event of the kind it was registered for.
pub type EventHandler = Arc<dyn Fn(AxisEvent) + Send + Sync>;

/// Token returned by [`DriveEvents::subscribe`], used to remove exactly that
/// handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Handler registry owned by every drive.
#[derive(Default)]
pub struct DriveEvents {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, AxisEventKind, EventHandler)>>,
}

impl DriveEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe(&self, kind: AxisEventKind, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, kind, handler));
        id
    }

    /// Remove one handler.  Returns `false` when `id` was not registered.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(hid, _, _)| *hid != id);
        handlers.len() != before
    }

    /// Invoke every handler registered for the event's kind.
    ///
    /// Handlers run after the lock is released so a handler may subscribe or
    /// unsubscribe without deadlocking.
    pub fn raise(&self, event: AxisEvent) {
        let kind = event.kind();
        let targets: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| Arc::clone(h))
            .collect();
        for handler in targets {
            handler(event.clone());
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use singula_types::AxisId;

    fn feedback(rpm: f64) -> AxisEvent {
        AxisEvent::SpeedFeedback {
            axis: AxisId(0),
            rpm,
        }
    }

    #[test]
    fn raise_reaches_only_matching_kind() {
        let events = DriveEvents::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.subscribe(
            AxisEventKind::SpeedFeedback,
            Arc::new(move |ev| sink.lock().push(ev)),
        );
        events.subscribe(
            AxisEventKind::Faulted,
            Arc::new(|_| panic!("fault handler must not run")),
        );

        events.raise(feedback(12.0));
        assert_eq!(seen.lock().as_slice(), &[feedback(12.0)]);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_handler() {
        let events = DriveEvents::new();
        let a = events.subscribe(AxisEventKind::Faulted, Arc::new(|_| {}));
        let _b = events.subscribe(AxisEventKind::Faulted, Arc::new(|_| {}));
        assert_eq!(events.handler_count(), 2);

        assert!(events.unsubscribe(a));
        assert!(!events.unsubscribe(a));
        assert_eq!(events.handler_count(), 1);
    }
}
