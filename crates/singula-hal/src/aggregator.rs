//! [`AxisEventAggregator`] – fan-out of drive events to upper layers.
//!
//! Drives raise events inline on the task that issued the command.  The
//! aggregator's per-drive handlers only schedule work: every subscriber gets
//! its own spawned task per event, so subscriber order does not matter, a
//! panicking subscriber is contained and logged, and the drive's call stack
//! returns as soon as the tasks are scheduled.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use singula_types::{AxisEvent, AxisEventKind, AxisId};
use tokio::runtime::Handle;
use tracing::{debug, error};

use crate::drive::AxisDrive;
use crate::events::HandlerId;

/// Callback for aggregated axis events.
pub type AxisEventHandler = Arc<dyn Fn(AxisEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Attachment {
    drive: Arc<dyn AxisDrive>,
    handlers: Vec<HandlerId>,
}

struct Inner {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriberId, AxisEventHandler)>>,
    attached: Mutex<HashMap<AxisId, Attachment>>,
    runtime: Option<Handle>,
}

impl Inner {
    fn dispatch(&self, event: AxisEvent) {
        let targets: Vec<(SubscriberId, AxisEventHandler)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();
        let runtime = Handle::try_current().ok().or_else(|| self.runtime.clone());
        for (id, handler) in targets {
            let event = event.clone();
            match &runtime {
                Some(rt) => {
                    rt.spawn(async move { invoke(id, &handler, event) });
                }
                None => invoke(id, &handler, event),
            }
        }
    }
}

fn invoke(id: SubscriberId, handler: &AxisEventHandler, event: AxisEvent) {
    let kind = event.kind();
    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        error!(subscriber = id.0, ?kind, "axis event subscriber panicked");
    }
}

/// Shared aggregator.  Clones share the same subscribers and attachments.
#[derive(Clone)]
pub struct AxisEventAggregator {
    inner: Arc<Inner>,
}

impl Default for AxisEventAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl AxisEventAggregator {
    /// Create an aggregator bound to the current Tokio runtime, if any.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                subscribers: RwLock::new(Vec::new()),
                attached: Mutex::new(HashMap::new()),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn subscribe(&self, handler: AxisEventHandler) -> SubscriberId {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.inner.subscribers.write();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Broadcast an event that did not originate from a drive.
    pub fn publish(&self, event: AxisEvent) {
        self.inner.dispatch(event);
    }

    /// Install one handler per drive event kind.
    ///
    /// Returns `false` if the drive was already attached; in a concurrent
    /// attach the losing caller removes its own handlers again.
    pub fn attach(&self, drive: &Arc<dyn AxisDrive>) -> bool {
        let axis = drive.axis_id();
        if self.inner.attached.lock().contains_key(&axis) {
            return false;
        }

        let handlers: Vec<HandlerId> = AxisEventKind::DRIVE_KINDS
            .iter()
            .map(|kind| {
                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                drive.events().subscribe(
                    *kind,
                    Arc::new(move |event| {
                        if let Some(inner) = weak.upgrade() {
                            inner.dispatch(event);
                        }
                    }),
                )
            })
            .collect();

        let mut attached = self.inner.attached.lock();
        if attached.contains_key(&axis) {
            drop(attached);
            for id in handlers {
                drive.events().unsubscribe(id);
            }
            debug!(%axis, "lost attach race, handlers removed");
            return false;
        }
        attached.insert(
            axis,
            Attachment {
                drive: Arc::clone(drive),
                handlers,
            },
        );
        debug!(%axis, "drive attached to aggregator");
        true
    }

    /// Remove exactly the handlers installed by [`attach`](Self::attach).
    /// Returns `false` if the axis was not attached.
    pub fn detach(&self, axis: AxisId) -> bool {
        let Some(attachment) = self.inner.attached.lock().remove(&axis) else {
            return false;
        };
        for id in attachment.handlers {
            attachment.drive.events().unsubscribe(id);
        }
        debug!(%axis, "drive detached from aggregator");
        true
    }

    pub fn attached_count(&self) -> usize {
        self.inner.attached.lock().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::DriveContext;
    use crate::port::AxisPort;
    use crate::registry::DriveRegistry;
    use crate::sim::SimAxisPort;
    use singula_types::DriverOptions;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sim_drive(index: u16) -> Arc<dyn AxisDrive> {
        DriveRegistry::with_builtin()
            .create(
                "sim",
                DriveContext {
                    axis: AxisId(index),
                    node_id: index + 1,
                    reversed: false,
                    port: SimAxisPort::new(AxisId(index), index + 1) as Arc<dyn AxisPort>,
                    options: DriverOptions::default(),
                },
            )
            .ok()
            .unwrap()
    }

    fn disconnected(index: u16) -> AxisEvent {
        AxisEvent::Disconnected {
            axis: AxisId(index),
            reason: "link lost".into(),
        }
    }

    #[tokio::test]
    async fn drive_events_reach_every_subscriber() {
        let agg = AxisEventAggregator::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for tag in ["a", "b"] {
            let tx = tx.clone();
            agg.subscribe(Arc::new(move |ev| {
                let _ = tx.send((tag, ev));
            }));
        }
        let drive = sim_drive(0);
        assert!(agg.attach(&drive));

        drive.events().raise(disconnected(0));

        let mut tags = vec![rx.recv().await.unwrap().0, rx.recv().await.unwrap().0];
        tags.sort_unstable();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_starve_others() {
        let agg = AxisEventAggregator::new();
        agg.subscribe(Arc::new(|_| panic!("subscriber bug")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        agg.subscribe(Arc::new(move |ev| {
            let _ = tx.send(ev);
        }));

        agg.publish(AxisEvent::ControllerFault {
            message: "no axes".into(),
        });

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(got, Some(AxisEvent::ControllerFault { .. })));
    }

    #[tokio::test]
    async fn attach_is_idempotent_and_detach_is_exact() {
        let agg = AxisEventAggregator::new();
        let drive = sim_drive(1);
        let foreign = drive
            .events()
            .subscribe(AxisEventKind::Faulted, Arc::new(|_| {}));

        assert!(agg.attach(&drive));
        assert!(!agg.attach(&drive));
        assert_eq!(drive.events().handler_count(), 1 + AxisEventKind::DRIVE_KINDS.len());
        assert_eq!(agg.attached_count(), 1);

        assert!(agg.detach(AxisId(1)));
        assert!(!agg.detach(AxisId(1)));
        assert_eq!(drive.events().handler_count(), 1);
        assert!(drive.events().unsubscribe(foreign));
    }

    #[tokio::test]
    async fn unsubscribed_handler_is_not_called() {
        let agg = AxisEventAggregator::new();
        let id = agg.subscribe(Arc::new(|_| panic!("must not run")));
        assert!(agg.unsubscribe(id));
        assert_eq!(agg.subscriber_count(), 0);
        agg.publish(disconnected(3));
        tokio::task::yield_now().await;
    }
}
