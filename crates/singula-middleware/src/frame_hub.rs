//! [`FrameHub`] – fan-out point for upstream heartbeat frames.
//!
//! The upstream protocol framer publishes every heartbeat it decodes with
//! [`FrameHub::publish_heartbeat`].  Each consumer calls
//! [`FrameHub::subscribe_heartbeats`] with its own buffer capacity and gets a
//! private channel: a consumer that falls behind loses its *oldest* buffered
//! heartbeats, never blocks the publisher, and never affects other consumers.
//! Heartbeat loss under extreme load is therefore an accepted property of the
//! channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    heartbeat_subscribers: Mutex<HashMap<u64, broadcast::Sender<Vec<u8>>>>,
}

/// Shared upstream frame hub.  Clone it cheaply – all clones share the same
/// subscriber table.
#[derive(Clone, Default)]
pub struct FrameHub {
    inner: Arc<HubInner>,
}

impl FrameHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a heartbeat consumer with a private buffer of `capacity`
    /// frames (at least one).
    ///
    /// Dropping the returned [`HeartbeatSubscription`], or calling
    /// [`HeartbeatSubscription::unsubscribe`], ends the reader: its next
    /// `recv` returns `None` once buffered frames are drained.
    pub fn subscribe_heartbeats(&self, capacity: usize) -> (HeartbeatReader, HeartbeatSubscription) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.heartbeat_subscribers.lock().insert(id, tx);
        debug!(subscriber = id, capacity, "heartbeat subscriber registered");
        (
            HeartbeatReader { receiver: rx },
            HeartbeatSubscription {
                id,
                hub: Arc::clone(&self.inner),
            },
        )
    }

    /// Deliver one heartbeat frame to every current subscriber.
    ///
    /// Returns the number of subscribers the frame was handed to.
    pub fn publish_heartbeat(&self, payload: &[u8]) -> usize {
        let subscribers = self.inner.heartbeat_subscribers.lock();
        subscribers
            .values()
            .filter(|tx| tx.send(payload.to_vec()).is_ok())
            .count()
    }

    pub fn heartbeat_subscriber_count(&self) -> usize {
        self.inner.heartbeat_subscribers.lock().len()
    }
}

/// Receiving half of a heartbeat subscription.
pub struct HeartbeatReader {
    receiver: broadcast::Receiver<Vec<u8>>,
}

impl HeartbeatReader {
    /// Wait for the next heartbeat.
    ///
    /// Overflowed frames are skipped (the oldest were dropped) and reading
    /// continues.  Returns `None` after the subscription has been removed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "heartbeat reader lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Handle that keeps a heartbeat subscription registered.
pub struct HeartbeatSubscription {
    id: u64,
    hub: Arc<HubInner>,
}

impl HeartbeatSubscription {
    /// Remove the subscription from the hub.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for HeartbeatSubscription {
    fn drop(&mut self) {
        if self.hub.heartbeat_subscribers.lock().remove(&self.id).is_some() {
            debug!(subscriber = self.id, "heartbeat subscriber removed");
        }
    }
}
