//! [`SafetyIsolator`] – owner of the canonical safety posture.
//!
//! The isolator only knows three states and four guarded transitions:
//!
//! | Call | Allowed from | To |
//! |---|---|---|
//! | `try_trip` | Normal, Degraded | Isolated |
//! | `try_enter_degraded` | Normal | Degraded |
//! | `try_recover_from_degraded` | Degraded | Normal |
//! | `try_reset_isolation` | Isolated | Normal |
//!
//! Refused transitions return `false` and notify nobody.  Accepted ones notify
//! every listener synchronously, after the state lock is released, so a
//! listener may read the state again.  Listeners must not block; the safety
//! pipeline's listener only enqueues.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use singula_types::{SafetyIsolationState, SafetyStateChange, SafetyTriggerKind};
use tracing::{info, warn};

/// Callback for accepted isolator transitions.
pub type StateListener = Arc<dyn Fn(SafetyStateChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Safety posture holder consumed by the governor.
pub trait SafetyIsolator: Send + Sync {
    fn state(&self) -> SafetyIsolationState;

    fn is_isolated(&self) -> bool {
        self.state() == SafetyIsolationState::Isolated
    }

    fn is_degraded(&self) -> bool {
        self.state() == SafetyIsolationState::Degraded
    }

    fn try_trip(&self, kind: SafetyTriggerKind, reason: &str) -> bool;
    fn try_enter_degraded(&self, kind: SafetyTriggerKind, reason: &str) -> bool;
    fn try_recover_from_degraded(&self, reason: &str) -> bool;
    fn try_reset_isolation(&self, reason: &str) -> bool;

    fn add_listener(&self, listener: StateListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Process-local isolator.
pub struct InMemoryIsolator {
    state: Mutex<SafetyIsolationState>,
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, StateListener)>>,
}

impl Default for InMemoryIsolator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIsolator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SafetyIsolationState::Normal),
            next_id: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn transition(
        &self,
        allowed_from: &[SafetyIsolationState],
        to: SafetyIsolationState,
        kind: Option<SafetyTriggerKind>,
        reason: &str,
    ) -> bool {
        let change = {
            let mut state = self.state.lock();
            if !allowed_from.contains(&*state) {
                return false;
            }
            let from = std::mem::replace(&mut *state, to);
            SafetyStateChange {
                from,
                to,
                kind,
                reason: reason.to_string(),
                at: Utc::now(),
            }
        };

        if to == SafetyIsolationState::Isolated {
            warn!(from = ?change.from, ?kind, reason, "safety isolation tripped");
        } else {
            info!(from = ?change.from, ?to, ?kind, reason, "safety state changed");
        }

        let listeners: Vec<StateListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(change.clone());
        }
        true
    }
}

impl SafetyIsolator for InMemoryIsolator {
    fn state(&self) -> SafetyIsolationState {
        *self.state.lock()
    }

    fn try_trip(&self, kind: SafetyTriggerKind, reason: &str) -> bool {
        use SafetyIsolationState::*;
        self.transition(&[Normal, Degraded], Isolated, Some(kind), reason)
    }

    fn try_enter_degraded(&self, kind: SafetyTriggerKind, reason: &str) -> bool {
        use SafetyIsolationState::*;
        self.transition(&[Normal], Degraded, Some(kind), reason)
    }

    fn try_recover_from_degraded(&self, reason: &str) -> bool {
        use SafetyIsolationState::*;
        self.transition(&[Degraded], Normal, None, reason)
    }

    fn try_reset_isolation(&self, reason: &str) -> bool {
        use SafetyIsolationState::*;
        self.transition(&[Isolated], Normal, None, reason)
    }

    fn add_listener(&self, listener: StateListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}
