//! Shared test doubles for the governor tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use singula_hal::{FleetControl, FleetOutcome};
use singula_types::{AxisId, SafetyIsolationState, SafetyTriggerKind, SingulaError};
use tokio_util::sync::CancellationToken;

use crate::isolator::{ListenerId, SafetyIsolator, StateListener};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Enable,
    Disable,
    WriteSpeed(f64),
    Stop,
    Reset,
}

/// Fleet that records every call in order.
#[derive(Default)]
pub struct RecordingFleet {
    calls: Mutex<Vec<Call>>,
    fail_enable: AtomicBool,
}

impl RecordingFleet {
    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn fail_enable(&self, fail: bool) {
        self.fail_enable.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: Call) -> FleetOutcome {
        self.calls.lock().push(call);
        FleetOutcome {
            attempted: 2,
            failures: Vec::new(),
        }
    }
}

#[async_trait]
impl FleetControl for RecordingFleet {
    async fn enable_all(&self, _cancel: &CancellationToken) -> FleetOutcome {
        let mut outcome = self.record(Call::Enable);
        if self.fail_enable.load(Ordering::SeqCst) {
            outcome.failures.push((
                AxisId(1),
                SingulaError::Transport {
                    axis: AxisId(1),
                    details: "no response".into(),
                },
            ));
        }
        outcome
    }

    async fn disable_all(&self, _cancel: &CancellationToken) -> FleetOutcome {
        self.record(Call::Disable)
    }

    async fn write_speed_all(&self, rpm: f64, _cancel: &CancellationToken) -> FleetOutcome {
        self.record(Call::WriteSpeed(rpm))
    }

    async fn stop_all(&self, _cancel: &CancellationToken) -> FleetOutcome {
        self.record(Call::Stop)
    }

    async fn reset(&self, _cancel: &CancellationToken) -> Result<(), SingulaError> {
        self.record(Call::Reset);
        Ok(())
    }
}

/// Isolator that stays `Normal` and logs the reason of every degrade request.
#[derive(Default)]
pub struct ReasonLog {
    reasons: Mutex<Vec<String>>,
}

impl ReasonLog {
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

impl SafetyIsolator for ReasonLog {
    fn state(&self) -> SafetyIsolationState {
        SafetyIsolationState::Normal
    }

    fn try_trip(&self, _kind: SafetyTriggerKind, _reason: &str) -> bool {
        false
    }

    fn try_enter_degraded(&self, _kind: SafetyTriggerKind, reason: &str) -> bool {
        self.reasons.lock().push(reason.to_string());
        false
    }

    fn try_recover_from_degraded(&self, _reason: &str) -> bool {
        false
    }

    fn try_reset_isolation(&self, _reason: &str) -> bool {
        false
    }

    fn add_listener(&self, _listener: StateListener) -> ListenerId {
        ListenerId::from_raw(0)
    }

    fn remove_listener(&self, _id: ListenerId) -> bool {
        false
    }
}
