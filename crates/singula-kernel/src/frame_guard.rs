//! [`FrameGuard`] – admission gate for upstream speed frames and the
//! heartbeat watchdog that feeds the safety governor.
//!
//! # Admission
//!
//! [`FrameGuard::evaluate`] applies, in order:
//!
//! 1. **Isolation** – while the governor reports `Isolated` every frame is
//!    rejected with [`RejectReason::Isolated`], whatever its sequence.
//! 2. **De-duplication** – a [`SequenceWindow`] rejects repeated sequence
//!    numbers with [`RejectReason::Duplicate`].
//! 3. **Degrade scaling** – while `Degraded` every speed is multiplied by
//!    `degrade_factor` and rounded half away from zero.
//!
//! Rejections are silent drops counted in [`FrameGuardMetrics`].
//!
//! # Heartbeat watchdog
//!
//! [`FrameGuard::start`] spawns two loops:
//!
//! - a reader that resets the heartbeat deadline for every heartbeat frame and,
//!   if the guard itself put the system in degraded mode, asks the governor to
//!   recover;
//! - a watchdog that ticks every `watchdog_tick`, asks the governor to degrade
//!   once the deadline passes, and clears the local flag when it sees the
//!   governor return to `Normal`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use singula_middleware::{FrameHub, HeartbeatReader, HeartbeatSubscription};
use singula_types::{
    FrameGuardDecision, RejectReason, SafetyIsolationState, SafetyStateChange, SafetyTriggerKind,
    SpeedSet,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::heartbeat::HeartbeatMonitor;
use crate::sequence_window::{DEFAULT_WINDOW, SequenceWindow};

const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";
const HEARTBEAT_RESTORED_REASON: &str = "heartbeat restored";

/// The part of the safety governor the frame guard talks to.
#[async_trait]
pub trait SafetyGovernor: Send + Sync {
    fn safety_state(&self) -> SafetyIsolationState;
    async fn try_enter_degraded(&self, kind: SafetyTriggerKind, reason: String) -> bool;
    async fn try_recover_from_degraded(&self, reason: String) -> bool;
    fn subscribe_state(&self) -> broadcast::Receiver<SafetyStateChange>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameGuardConfig {
    /// Multiplier applied to every speed while degraded.
    pub degrade_factor: f64,
    pub window_capacity: usize,
    pub heartbeat_timeout: Duration,
    pub watchdog_tick: Duration,
    /// Buffer of the private heartbeat subscription.
    pub heartbeat_capacity: usize,
}

impl Default for FrameGuardConfig {
    fn default() -> Self {
        Self {
            degrade_factor: 0.3,
            window_capacity: DEFAULT_WINDOW,
            heartbeat_timeout: Duration::from_secs(3),
            watchdog_tick: Duration::from_millis(200),
            heartbeat_capacity: 16,
        }
    }
}

/// Point-in-time copy of the guard's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameGuardMetrics {
    pub accepted: u64,
    pub rejected_isolated: u64,
    pub rejected_duplicate: u64,
    pub degraded_frames: u64,
    /// Mean absolute per-element change of the last scaled frame, in rpm.
    pub last_mean_deviation: f64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected_isolated: AtomicU64,
    rejected_duplicate: AtomicU64,
    degraded_frames: AtomicU64,
    last_mean_deviation: AtomicU64,
}

struct GuardInner {
    config: FrameGuardConfig,
    governor: Arc<dyn SafetyGovernor>,
    window: Mutex<SequenceWindow>,
    heartbeat: HeartbeatMonitor,
    locally_degraded: AtomicBool,
    counters: Counters,
}

impl GuardInner {
    async fn check_heartbeat(&self) {
        if !self.heartbeat.is_timed_out() || self.locally_degraded.load(Ordering::SeqCst) {
            return;
        }
        let entered = self
            .governor
            .try_enter_degraded(SafetyTriggerKind::HeartbeatTimeout, HEARTBEAT_TIMEOUT_REASON.to_string())
            .await;
        if entered {
            self.locally_degraded.store(true, Ordering::SeqCst);
            warn!(
                silent_ms = self.heartbeat.since_last_beat().as_millis() as u64,
                "upstream heartbeat lost, degraded mode requested"
            );
        } else {
            debug!("heartbeat timeout, governor refused degrade");
        }
    }

    async fn on_heartbeat(&self) {
        self.heartbeat.beat();
        if !self.locally_degraded.load(Ordering::SeqCst) {
            return;
        }
        let recovered = self
            .governor
            .try_recover_from_degraded(HEARTBEAT_RESTORED_REASON.to_string())
            .await;
        if recovered {
            self.locally_degraded.store(false, Ordering::SeqCst);
            info!("upstream heartbeat restored, recovered from degraded mode");
        }
    }

    fn on_state_change(&self, change: &SafetyStateChange) {
        if change.to == SafetyIsolationState::Normal
            && self.locally_degraded.swap(false, Ordering::SeqCst)
        {
            debug!("governor back to normal, heartbeat watchdog re-armed");
        }
    }
}

/// Frame admission gate with an upstream heartbeat watchdog.
pub struct FrameGuard {
    inner: Arc<GuardInner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameGuard {
    pub fn new(config: FrameGuardConfig, governor: Arc<dyn SafetyGovernor>) -> Self {
        let window = SequenceWindow::new(config.window_capacity);
        let heartbeat = HeartbeatMonitor::new(config.heartbeat_timeout);
        Self {
            inner: Arc::new(GuardInner {
                config,
                governor,
                window: Mutex::new(window),
                heartbeat,
                locally_degraded: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Decide whether `set` may be forwarded to the axes.
    pub fn evaluate(&self, set: SpeedSet) -> FrameGuardDecision {
        let counters = &self.inner.counters;
        let state = self.inner.governor.safety_state();

        if state == SafetyIsolationState::Isolated {
            counters.rejected_isolated.fetch_add(1, Ordering::Relaxed);
            debug!(sequence = set.sequence, "frame rejected: isolated");
            return reject(set, RejectReason::Isolated);
        }
        if !self.inner.window.lock().admit(set.sequence) {
            counters.rejected_duplicate.fetch_add(1, Ordering::Relaxed);
            debug!(sequence = set.sequence, "frame rejected: duplicate");
            return reject(set, RejectReason::Duplicate);
        }

        counters.accepted.fetch_add(1, Ordering::Relaxed);
        if state != SafetyIsolationState::Degraded {
            return FrameGuardDecision {
                accepted: true,
                effective_set: set,
                degraded: false,
                reason: None,
            };
        }

        let factor = self.inner.config.degrade_factor;
        let mut total_deviation = 0.0;
        let mut elements = 0usize;
        let mut scale = |values: &[i32]| -> Vec<i32> {
            values
                .iter()
                .map(|&v| {
                    let scaled = (f64::from(v) * factor).round() as i32;
                    total_deviation += (f64::from(v) - f64::from(scaled)).abs();
                    elements += 1;
                    scaled
                })
                .collect()
        };
        let effective_set = SpeedSet {
            main: scale(&set.main),
            eject: scale(&set.eject),
            ..set
        };
        let mean = if elements == 0 {
            0.0
        } else {
            total_deviation / elements as f64
        };
        counters.degraded_frames.fetch_add(1, Ordering::Relaxed);
        counters.last_mean_deviation.store(mean.to_bits(), Ordering::Relaxed);

        FrameGuardDecision {
            accepted: true,
            effective_set,
            degraded: true,
            reason: None,
        }
    }

    /// Subscribe to heartbeats on `hub` and start the reader and watchdog
    /// loops.  The heartbeat deadline starts now.
    pub fn start(&self, hub: &FrameHub) {
        self.inner.heartbeat.beat();
        let (reader, subscription) = hub.subscribe_heartbeats(self.inner.config.heartbeat_capacity);
        let states = self.inner.governor.subscribe_state();

        let reader_task = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.inner),
            reader,
            subscription,
            self.cancel.clone(),
        ));
        let watchdog_task = tokio::spawn(watchdog_loop(Arc::clone(&self.inner), states, self.cancel.clone()));
        self.tasks.lock().extend([reader_task, watchdog_task]);
        info!(
            timeout_ms = self.inner.config.heartbeat_timeout.as_millis() as u64,
            "frame guard started"
        );
    }

    pub fn metrics(&self) -> FrameGuardMetrics {
        let c = &self.inner.counters;
        FrameGuardMetrics {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected_isolated: c.rejected_isolated.load(Ordering::Relaxed),
            rejected_duplicate: c.rejected_duplicate.load(Ordering::Relaxed),
            degraded_frames: c.degraded_frames.load(Ordering::Relaxed),
            last_mean_deviation: f64::from_bits(c.last_mean_deviation.load(Ordering::Relaxed)),
        }
    }

    /// Whether the watchdog itself put the system into degraded mode.
    pub fn is_locally_degraded(&self) -> bool {
        self.inner.locally_degraded.load(Ordering::SeqCst)
    }

    /// Stop both loops.  This drops the heartbeat subscription and the
    /// governor state receiver.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await
                && !err.is_cancelled()
            {
                warn!(error = %err, "frame guard loop ended abnormally");
            }
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn reject(set: SpeedSet, reason: RejectReason) -> FrameGuardDecision {
    FrameGuardDecision {
        accepted: false,
        effective_set: set,
        degraded: false,
        reason: Some(reason),
    }
}

async fn heartbeat_loop(
    inner: Arc<GuardInner>,
    mut reader: HeartbeatReader,
    _subscription: HeartbeatSubscription,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = reader.recv() => match frame {
                Some(_) => inner.on_heartbeat().await,
                None => {
                    debug!("heartbeat stream closed");
                    break;
                }
            },
        }
    }
}

async fn watchdog_loop(
    inner: Arc<GuardInner>,
    mut states: broadcast::Receiver<SafetyStateChange>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(inner.config.watchdog_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut states_open = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            change = states.recv(), if states_open => match change {
                Ok(change) => inner.on_state_change(&change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "frame guard lagged behind safety state changes");
                }
                Err(broadcast::error::RecvError::Closed) => states_open = false,
            },
            _ = ticker.tick() => inner.check_heartbeat().await,
        }
    }
}
