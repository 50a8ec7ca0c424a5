//! [`SafetyPipeline`] – the safety governor.
//!
//! Every trigger the machine can see is turned into one [`SafetyOperation`]
//! and pushed onto a single unbounded queue with exactly one reader:
//!
//! | Source | Operation |
//! |---|---|
//! | Isolator transition listener | `StateChanged` |
//! | IO buttons, API, operator console | `Command` (Start / Stop / Reset) |
//! | Axis `Faulted` / `Disconnected` events | `AxisHealth` |
//! | Frame guard heartbeat watchdog | `Degrade` / `Recover` |
//!
//! The worker applies them strictly in arrival order, so two triggers fired
//! "at the same time" from different tasks are still decided one after the
//! other.  The worker is also the only code that calls the isolator's
//! transition methods.
//!
//! # Reactions
//!
//! - `StateChanged` to `Isolated` or `Degraded`: zero speed, stop and disable
//!   every axis.  Isolation shows `Alarm`; degrading while `Running` shows
//!   `Stopped`.
//! - `Start`: ignored while `Running` or `Alarm`, refused while isolated or
//!   when any axis fails to enable; otherwise enable, write the local speed in
//!   local mode, show `Running`.
//! - `Stop`: an emergency stop always runs the full fail-safe and shows
//!   `Alarm`.  Any other stop is ignored unless the machine is running; it
//!   zeroes speed, disables the axes, enters `Degraded` and shows `Stopped`.
//! - `Reset`: zero speed, disable, reset the bus, then reset isolation or
//!   recover from degraded as appropriate, and show `Ready`.
//! - `AxisHealth`: a fault tries to degrade, a disconnect tries to trip.  A
//!   refusal is logged and not escalated.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use singula_hal::{AxisEventAggregator, FleetControl, FleetOutcome, SubscriberId};
use singula_middleware::{EventBus, Topic};
use singula_types::{
    AxisEvent, AxisId, ControlMode, Event, EventPayload, SafetyCommand, SafetyIsolationState,
    SafetyStateChange, SafetyTriggerKind, SystemState,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::frame_guard::SafetyGovernor;
use crate::isolator::{ListenerId, SafetyIsolator};

const SOURCE: &str = "singula-kernel::safety_pipeline";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One unit of work for the governor loop.
#[derive(Debug)]
pub enum SafetyOperation {
    StateChanged(SafetyStateChange),
    Command {
        command: SafetyCommand,
        kind: SafetyTriggerKind,
        reason: String,
        triggered_by_io: bool,
    },
    AxisHealth {
        kind: SafetyTriggerKind,
        axis: Option<AxisId>,
        reason: String,
    },
    Degrade {
        kind: SafetyTriggerKind,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    Recover {
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    /// Resolves once every earlier operation has been applied.
    Barrier { reply: oneshot::Sender<()> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyPipelineConfig {
    pub control_mode: ControlMode,
    /// Roller speed written on Start in [`ControlMode::Local`].
    pub local_rpm: f64,
}

impl Default for SafetyPipelineConfig {
    fn default() -> Self {
        Self {
            control_mode: ControlMode::Remote,
            local_rpm: 0.0,
        }
    }
}

/// State readable from any task; written only by the worker.
struct Shared {
    isolator: Arc<dyn SafetyIsolator>,
    system_state: AtomicU8,
    bus: EventBus,
    state_tx: broadcast::Sender<SafetyStateChange>,
}

impl Shared {
    fn system_state(&self) -> SystemState {
        SystemState::from_u8(self.system_state.load(Ordering::Acquire)).unwrap_or(SystemState::Alarm)
    }

    fn set_system_state(&self, to: SystemState) {
        let from = SystemState::from_u8(self.system_state.swap(to as u8, Ordering::AcqRel))
            .unwrap_or(SystemState::Alarm);
        if from == to {
            return;
        }
        info!(?from, ?to, "system state changed");
        self.bus.publish_to(
            Topic::Safety,
            Event::new(SOURCE, EventPayload::SystemStateChanged { from, to }),
        );
    }
}

/// The governor.  Cheap to share behind an `Arc`.
pub struct SafetyPipeline {
    shared: Arc<Shared>,
    ops: mpsc::UnboundedSender<SafetyOperation>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    listener: ListenerId,
}

impl SafetyPipeline {
    /// Register with the isolator and start the worker on the current
    /// runtime.
    pub fn spawn(
        isolator: Arc<dyn SafetyIsolator>,
        fleet: Arc<dyn FleetControl>,
        bus: EventBus,
        config: SafetyPipelineConfig,
    ) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            isolator: Arc::clone(&isolator),
            system_state: AtomicU8::new(SystemState::Ready as u8),
            bus,
            state_tx: broadcast::channel(64).0,
        });

        let listener_ops = ops.clone();
        let listener = isolator.add_listener(Arc::new(move |change| {
            if listener_ops.send(SafetyOperation::StateChanged(change)).is_err() {
                error!("safety pipeline gone, isolator transition not processed");
            }
        }));

        let cancel = CancellationToken::new();
        let worker = Worker {
            shared: Arc::clone(&shared),
            fleet,
            config,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));
        Self {
            shared,
            ops,
            cancel,
            worker: Mutex::new(Some(handle)),
            listener,
        }
    }

    fn enqueue(&self, op: SafetyOperation) -> bool {
        match self.ops.send(op) {
            Ok(()) => true,
            Err(mpsc::error::SendError(op)) => {
                error!(?op, "safety operation lost: pipeline is shut down");
                false
            }
        }
    }

    fn command(&self, command: SafetyCommand, kind: SafetyTriggerKind, reason: &str, triggered_by_io: bool) {
        self.enqueue(SafetyOperation::Command {
            command,
            kind,
            reason: reason.to_string(),
            triggered_by_io,
        });
    }

    pub fn request_start(&self, kind: SafetyTriggerKind, reason: &str, triggered_by_io: bool) {
        self.command(SafetyCommand::Start, kind, reason, triggered_by_io);
    }

    pub fn request_stop(&self, kind: SafetyTriggerKind, reason: &str, triggered_by_io: bool) {
        self.command(SafetyCommand::Stop, kind, reason, triggered_by_io);
    }

    pub fn request_reset(&self, kind: SafetyTriggerKind, reason: &str, triggered_by_io: bool) {
        self.command(SafetyCommand::Reset, kind, reason, triggered_by_io);
    }

    /// Feed an axis health trigger (`AxisFault` or `AxisDisconnected`).
    pub fn report_axis_health(&self, kind: SafetyTriggerKind, axis: Option<AxisId>, reason: &str) {
        self.enqueue(SafetyOperation::AxisHealth {
            kind,
            axis,
            reason: reason.to_string(),
        });
    }

    /// Route drive faults and disconnects from `aggregator` into the queue.
    pub fn attach_axis_events(&self, aggregator: &AxisEventAggregator) -> SubscriberId {
        let ops = self.ops.clone();
        aggregator.subscribe(Arc::new(move |event| {
            let op = match event {
                AxisEvent::Faulted { axis, reason, .. } => SafetyOperation::AxisHealth {
                    kind: SafetyTriggerKind::AxisFault,
                    axis: Some(axis),
                    reason,
                },
                AxisEvent::Disconnected { axis, reason } => SafetyOperation::AxisHealth {
                    kind: SafetyTriggerKind::AxisDisconnected,
                    axis: Some(axis),
                    reason,
                },
                _ => return,
            };
            if ops.send(op).is_err() {
                error!("safety operation lost: pipeline is shut down");
            }
        }))
    }

    pub fn system_state(&self) -> SystemState {
        self.shared.system_state()
    }

    /// Wait until every operation enqueued before this call has been applied.
    pub async fn barrier(&self) {
        let (reply, done) = oneshot::channel();
        if self.enqueue(SafetyOperation::Barrier { reply }) {
            let _ = done.await;
        }
    }

    /// Stop the worker and detach from the isolator.  Operations still queued
    /// are dropped.
    pub async fn shutdown(&self) {
        self.shared.isolator.remove_listener(self.listener);
        self.cancel.cancel();
        let Some(mut handle) = self.worker.lock().take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => debug!("safety pipeline stopped"),
            Ok(Err(err)) => error!(error = %err, "safety pipeline worker ended abnormally"),
            Err(_) => {
                warn!("safety pipeline did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for SafetyPipeline {
    fn drop(&mut self) {
        self.shared.isolator.remove_listener(self.listener);
        self.cancel.cancel();
    }
}

#[async_trait]
impl SafetyGovernor for SafetyPipeline {
    fn safety_state(&self) -> SafetyIsolationState {
        self.shared.isolator.state()
    }

    async fn try_enter_degraded(&self, kind: SafetyTriggerKind, reason: String) -> bool {
        let (reply, answer) = oneshot::channel();
        self.enqueue(SafetyOperation::Degrade { kind, reason, reply }) && answer.await.unwrap_or(false)
    }

    async fn try_recover_from_degraded(&self, reason: String) -> bool {
        let (reply, answer) = oneshot::channel();
        self.enqueue(SafetyOperation::Recover { reason, reply }) && answer.await.unwrap_or(false)
    }

    fn subscribe_state(&self) -> broadcast::Receiver<SafetyStateChange> {
        self.shared.state_tx.subscribe()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Worker
// ────────────────────────────────────────────────────────────────────────────

struct Worker {
    shared: Arc<Shared>,
    fleet: Arc<dyn FleetControl>,
    config: SafetyPipelineConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<SafetyOperation>) {
        info!("safety pipeline started");
        loop {
            let op = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                op = rx.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };
            self.apply(op).await;
        }
    }

    async fn apply(&self, op: SafetyOperation) {
        match op {
            SafetyOperation::StateChanged(change) => self.on_state_changed(change).await,
            SafetyOperation::Command {
                command,
                kind,
                reason,
                triggered_by_io,
            } => {
                self.shared.bus.publish_to(
                    Topic::Commands,
                    Event::new(
                        SOURCE,
                        EventPayload::CommandRequested {
                            command,
                            kind,
                            reason: reason.clone(),
                            triggered_by_io,
                        },
                    ),
                );
                match command {
                    SafetyCommand::Start => self.on_start(kind, &reason).await,
                    SafetyCommand::Stop => self.on_stop(kind, &reason).await,
                    SafetyCommand::Reset => self.on_reset(&reason).await,
                }
            }
            SafetyOperation::AxisHealth { kind, axis, reason } => self.on_axis_health(kind, axis, &reason),
            SafetyOperation::Degrade { kind, reason, reply } => {
                let _ = reply.send(self.shared.isolator.try_enter_degraded(kind, &reason));
            }
            SafetyOperation::Recover { reason, reply } => {
                let _ = reply.send(self.shared.isolator.try_recover_from_degraded(&reason));
            }
            SafetyOperation::Barrier { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn log_outcome(op: &str, outcome: &FleetOutcome) {
        for (axis, err) in &outcome.failures {
            warn!(op, %axis, error = %err, "fleet command failed on axis");
        }
    }

    /// Zero speed, stop, disable.  Safe to repeat.
    async fn fail_safe(&self) {
        let c = &self.cancel;
        Self::log_outcome("write_speed_all", &self.fleet.write_speed_all(0.0, c).await);
        Self::log_outcome("stop_all", &self.fleet.stop_all(c).await);
        Self::log_outcome("disable_all", &self.fleet.disable_all(c).await);
    }

    /// Zero speed and disable.
    async fn halt(&self) {
        let c = &self.cancel;
        Self::log_outcome("write_speed_all", &self.fleet.write_speed_all(0.0, c).await);
        Self::log_outcome("disable_all", &self.fleet.disable_all(c).await);
    }

    async fn on_state_changed(&self, change: SafetyStateChange) {
        let to = change.to;
        let _ = self.shared.state_tx.send(change.clone());
        self.shared
            .bus
            .publish_to(Topic::Safety, Event::new(SOURCE, EventPayload::SafetyStateChanged(change)));

        // A later operation may already have moved the isolator on (a Reset
        // queued ahead of this notification). Only react to the live state.
        let live = self.shared.isolator.state();
        if live != to {
            debug!(?to, ?live, "stale isolator notification, reaction skipped");
            return;
        }

        match to {
            SafetyIsolationState::Isolated => {
                self.fail_safe().await;
                self.shared.set_system_state(SystemState::Alarm);
            }
            SafetyIsolationState::Degraded => {
                self.fail_safe().await;
                if self.shared.system_state() == SystemState::Running {
                    self.shared.set_system_state(SystemState::Stopped);
                }
            }
            SafetyIsolationState::Normal => {}
        }
    }

    async fn on_start(&self, kind: SafetyTriggerKind, reason: &str) {
        let current = self.shared.system_state();
        if matches!(current, SystemState::Running | SystemState::Alarm) {
            info!(?current, ?kind, "start ignored");
            return;
        }
        if self.shared.isolator.is_isolated() {
            warn!(?kind, reason, "start refused: safety isolation active");
            return;
        }

        let enabled = self.fleet.enable_all(&self.cancel).await;
        if !enabled.is_ok() {
            Self::log_outcome("enable_all", &enabled);
            warn!(failed = enabled.failures.len(), "start refused: axes failed to enable");
            Self::log_outcome("disable_all", &self.fleet.disable_all(&self.cancel).await);
            return;
        }
        if self.config.control_mode == ControlMode::Local {
            let written = self.fleet.write_speed_all(self.config.local_rpm, &self.cancel).await;
            Self::log_outcome("write_speed_all", &written);
        }
        self.shared.set_system_state(SystemState::Running);
        info!(?kind, reason, mode = ?self.config.control_mode, "machine started");
    }

    async fn on_stop(&self, kind: SafetyTriggerKind, reason: &str) {
        if kind == SafetyTriggerKind::EmergencyStop {
            warn!(reason, "emergency stop");
            self.fail_safe().await;
            self.shared.set_system_state(SystemState::Alarm);
            return;
        }
        let current = self.shared.system_state();
        if matches!(current, SystemState::Stopped | SystemState::Ready) {
            debug!(?current, ?kind, "stop ignored, machine already stopped");
            return;
        }
        self.halt().await;
        if !self.shared.isolator.try_enter_degraded(kind, reason) {
            debug!(?kind, "isolator already in a stricter state");
        }
        // Alarm stays visible until an explicit reset.
        if current == SystemState::Running {
            self.shared.set_system_state(SystemState::Stopped);
        }
        info!(?kind, reason, "machine stopped");
    }

    async fn on_reset(&self, reason: &str) {
        self.halt().await;
        if let Err(err) = self.fleet.reset(&self.cancel).await {
            warn!(error = %err, "bus reset failed");
        }
        let isolator = &self.shared.isolator;
        match isolator.state() {
            SafetyIsolationState::Isolated => {
                isolator.try_reset_isolation(reason);
            }
            SafetyIsolationState::Degraded => {
                isolator.try_recover_from_degraded(reason);
            }
            SafetyIsolationState::Normal => {}
        }
        self.shared.set_system_state(SystemState::Ready);
        info!(reason, "machine reset");
    }

    fn on_axis_health(&self, kind: SafetyTriggerKind, axis: Option<AxisId>, reason: &str) {
        let axis_label = axis.map(|a| a.to_string()).unwrap_or_else(|| "fleet".to_string());
        let accepted = match kind {
            SafetyTriggerKind::AxisDisconnected => self.shared.isolator.try_trip(kind, reason),
            _ => self.shared.isolator.try_enter_degraded(kind, reason),
        };
        if accepted {
            warn!(axis = %axis_label, ?kind, reason, "axis health escalated");
        } else {
            debug!(axis = %axis_label, ?kind, "axis health trigger absorbed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolator::InMemoryIsolator;
    use crate::testing::{Call, RecordingFleet};

    struct Harness {
        isolator: Arc<InMemoryIsolator>,
        fleet: Arc<RecordingFleet>,
        pipeline: SafetyPipeline,
        bus: EventBus,
    }

    fn harness(config: SafetyPipelineConfig) -> Harness {
        let isolator = Arc::new(InMemoryIsolator::new());
        let fleet = Arc::new(RecordingFleet::default());
        let bus = EventBus::default();
        let pipeline = SafetyPipeline::spawn(
            Arc::clone(&isolator) as Arc<dyn SafetyIsolator>,
            Arc::clone(&fleet) as Arc<dyn FleetControl>,
            bus.clone(),
            config,
        );
        Harness {
            isolator,
            fleet,
            pipeline,
            bus,
        }
    }

    const FAIL_SAFE: [Call; 3] = [Call::WriteSpeed(0.0), Call::Stop, Call::Disable];

    /// Two barriers: an accepted isolator transition enqueues its reaction
    /// while the first barrier is already waiting in the queue.
    async fn settle(pipeline: &SafetyPipeline) {
        pipeline.barrier().await;
        pipeline.barrier().await;
    }

    #[tokio::test]
    async fn start_enables_and_runs() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline.request_start(SafetyTriggerKind::RemoteCommand, "api", false);
        h.pipeline.barrier().await;

        assert_eq!(h.fleet.take(), vec![Call::Enable]);
        assert_eq!(h.pipeline.system_state(), SystemState::Running);
    }

    #[tokio::test]
    async fn start_while_running_makes_no_axis_calls() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline.request_start(SafetyTriggerKind::RemoteCommand, "api", false);
        h.pipeline.barrier().await;
        h.fleet.take();

        h.pipeline.request_start(SafetyTriggerKind::StartButton, "button", true);
        h.pipeline.barrier().await;

        assert!(h.fleet.take().is_empty());
        assert_eq!(h.pipeline.system_state(), SystemState::Running);
    }

    #[tokio::test]
    async fn local_mode_writes_fixed_speed() {
        let h = harness(SafetyPipelineConfig {
            control_mode: ControlMode::Local,
            local_rpm: 250.0,
        });
        h.pipeline.request_start(SafetyTriggerKind::StartButton, "button", true);
        h.pipeline.barrier().await;

        assert_eq!(h.fleet.take(), vec![Call::Enable, Call::WriteSpeed(250.0)]);
    }

    #[tokio::test]
    async fn start_refused_while_isolated() {
        let h = harness(SafetyPipelineConfig::default());
        h.isolator.try_trip(SafetyTriggerKind::AxisDisconnected, "axis-0 lost");
        h.pipeline.request_start(SafetyTriggerKind::RemoteCommand, "api", false);
        h.pipeline.barrier().await;

        assert!(!h.fleet.take().contains(&Call::Enable));
        assert_eq!(h.pipeline.system_state(), SystemState::Alarm);
    }

    #[tokio::test]
    async fn start_refused_when_an_axis_fails_to_enable() {
        let h = harness(SafetyPipelineConfig::default());
        h.fleet.fail_enable(true);
        h.pipeline.request_start(SafetyTriggerKind::RemoteCommand, "api", false);
        h.pipeline.barrier().await;

        assert_eq!(h.fleet.take(), vec![Call::Enable, Call::Disable]);
        assert_eq!(h.pipeline.system_state(), SystemState::Ready);
    }

    #[tokio::test]
    async fn emergency_stop_fails_safe_into_alarm_and_reset_recovers() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline.request_start(SafetyTriggerKind::RemoteCommand, "api", false);
        h.pipeline
            .request_stop(SafetyTriggerKind::EmergencyStop, "mushroom button", true);
        h.pipeline.barrier().await;

        let calls = h.fleet.take();
        assert_eq!(&calls[1..], &FAIL_SAFE);
        assert_eq!(h.pipeline.system_state(), SystemState::Alarm);

        h.pipeline.request_reset(SafetyTriggerKind::ResetButton, "operator", true);
        h.pipeline.barrier().await;
        assert_eq!(
            h.fleet.take(),
            vec![Call::WriteSpeed(0.0), Call::Disable, Call::Reset]
        );
        assert_eq!(h.pipeline.system_state(), SystemState::Ready);
    }

    #[tokio::test]
    async fn normal_stop_degrades_and_reset_recovers() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline.request_start(SafetyTriggerKind::RemoteCommand, "api", false);
        h.pipeline.request_stop(SafetyTriggerKind::StopButton, "button", true);
        h.pipeline.barrier().await;

        assert_eq!(h.isolator.state(), SafetyIsolationState::Degraded);
        assert_eq!(h.pipeline.system_state(), SystemState::Stopped);

        h.pipeline.request_reset(SafetyTriggerKind::ResetButton, "operator", true);
        h.pipeline.barrier().await;
        assert_eq!(h.isolator.state(), SafetyIsolationState::Normal);
        assert_eq!(h.pipeline.system_state(), SystemState::Ready);
    }

    #[tokio::test]
    async fn stop_while_ready_is_a_no_op() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline.request_stop(SafetyTriggerKind::RemoteCommand, "api", false);
        h.pipeline.barrier().await;

        assert!(h.fleet.take().is_empty());
        assert_eq!(h.isolator.state(), SafetyIsolationState::Normal);
        assert_eq!(h.pipeline.system_state(), SystemState::Ready);
    }

    #[tokio::test]
    async fn disconnect_isolates_and_fault_degrades() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline
            .report_axis_health(SafetyTriggerKind::AxisFault, Some(AxisId(1)), "overcurrent");
        settle(&h.pipeline).await;
        assert_eq!(h.isolator.state(), SafetyIsolationState::Degraded);
        assert_eq!(h.fleet.take(), FAIL_SAFE.to_vec());

        h.pipeline
            .report_axis_health(SafetyTriggerKind::AxisDisconnected, Some(AxisId(2)), "link lost");
        settle(&h.pipeline).await;
        assert_eq!(h.isolator.state(), SafetyIsolationState::Isolated);
        assert_eq!(h.pipeline.system_state(), SystemState::Alarm);

        // already isolated: a further fault is absorbed
        h.fleet.take();
        h.pipeline
            .report_axis_health(SafetyTriggerKind::AxisFault, Some(AxisId(1)), "again");
        settle(&h.pipeline).await;
        assert!(h.fleet.take().is_empty());
    }

    #[tokio::test]
    async fn reset_queued_behind_a_trip_leaves_the_machine_startable() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline
            .report_axis_health(SafetyTriggerKind::AxisDisconnected, Some(AxisId(0)), "link lost");
        h.pipeline.request_reset(SafetyTriggerKind::ResetButton, "operator", true);
        settle(&h.pipeline).await;

        assert_eq!(h.isolator.state(), SafetyIsolationState::Normal);
        assert_eq!(h.pipeline.system_state(), SystemState::Ready);

        h.fleet.take();
        h.pipeline.request_start(SafetyTriggerKind::RemoteCommand, "api", false);
        h.pipeline.barrier().await;
        assert_eq!(h.fleet.take(), vec![Call::Enable]);
        assert_eq!(h.pipeline.system_state(), SystemState::Running);
    }

    #[tokio::test]
    async fn stop_during_alarm_still_halts_the_axes() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline
            .request_stop(SafetyTriggerKind::EmergencyStop, "mushroom button", true);
        h.pipeline.barrier().await;
        assert_eq!(h.pipeline.system_state(), SystemState::Alarm);
        h.fleet.take();

        h.pipeline.request_stop(SafetyTriggerKind::RemoteCommand, "api", false);
        settle(&h.pipeline).await;

        let calls = h.fleet.take();
        assert_eq!(&calls[..2], &[Call::WriteSpeed(0.0), Call::Disable]);
        assert_eq!(h.isolator.state(), SafetyIsolationState::Degraded);
        assert_eq!(h.pipeline.system_state(), SystemState::Alarm);
    }

    #[tokio::test]
    async fn degrading_while_running_shows_stopped() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline.request_start(SafetyTriggerKind::RemoteCommand, "api", false);
        h.pipeline.barrier().await;

        assert!(
            h.pipeline
                .try_enter_degraded(SafetyTriggerKind::HeartbeatTimeout, "heartbeat timeout".into())
                .await
        );
        h.pipeline.barrier().await;
        assert_eq!(h.pipeline.system_state(), SystemState::Stopped);
        assert!(
            !h.pipeline
                .try_enter_degraded(SafetyTriggerKind::HeartbeatTimeout, "again".into())
                .await
        );
        assert!(h.pipeline.try_recover_from_degraded("heartbeat restored".into()).await);
        assert_eq!(h.pipeline.safety_state(), SafetyIsolationState::Normal);
    }

    #[tokio::test]
    async fn state_changes_are_rebroadcast() {
        let h = harness(SafetyPipelineConfig::default());
        let mut states = h.pipeline.subscribe_state();
        let mut safety = h.bus.subscribe_to(Topic::Safety);

        h.isolator.try_trip(SafetyTriggerKind::EmergencyStop, "test");
        h.pipeline.barrier().await;

        let change = states.recv().await.unwrap();
        assert_eq!(change.to, SafetyIsolationState::Isolated);
        let first = safety.recv().await.unwrap();
        assert!(matches!(first.payload, EventPayload::SafetyStateChanged(_)));
        let second = safety.recv().await.unwrap();
        assert!(matches!(
            second.payload,
            EventPayload::SystemStateChanged {
                to: SystemState::Alarm,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn commands_are_announced_on_the_bus() {
        let h = harness(SafetyPipelineConfig::default());
        let mut commands = h.bus.subscribe_to(Topic::Commands);
        h.pipeline.request_reset(SafetyTriggerKind::ResetButton, "panel", true);
        h.pipeline.barrier().await;

        let event = commands.recv().await.unwrap();
        match event.payload {
            EventPayload::CommandRequested {
                command,
                triggered_by_io,
                ..
            } => {
                assert_eq!(command, SafetyCommand::Reset);
                assert!(triggered_by_io);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_keep_their_own_order() {
        let isolator = Arc::new(crate::testing::ReasonLog::default());
        let pipeline = Arc::new(SafetyPipeline::spawn(
            Arc::clone(&isolator) as Arc<dyn SafetyIsolator>,
            Arc::new(RecordingFleet::default()),
            EventBus::default(),
            SafetyPipelineConfig::default(),
        ));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    for i in 0..50 {
                        pipeline.report_axis_health(SafetyTriggerKind::AxisFault, None, &format!("{p}:{i}"));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        pipeline.barrier().await;

        let seen = isolator.reasons();
        assert_eq!(seen.len(), 200);
        for p in 0..4 {
            let own: Vec<usize> = seen
                .iter()
                .filter_map(|r| r.strip_prefix(&format!("{p}:")))
                .map(|i| i.parse().unwrap())
                .collect();
            assert_eq!(own, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn axis_events_feed_the_pipeline() {
        let h = harness(SafetyPipelineConfig::default());
        let aggregator = AxisEventAggregator::new();
        h.pipeline.attach_axis_events(&aggregator);

        aggregator.publish(AxisEvent::Disconnected {
            axis: AxisId(0),
            reason: "cable".into(),
        });

        for _ in 0..200 {
            if h.isolator.is_isolated() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.isolator.is_isolated());
    }

    #[tokio::test]
    async fn shutdown_detaches_from_isolator() {
        let h = harness(SafetyPipelineConfig::default());
        h.pipeline.shutdown().await;
        h.pipeline.shutdown().await;

        h.isolator.try_trip(SafetyTriggerKind::RemoteCommand, "after shutdown");
        h.pipeline.request_start(SafetyTriggerKind::RemoteCommand, "api", false);
        assert!(h.fleet.take().is_empty());
        assert_eq!(h.pipeline.system_state(), SystemState::Ready);
    }
}
