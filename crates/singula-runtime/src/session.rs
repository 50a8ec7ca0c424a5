//! [`SingulationSession`] – one running singulation cell.
//!
//! Opening a session wires every component together in dependency order:
//!
//! 1. event bus, frame hub and axis event aggregator
//! 2. [`AxisController`], initialized against the bus adapter
//! 3. [`InMemoryIsolator`] and the [`SafetyPipeline`] governing the fleet
//! 4. [`FrameGuard`], subscribed to upstream heartbeats
//! 5. optionally an [`IoButtonMonitor`] on the panel inputs
//!
//! Axis events are forwarded onto [`Topic::Axis`] so hosts can observe the
//! drives without touching the HAL.

use std::sync::Arc;
use std::time::Duration;

use singula_hal::{
    AxisController, AxisEventAggregator, BusAdapter, DriveRegistry, FleetControl, SubscriberId,
};
use singula_kernel::{
    FrameGuard, FrameGuardConfig, FrameGuardMetrics, InMemoryIsolator, IoButtonMap, IoButtonMonitor,
    IoInputs, SafetyGovernor, SafetyIsolator, SafetyPipeline, SafetyPipelineConfig,
};
use singula_middleware::{EventBus, FrameHub, Topic};
use singula_types::{
    ControlMode, DriverOptions, Event, EventPayload, FrameGuardDecision, SafetyIsolationState,
    SafetyTriggerKind, SingulaError, SpeedSet, SystemState,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const AXIS_SOURCE: &str = "singula-hal::aggregator";

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub vendor: String,
    /// Use this many axes instead of asking the bus.
    pub axis_count: Option<i32>,
    /// Axes fed from the `main` part of a frame; the `eject` part follows.
    /// `0` means frames are written as `main` then `eject` with no padding.
    pub main_axes: usize,
    pub eject_axes: usize,
    pub driver: DriverOptions,
    pub control_mode: ControlMode,
    pub local_rpm: f64,
    pub frame_guard: FrameGuardConfig,
    pub io_buttons: Option<IoButtonMap>,
    pub io_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor: singula_hal::sim::SIM_VENDOR.to_string(),
            axis_count: None,
            main_axes: 0,
            eject_axes: 0,
            driver: DriverOptions::default(),
            control_mode: ControlMode::Remote,
            local_rpm: 0.0,
            frame_guard: FrameGuardConfig::default(),
            io_buttons: None,
            io_poll: Duration::from_millis(20),
        }
    }
}

impl SessionConfig {
    /// Lay a frame out as one target per axis.
    fn axis_targets(&self, set: &SpeedSet) -> Vec<f64> {
        let mut targets: Vec<f64> = set.main.iter().map(|&v| f64::from(v)).collect();
        if self.main_axes > 0 {
            targets.resize(self.main_axes, 0.0);
        }
        let eject = set.eject.iter().map(|&v| f64::from(v));
        if self.eject_axes > 0 {
            targets.extend(eject.chain(std::iter::repeat(0.0)).take(self.eject_axes));
        } else {
            targets.extend(eject);
        }
        targets
    }
}

pub struct SingulationSession {
    config: SessionConfig,
    events: EventBus,
    frames: FrameHub,
    controller: Arc<AxisController>,
    isolator: Arc<InMemoryIsolator>,
    pipeline: Arc<SafetyPipeline>,
    guard: FrameGuard,
    io: Option<IoButtonMonitor>,
    forwarder: SubscriberId,
    cancel: CancellationToken,
}

impl SingulationSession {
    /// Build and start a session on `bus`.
    ///
    /// # Errors
    ///
    /// Bus I/O errors during fleet initialization.  Configuration problems
    /// are raised as controller faults on [`Topic::Axis`] and leave the
    /// session open with zero axes.
    pub async fn open(
        config: SessionConfig,
        bus: Arc<dyn BusAdapter>,
        registry: DriveRegistry,
        io: Option<Arc<dyn IoInputs>>,
    ) -> Result<Self, SingulaError> {
        let events = EventBus::default();
        let frames = FrameHub::new();
        let aggregator = AxisEventAggregator::new();

        let forward_to = events.clone();
        let forwarder = aggregator.subscribe(Arc::new(move |event| {
            forward_to.publish_to(Topic::Axis, Event::new(AXIS_SOURCE, EventPayload::Axis(event)));
        }));

        let cancel = CancellationToken::new();
        let controller = Arc::new(AxisController::new(bus, registry, aggregator.clone()));
        let axes = controller
            .initialize(&config.vendor, &config.driver, config.axis_count, &cancel)
            .await?;
        if axes == 0 {
            warn!(vendor = %config.vendor, "session opened without axes");
        }

        let isolator = Arc::new(InMemoryIsolator::new());
        let pipeline = Arc::new(SafetyPipeline::spawn(
            Arc::clone(&isolator) as Arc<dyn SafetyIsolator>,
            Arc::clone(&controller) as Arc<dyn FleetControl>,
            events.clone(),
            SafetyPipelineConfig {
                control_mode: config.control_mode,
                local_rpm: config.local_rpm,
            },
        ));
        pipeline.attach_axis_events(&aggregator);

        let guard = FrameGuard::new(
            config.frame_guard.clone(),
            Arc::clone(&pipeline) as Arc<dyn SafetyGovernor>,
        );
        guard.start(&frames);

        let io = match (io, &config.io_buttons) {
            (Some(inputs), Some(map)) => Some(IoButtonMonitor::spawn(
                inputs,
                map.clone(),
                config.io_poll,
                Arc::clone(&pipeline),
            )),
            (Some(_), None) => {
                warn!("io inputs given without a button map, panel ignored");
                None
            }
            _ => None,
        };

        info!(axes, mode = ?config.control_mode, "singulation session open");
        Ok(Self {
            config,
            events,
            frames,
            controller,
            isolator,
            pipeline,
            guard,
            io,
            forwarder,
            cancel,
        })
    }

    /// Admit one upstream frame and, when the machine is running remotely,
    /// queue its speeds on the axes.
    pub fn submit_frame(&self, set: SpeedSet) -> FrameGuardDecision {
        let decision = self.guard.evaluate(set);
        if !decision.accepted {
            return decision;
        }
        let state = self.pipeline.system_state();
        if state != SystemState::Running || self.config.control_mode != ControlMode::Remote {
            debug!(?state, sequence = decision.effective_set.sequence, "frame admitted but not written");
            return decision;
        }
        let targets = self.config.axis_targets(&decision.effective_set);
        self.controller.enqueue_speeds(&targets);
        decision
    }

    /// Forward one upstream heartbeat frame to the guard.
    pub fn heartbeat(&self, payload: &[u8]) -> usize {
        self.frames.publish_heartbeat(payload)
    }

    pub fn start(&self, reason: &str) {
        self.pipeline.request_start(SafetyTriggerKind::RemoteCommand, reason, false);
    }

    pub fn stop(&self, reason: &str) {
        self.pipeline.request_stop(SafetyTriggerKind::RemoteCommand, reason, false);
    }

    pub fn emergency_stop(&self, reason: &str) {
        self.pipeline.request_stop(SafetyTriggerKind::EmergencyStop, reason, false);
    }

    pub fn reset(&self, reason: &str) {
        self.pipeline.request_reset(SafetyTriggerKind::RemoteCommand, reason, false);
    }

    /// Wait until every command issued so far has been applied and the
    /// axis queues are drained.
    pub async fn settle(&self) {
        // The second barrier covers reactions to isolator transitions that
        // were enqueued while the first one was waiting.
        self.pipeline.barrier().await;
        self.pipeline.barrier().await;
        self.controller.flush_queues().await;
    }

    pub fn system_state(&self) -> SystemState {
        self.pipeline.system_state()
    }

    pub fn safety_state(&self) -> SafetyIsolationState {
        self.isolator.state()
    }

    pub fn frame_metrics(&self) -> FrameGuardMetrics {
        self.guard.metrics()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn frame_hub(&self) -> &FrameHub {
        &self.frames
    }

    pub fn controller(&self) -> &Arc<AxisController> {
        &self.controller
    }

    pub fn pipeline(&self) -> &Arc<SafetyPipeline> {
        &self.pipeline
    }

    /// Stop the guard, the panel monitor and the governor, then dispose the
    /// fleet and close the bus.
    ///
    /// # Errors
    ///
    /// The bus close error, if any.
    pub async fn shutdown(self) -> Result<(), SingulaError> {
        self.cancel.cancel();
        self.guard.shutdown().await;
        if let Some(io) = &self.io {
            io.shutdown().await;
        }
        self.pipeline.shutdown().await;
        self.controller.aggregator().unsubscribe(self.forwarder);
        let result = self.controller.dispose_all().await;
        info!("singulation session closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn frame(main: Vec<i32>, eject: Vec<i32>) -> SpeedSet {
        SpeedSet {
            timestamp: Utc::now(),
            sequence: 1,
            main,
            eject,
        }
    }

    #[test]
    fn targets_concatenate_without_layout() {
        let config = SessionConfig::default();
        assert_eq!(
            config.axis_targets(&frame(vec![100, 200], vec![50])),
            vec![100.0, 200.0, 50.0]
        );
    }

    #[test]
    fn targets_follow_axis_layout() {
        let config = SessionConfig {
            main_axes: 3,
            eject_axes: 2,
            ..SessionConfig::default()
        };
        assert_eq!(
            config.axis_targets(&frame(vec![100, 200], vec![50, 60, 70])),
            vec![100.0, 200.0, 0.0, 50.0, 60.0]
        );
        assert_eq!(
            config.axis_targets(&frame(vec![1, 2, 3, 4], vec![])),
            vec![1.0, 2.0, 3.0, 0.0, 0.0]
        );
    }
}
