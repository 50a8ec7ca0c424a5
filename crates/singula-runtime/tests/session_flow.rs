//! End-to-end session behaviour on the simulated bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use singula_hal::{BusAdapter, DriveRegistry, SimBus};
use singula_kernel::FrameGuardConfig;
use singula_middleware::Topic;
use singula_runtime::{SessionConfig, SingulationSession};
use singula_types::{AxisEvent, EventPayload, RejectReason, SafetyIsolationState, SpeedSet, SystemState};

fn frame(sequence: i64, main: Vec<i32>) -> SpeedSet {
    SpeedSet {
        timestamp: Utc::now(),
        sequence,
        main,
        eject: Vec::new(),
    }
}

fn quiet_upstream() -> SessionConfig {
    SessionConfig {
        frame_guard: FrameGuardConfig {
            heartbeat_timeout: Duration::from_secs(60),
            ..FrameGuardConfig::default()
        },
        ..SessionConfig::default()
    }
}

async fn open(config: SessionConfig, bus: &Arc<SimBus>) -> SingulationSession {
    SingulationSession::open(
        config,
        Arc::clone(bus) as Arc<dyn BusAdapter>,
        DriveRegistry::with_builtin(),
        None,
    )
    .await
    .expect("session opens")
}

async fn wait_for(session: &SingulationSession, state: SystemState) {
    for _ in 0..250 {
        if session.system_state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("system state stuck at {:?}, wanted {state:?}", session.system_state());
}

#[tokio::test]
async fn frames_reach_the_axes_only_while_running() {
    let bus = Arc::new(SimBus::new(2).with_reversed(2));
    let session = open(quiet_upstream(), &bus).await;
    let (left, right) = (bus.port(1).unwrap(), bus.port(2).unwrap());

    let early = session.submit_frame(frame(1, vec![100, 200]));
    assert!(early.accepted);
    session.settle().await;
    assert!(left.speeds().is_empty());

    session.start("test");
    session.settle().await;
    assert_eq!(session.system_state(), SystemState::Running);

    let decision = session.submit_frame(frame(2, vec![100, 200]));
    assert!(decision.accepted && !decision.degraded);
    session.settle().await;
    assert_eq!(left.speeds(), vec![100]);
    assert_eq!(right.speeds(), vec![-200]);

    let replay = session.submit_frame(frame(2, vec![900, 900]));
    assert!(!replay.accepted);
    assert_eq!(replay.reason, Some(RejectReason::Duplicate));
    assert_eq!(session.frame_metrics().rejected_duplicate, 1);

    session.shutdown().await.unwrap();
    assert_eq!(bus.close_count(), 1);
    assert_eq!(left.close_count(), 1);
}

#[tokio::test]
async fn restart_while_degraded_scales_frames() {
    let bus = Arc::new(SimBus::new(2));
    let session = open(quiet_upstream(), &bus).await;

    session.start("test");
    session.stop("operator");
    session.settle().await;
    assert_eq!(session.safety_state(), SafetyIsolationState::Degraded);
    assert_eq!(session.system_state(), SystemState::Stopped);

    session.start("resume");
    session.settle().await;
    assert_eq!(session.system_state(), SystemState::Running);

    let decision = session.submit_frame(frame(7, vec![1000, 500]));
    assert!(decision.degraded);
    assert_eq!(decision.effective_set.main, vec![300, 150]);
    session.settle().await;
    assert_eq!(bus.port(1).unwrap().speeds().last(), Some(&300));
    assert_eq!(bus.port(2).unwrap().speeds().last(), Some(&150));

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lost_axis_isolates_the_cell_until_reset() {
    let bus = Arc::new(SimBus::new(2));
    let session = open(quiet_upstream(), &bus).await;
    let mut axis_events = session.events().subscribe_to(Topic::Axis);
    let lost = bus.port(2).unwrap();
    lost.set_offline(true);

    session.start("test");
    wait_for(&session, SystemState::Alarm).await;
    assert_eq!(session.safety_state(), SafetyIsolationState::Isolated);

    let mut saw_disconnect = false;
    while let Ok(event) = axis_events.try_recv() {
        if let EventPayload::Axis(AxisEvent::Disconnected { axis, .. }) = event.payload {
            assert_eq!(axis.0, 1);
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);

    let refused = session.submit_frame(frame(1, vec![100, 100]));
    assert_eq!(refused.reason, Some(RejectReason::Isolated));

    lost.set_offline(false);
    session.reset("cable replaced");
    session.settle().await;
    assert_eq!(session.system_state(), SystemState::Ready);
    assert_eq!(session.safety_state(), SafetyIsolationState::Normal);
    assert_eq!(bus.reset_count(), 1);

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_upstream_stops_the_cell_and_heartbeat_recovers() {
    let bus = Arc::new(SimBus::new(1));
    let config = SessionConfig {
        frame_guard: FrameGuardConfig {
            heartbeat_timeout: Duration::from_millis(500),
            watchdog_tick: Duration::from_millis(50),
            ..FrameGuardConfig::default()
        },
        ..SessionConfig::default()
    };
    let session = open(config, &bus).await;

    session.start("test");
    session.settle().await;
    assert_eq!(session.system_state(), SystemState::Running);

    wait_for(&session, SystemState::Stopped).await;
    assert_eq!(session.safety_state(), SafetyIsolationState::Degraded);

    session.heartbeat(b"hb");
    for _ in 0..50 {
        if session.safety_state() == SafetyIsolationState::Normal {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.safety_state(), SafetyIsolationState::Normal);
    assert_eq!(session.system_state(), SystemState::Stopped);

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_vendor_opens_an_empty_session() {
    let bus = Arc::new(SimBus::new(2));
    let config = SessionConfig {
        vendor: "acme".into(),
        ..quiet_upstream()
    };
    let session = open(config, &bus).await;

    assert_eq!(session.controller().axis_count(), 0);
    session.shutdown().await.unwrap();
    assert_eq!(bus.close_count(), 1);
}
