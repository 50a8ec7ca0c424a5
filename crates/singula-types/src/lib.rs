use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Axis identity and tuning
// ────────────────────────────────────────────────────────────────────────────

/// Stable identity of one physical singulation axis (zero-based index on its
/// bus).  Immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AxisId(pub u16);

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "axis-{}", self.0)
    }
}

/// Per-axis tuning: rate limits, retry policy and mechanical ratios.
///
/// One instance is cloned into every drive at topology initialization and is
/// never mutated afterwards.  Call [`DriverOptions::validate`] before use.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    /// Minimum gap between two commands issued to the same axis.
    pub command_min_interval: Duration,
    /// Retries after the first failed attempt (so `max_retries + 1` attempts).
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub initial_backoff: Duration,
    /// Upper bound for the doubled backoff delay.
    pub max_backoff: Duration,
    /// Motor speed limit in rpm (applied symmetrically).
    pub max_rpm: f64,
    pub max_accel_rpm_s: f64,
    pub max_decel_rpm_s: f64,
    /// Motor revolutions per roller revolution.
    pub gear_ratio: f64,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            command_min_interval: Duration::from_millis(5),
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(1_000),
            max_rpm: 3_000.0,
            max_accel_rpm_s: 10_000.0,
            max_decel_rpm_s: 10_000.0,
            gear_ratio: 1.0,
        }
    }
}

impl DriverOptions {
    /// Check the options for values no drive can work with.
    ///
    /// # Errors
    ///
    /// Returns [`SingulaError::InvalidOptions`] naming the first bad field.
    pub fn validate(&self) -> Result<(), SingulaError> {
        if !(self.max_rpm.is_finite() && self.max_rpm > 0.0) {
            return Err(SingulaError::InvalidOptions(format!(
                "max_rpm must be positive, got {}",
                self.max_rpm
            )));
        }
        if !(self.max_accel_rpm_s.is_finite() && self.max_accel_rpm_s > 0.0) {
            return Err(SingulaError::InvalidOptions(format!(
                "max_accel_rpm_s must be positive, got {}",
                self.max_accel_rpm_s
            )));
        }
        if !(self.max_decel_rpm_s.is_finite() && self.max_decel_rpm_s > 0.0) {
            return Err(SingulaError::InvalidOptions(format!(
                "max_decel_rpm_s must be positive, got {}",
                self.max_decel_rpm_s
            )));
        }
        if !(self.gear_ratio.is_finite() && self.gear_ratio > 0.0) {
            return Err(SingulaError::InvalidOptions(format!(
                "gear_ratio must be positive, got {}",
                self.gear_ratio
            )));
        }
        if self.initial_backoff.is_zero() {
            return Err(SingulaError::InvalidOptions(
                "initial_backoff must be non-zero".to_string(),
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(SingulaError::InvalidOptions(format!(
                "max_backoff ({:?}) is below initial_backoff ({:?})",
                self.max_backoff, self.initial_backoff
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Driver connectivity state
// ────────────────────────────────────────────────────────────────────────────

/// Connectivity state of one axis driver.  `Disposed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DriverStatus {
    Disconnected = 0,
    Initializing = 1,
    Connected = 2,
    Degraded = 3,
    Recovering = 4,
    Disabled = 5,
    Faulted = 6,
    Disposed = 7,
}

impl DriverStatus {
    /// Whether the driver may move from `self` to `next`.
    ///
    /// Self-transitions are reported as not allowed; callers treat them as
    /// no-ops.
    pub fn can_transition_to(self, next: DriverStatus) -> bool {
        use DriverStatus::*;
        if self == next || self == Disposed {
            return false;
        }
        if next == Disposed {
            return true;
        }
        match self {
            Disconnected => matches!(next, Initializing | Connected | Recovering),
            Initializing => matches!(next, Connected | Recovering | Disconnected | Faulted),
            Connected => matches!(next, Recovering | Degraded | Disabled | Faulted | Disconnected),
            Degraded => matches!(
                next,
                Connected | Recovering | Disabled | Faulted | Disconnected
            ),
            Recovering => matches!(next, Connected | Disabled | Disconnected | Faulted),
            Disabled => matches!(next, Connected | Recovering | Disconnected | Faulted),
            Faulted => matches!(next, Connected | Recovering | Disabled | Disconnected),
            Disposed => false,
        }
    }

    /// Decode the `repr(u8)` discriminant stored in an atomic.
    pub fn from_u8(raw: u8) -> Option<Self> {
        use DriverStatus::*;
        Some(match raw {
            0 => Disconnected,
            1 => Initializing,
            2 => Connected,
            3 => Degraded,
            4 => Recovering,
            5 => Disabled,
            6 => Faulted,
            7 => Disposed,
            _ => return None,
        })
    }
}

/// Decoded answer to a status request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisStatusReport {
    pub axis: AxisId,
    pub enabled: bool,
    /// Measured roller speed in rpm.
    pub actual_rpm: f64,
    /// Vendor fault code, `None` when the drive reports no fault.
    pub fault_code: Option<u16>,
    /// Non-fatal warning flag (over-temperature, following error, …).
    pub warning: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Axis events
// ────────────────────────────────────────────────────────────────────────────

/// Discriminant of [`AxisEvent`], used to register one handler per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisEventKind {
    StatusChanged,
    Faulted,
    Disconnected,
    SpeedFeedback,
    ControllerFault,
}

impl AxisEventKind {
    /// Every kind a single drive can raise.
    pub const DRIVE_KINDS: [AxisEventKind; 4] = [
        AxisEventKind::StatusChanged,
        AxisEventKind::Faulted,
        AxisEventKind::Disconnected,
        AxisEventKind::SpeedFeedback,
    ];
}

/// Something a drive (or the controller that owns the drives) reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AxisEvent {
    StatusChanged {
        axis: AxisId,
        from: DriverStatus,
        to: DriverStatus,
    },
    Faulted {
        axis: AxisId,
        code: u16,
        reason: String,
    },
    Disconnected {
        axis: AxisId,
        reason: String,
    },
    SpeedFeedback {
        axis: AxisId,
        rpm: f64,
    },
    /// Non-throwing initialization failure raised by the controller.
    ControllerFault { message: String },
}

impl AxisEvent {
    pub fn kind(&self) -> AxisEventKind {
        match self {
            AxisEvent::StatusChanged { .. } => AxisEventKind::StatusChanged,
            AxisEvent::Faulted { .. } => AxisEventKind::Faulted,
            AxisEvent::Disconnected { .. } => AxisEventKind::Disconnected,
            AxisEvent::SpeedFeedback { .. } => AxisEventKind::SpeedFeedback,
            AxisEvent::ControllerFault { .. } => AxisEventKind::ControllerFault,
        }
    }

    /// The axis the event concerns, `None` for controller-wide faults.
    pub fn axis(&self) -> Option<AxisId> {
        match self {
            AxisEvent::StatusChanged { axis, .. }
            | AxisEvent::Faulted { axis, .. }
            | AxisEvent::Disconnected { axis, .. }
            | AxisEvent::SpeedFeedback { axis, .. } => Some(*axis),
            AxisEvent::ControllerFault { .. } => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Safety vocabulary
// ────────────────────────────────────────────────────────────────────────────

/// Machine-wide safety posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafetyIsolationState {
    Normal,
    /// Motion scaled down and monitored; may self-recover.
    Degraded,
    /// Motion rejected until an explicit reset.
    Isolated,
}

/// Why a safety command or transition was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafetyTriggerKind {
    EmergencyStop,
    StopButton,
    StartButton,
    ResetButton,
    RemoteCommand,
    AxisFault,
    AxisDisconnected,
    HeartbeatTimeout,
    HeartbeatRestored,
}

/// One accepted isolator transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStateChange {
    pub from: SafetyIsolationState,
    pub to: SafetyIsolationState,
    pub kind: Option<SafetyTriggerKind>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Control-plane command accepted by the safety governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafetyCommand {
    Start,
    Stop,
    Reset,
}

/// Operator-visible machine state, advanced by the safety governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemState {
    Ready = 0,
    Running = 1,
    Stopped = 2,
    Alarm = 3,
}

impl SystemState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => SystemState::Ready,
            1 => SystemState::Running,
            2 => SystemState::Stopped,
            3 => SystemState::Alarm,
            _ => return None,
        })
    }
}

/// Where the running speed comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Speeds arrive as upstream frames.
    #[default]
    Remote,
    /// A configured fixed speed is written on Start.
    Local,
}

// ────────────────────────────────────────────────────────────────────────────
// Upstream frames
// ────────────────────────────────────────────────────────────────────────────

/// One decoded upstream command batch (per-axis speed targets in rpm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedSet {
    pub timestamp: DateTime<Utc>,
    /// `<= 0` means unsequenced.
    pub sequence: i64,
    pub main: Vec<i32>,
    pub eject: Vec<i32>,
}

/// Why a frame was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    Isolated,
    Duplicate,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Isolated => "isolated",
            RejectReason::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of admitting a [`SpeedSet`].  When `accepted` is `false` the
/// effective set must not be forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameGuardDecision {
    pub accepted: bool,
    pub effective_set: SpeedSet,
    pub degraded: bool,
    pub reason: Option<RejectReason>,
}

// ────────────────────────────────────────────────────────────────────────────
// Event bus envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the in-process event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "singula-kernel::safety_pipeline"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a payload with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Axis(AxisEvent),
    SafetyStateChanged(SafetyStateChange),
    SystemStateChanged {
        from: SystemState,
        to: SystemState,
    },
    /// StartRequested / StopRequested / ResetRequested, told apart by `command`.
    CommandRequested {
        command: SafetyCommand,
        kind: SafetyTriggerKind,
        reason: String,
        triggered_by_io: bool,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type spanning transport failures, vendor protocol errors,
/// cancellation and configuration problems.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SingulaError {
    #[error("Transport error on {axis}: {details}")]
    Transport { axis: AxisId, details: String },

    #[error("Protocol error on {axis}: {details}")]
    Protocol { axis: AxisId, details: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Driver for {0} is disposed")]
    Disposed(AxisId),

    #[error("Unknown drive vendor '{0}'")]
    UnknownVendor(String),

    #[error("Invalid driver options: {0}")]
    InvalidOptions(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SingulaError {
    /// Transient link errors worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SingulaError::Transport { .. } | SingulaError::Protocol { .. }
        )
    }
}
