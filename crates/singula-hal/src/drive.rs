//! Vendor-independent axis drive.
//!
//! [`AxisDrive`] is the object-safe trait the controller and the safety layer
//! hold.  [`AxisDriveBase`] implements it once for every vendor: the vendor
//! only supplies an [`AxisProtocol`] that builds frames and parses replies.
//!
//! # Command discipline
//!
//! Every command goes through the same guard:
//!
//! 1. Refuse if the drive is disposed.
//! 2. Wait until `command_min_interval` has passed since the last *successful*
//!    command (cancellable).
//! 3. Attempt the I/O.  Transport and protocol errors are retried up to
//!    `max_retries` times with a doubling backoff capped at `max_backoff`;
//!    the drive reports `Recovering` meanwhile.
//! 4. On success the drive settles into the operation's target status; on
//!    exhaustion it drops to `Disconnected`, raises a `Disconnected` event and
//!    the last error is returned.
//!
//! Cancellation is observed while throttling, during I/O and during backoff,
//! and always surfaces as [`SingulaError::Cancelled`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use singula_types::{
    AxisEvent, AxisId, AxisStatusReport, DriverOptions, DriverStatus, SingulaError,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::DriveEvents;
use crate::port::{AxisPort, AxisProtocol};

/// Everything a drive factory needs to build one drive.
#[derive(Clone)]
pub struct DriveContext {
    pub axis: AxisId,
    pub node_id: u16,
    /// Negate commanded and measured speeds.
    pub reversed: bool,
    pub port: Arc<dyn AxisPort>,
    pub options: DriverOptions,
}

/// One physical axis.
///
/// All command methods honour `cancel`; a cancelled call returns
/// [`SingulaError::Cancelled`] and leaves the status where it was.
#[async_trait]
pub trait AxisDrive: Send + Sync {
    fn axis_id(&self) -> AxisId;
    fn node_id(&self) -> u16;
    fn vendor(&self) -> &'static str;
    fn status(&self) -> DriverStatus;

    /// Handler lists for this drive's events.
    fn events(&self) -> &DriveEvents;

    /// Bring the axis online and push the configured ramp limits.
    async fn initialize(&self, cancel: &CancellationToken) -> Result<(), SingulaError>;
    async fn enable(&self, cancel: &CancellationToken) -> Result<(), SingulaError>;
    async fn disable(&self, cancel: &CancellationToken) -> Result<(), SingulaError>;

    /// Command a roller speed in rpm.  Gear ratio, mounting direction and the
    /// motor rpm limit are applied here.
    async fn write_speed(&self, rpm: f64, cancel: &CancellationToken) -> Result<(), SingulaError>;
    async fn stop(&self, cancel: &CancellationToken) -> Result<(), SingulaError>;
    async fn home(&self, cancel: &CancellationToken) -> Result<(), SingulaError>;
    async fn set_ramp(
        &self,
        accel_rpm_s: f64,
        decel_rpm_s: f64,
        cancel: &CancellationToken,
    ) -> Result<(), SingulaError>;
    async fn read_status(&self, cancel: &CancellationToken) -> Result<AxisStatusReport, SingulaError>;

    /// Liveness probe.  Never fails: any error is reported as `false`.
    async fn ping(&self, cancel: &CancellationToken) -> bool;

    /// Release the port.  Idempotent; every later command fails with
    /// [`SingulaError::Disposed`].
    async fn dispose(&self);
}

/// Shared implementation of [`AxisDrive`] over a vendor [`AxisProtocol`].
pub struct AxisDriveBase<P: AxisProtocol> {
    protocol: P,
    axis: AxisId,
    node_id: u16,
    reversed: bool,
    port: Arc<dyn AxisPort>,
    options: DriverOptions,
    status: AtomicU8,
    epoch: Instant,
    /// Micros since `epoch` of the last successful command, plus one.
    /// Zero means nothing has been issued yet.
    last_command: AtomicU64,
    events: DriveEvents,
}

impl<P: AxisProtocol> AxisDriveBase<P> {
    /// Build a drive.  Options are validated here so a bad template fails
    /// before any I/O happens.
    pub fn new(protocol: P, ctx: DriveContext) -> Result<Self, SingulaError> {
        ctx.options.validate()?;
        Ok(Self {
            protocol,
            axis: ctx.axis,
            node_id: ctx.node_id,
            reversed: ctx.reversed,
            port: ctx.port,
            options: ctx.options,
            status: AtomicU8::new(DriverStatus::Disconnected as u8),
            epoch: Instant::now(),
            last_command: AtomicU64::new(0),
            events: DriveEvents::new(),
        })
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    fn load_status(&self) -> DriverStatus {
        DriverStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or(DriverStatus::Disconnected)
    }

    /// Compare-and-swap into `to` if the transition table allows it.
    fn transition(&self, to: DriverStatus) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let from = DriverStatus::from_u8(current).unwrap_or(DriverStatus::Disconnected);
            if !from.can_transition_to(to) {
                return false;
            }
            match self
                .status
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug!(axis = %self.axis, ?from, ?to, "drive status changed");
                    self.events.raise(AxisEvent::StatusChanged {
                        axis: self.axis,
                        from,
                        to,
                    });
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Reach `target`, passing through `Connected` when there is no direct
    /// edge (e.g. `Recovering` → `Degraded`).
    fn settle(&self, target: DriverStatus) {
        let current = self.load_status();
        if current == target || current == DriverStatus::Disposed || self.transition(target) {
            return;
        }
        if self.transition(DriverStatus::Connected) {
            self.transition(target);
        }
    }

    fn ensure_live(&self) -> Result<(), SingulaError> {
        if self.load_status() == DriverStatus::Disposed {
            return Err(SingulaError::Disposed(self.axis));
        }
        Ok(())
    }

    async fn throttle(&self, cancel: &CancellationToken) -> Result<(), SingulaError> {
        let last = self.last_command.load(Ordering::Acquire);
        if last == 0 {
            return Ok(());
        }
        let issued_at = self.epoch + Duration::from_micros(last - 1);
        let elapsed = Instant::now().saturating_duration_since(issued_at);
        let Some(wait) = self.options.command_min_interval.checked_sub(elapsed) else {
            return Ok(());
        };
        if wait.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SingulaError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    fn mark_issued(&self) {
        let micros = Instant::now().saturating_duration_since(self.epoch).as_micros();
        let micros = u64::try_from(micros).unwrap_or(u64::MAX - 1);
        self.last_command.store(micros + 1, Ordering::Release);
    }

    /// Run `attempt` under throttle, retry and cancellation.  `settle_to`
    /// picks the status to report after a successful attempt.
    async fn guarded<T, F, Fut, S>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        mut attempt: F,
        settle_to: S,
    ) -> Result<T, SingulaError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SingulaError>>,
        S: FnOnce(&T) -> DriverStatus,
    {
        self.ensure_live()?;
        let mut retries = 0u32;
        let mut backoff = self.options.initial_backoff;
        loop {
            self.throttle(cancel).await?;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SingulaError::Cancelled),
                result = attempt() => result,
            };
            match outcome {
                Ok(value) => {
                    self.mark_issued();
                    self.settle(settle_to(&value));
                    return Ok(value);
                }
                Err(SingulaError::Cancelled) => return Err(SingulaError::Cancelled),
                Err(err) if err.is_retryable() && retries < self.options.max_retries => {
                    retries += 1;
                    self.transition(DriverStatus::Recovering);
                    warn!(
                        axis = %self.axis,
                        op,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "axis command failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SingulaError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2).min(self.options.max_backoff);
                }
                Err(err) => {
                    warn!(axis = %self.axis, op, attempts = retries + 1, error = %err, "axis command failed");
                    if !matches!(err, SingulaError::Disposed(_)) {
                        self.transition(DriverStatus::Disconnected);
                    }
                    if err.is_retryable() {
                        self.events.raise(AxisEvent::Disconnected {
                            axis: self.axis,
                            reason: err.to_string(),
                        });
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn send_frame(
        &self,
        op: &'static str,
        frame: Vec<u8>,
        target: DriverStatus,
        cancel: &CancellationToken,
    ) -> Result<(), SingulaError> {
        let port = &self.port;
        let frame = frame.as_slice();
        self.guarded(op, cancel, move || port.send(frame), |_| target)
            .await
    }

    /// Roller rpm → clamped, direction-corrected motor rpm.
    fn motor_rpm(&self, roller_rpm: f64) -> i32 {
        let mut motor = roller_rpm * self.options.gear_ratio;
        if self.reversed {
            motor = -motor;
        }
        let limit = self.options.max_rpm;
        motor.clamp(-limit, limit).round() as i32
    }

    fn roller_rpm(&self, motor_rpm: f64) -> f64 {
        let roller = motor_rpm / self.options.gear_ratio;
        if self.reversed { -roller } else { roller }
    }
}

#[async_trait]
impl<P: AxisProtocol> AxisDrive for AxisDriveBase<P> {
    fn axis_id(&self) -> AxisId {
        self.axis
    }

    fn node_id(&self) -> u16 {
        self.node_id
    }

    fn vendor(&self) -> &'static str {
        self.protocol.vendor()
    }

    fn status(&self) -> DriverStatus {
        self.load_status()
    }

    fn events(&self) -> &DriveEvents {
        &self.events
    }

    async fn initialize(&self, cancel: &CancellationToken) -> Result<(), SingulaError> {
        self.ensure_live()?;
        self.transition(DriverStatus::Initializing);
        self.set_ramp(self.options.max_accel_rpm_s, self.options.max_decel_rpm_s, cancel)
            .await?;
        info!(axis = %self.axis, node = self.node_id, vendor = self.vendor(), "axis initialized");
        Ok(())
    }

    async fn enable(&self, cancel: &CancellationToken) -> Result<(), SingulaError> {
        let frame = self.protocol.encode_enable(self.node_id);
        self.send_frame("enable", frame, DriverStatus::Connected, cancel)
            .await
    }

    async fn disable(&self, cancel: &CancellationToken) -> Result<(), SingulaError> {
        let frame = self.protocol.encode_disable(self.node_id);
        self.send_frame("disable", frame, DriverStatus::Disabled, cancel)
            .await
    }

    async fn write_speed(&self, rpm: f64, cancel: &CancellationToken) -> Result<(), SingulaError> {
        let frame = self.protocol.encode_speed(self.node_id, self.motor_rpm(rpm));
        self.send_frame("write_speed", frame, DriverStatus::Connected, cancel)
            .await
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<(), SingulaError> {
        let frame = self.protocol.encode_stop(self.node_id);
        self.send_frame("stop", frame, DriverStatus::Connected, cancel)
            .await
    }

    async fn home(&self, cancel: &CancellationToken) -> Result<(), SingulaError> {
        let frame = self.protocol.encode_home(self.node_id);
        self.send_frame("home", frame, DriverStatus::Connected, cancel)
            .await
    }

    async fn set_ramp(
        &self,
        accel_rpm_s: f64,
        decel_rpm_s: f64,
        cancel: &CancellationToken,
    ) -> Result<(), SingulaError> {
        let accel = accel_rpm_s.clamp(0.0, self.options.max_accel_rpm_s).round() as u32;
        let decel = decel_rpm_s.clamp(0.0, self.options.max_decel_rpm_s).round() as u32;
        let frame = self.protocol.encode_ramp(self.node_id, accel, decel);
        self.send_frame("set_ramp", frame, DriverStatus::Connected, cancel)
            .await
    }

    async fn read_status(&self, cancel: &CancellationToken) -> Result<AxisStatusReport, SingulaError> {
        let before = self.load_status();
        let port = &self.port;
        let protocol = &self.protocol;
        let frame = protocol.encode_status_request(self.node_id);
        let frame = frame.as_slice();
        let (axis, node_id) = (self.axis, self.node_id);
        let len = protocol.response_len();

        let mut report = self
            .guarded(
                "read_status",
                cancel,
                move || async move {
                    let mut buf = vec![0u8; len];
                    let n = port.request(frame, &mut buf).await?;
                    let valid = buf.get(..n).ok_or_else(|| SingulaError::Protocol {
                        axis,
                        details: format!("port reported {n} bytes for a {len}-byte buffer"),
                    })?;
                    protocol.decode_status(axis, node_id, valid)
                },
                |report: &AxisStatusReport| {
                    if report.fault_code.is_some() {
                        DriverStatus::Faulted
                    } else if report.warning {
                        DriverStatus::Degraded
                    } else {
                        DriverStatus::Connected
                    }
                },
            )
            .await?;

        report.actual_rpm = self.roller_rpm(report.actual_rpm);
        self.events.raise(AxisEvent::SpeedFeedback {
            axis: self.axis,
            rpm: report.actual_rpm,
        });
        if let Some(code) = report.fault_code
            && before != DriverStatus::Faulted
        {
            warn!(axis = %self.axis, code, "drive reported fault");
            self.events.raise(AxisEvent::Faulted {
                axis: self.axis,
                code,
                reason: format!("drive reported fault code {code:#06x}"),
            });
        }
        Ok(report)
    }

    async fn ping(&self, cancel: &CancellationToken) -> bool {
        match self.read_status(cancel).await {
            Ok(_) => true,
            Err(err) => {
                debug!(axis = %self.axis, error = %err, "ping failed");
                false
            }
        }
    }

    async fn dispose(&self) {
        if !self.transition(DriverStatus::Disposed) {
            return;
        }
        self.port.close().await;
        info!(axis = %self.axis, "axis drive disposed");
    }
}
