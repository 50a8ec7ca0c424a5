//! [`AxisController`] – owns the drives of one bus and fans out fleet-wide
//! operations.
//!
//! Fleet operations run on every drive concurrently and never stop at the
//! first failure; the returned [`FleetOutcome`] lists the axes that failed so
//! callers can log them, while per-axis state keeps flowing through the
//! [`AxisEventAggregator`].
//!
//! The controller also owns one [`AxisCommandQueue`] per drive.  The
//! high-frequency frame path goes through those queues; control-plane
//! operations (enable, stop, reset) call the drives directly.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use parking_lot::RwLock;
use singula_types::{AxisEvent, AxisId, DriverOptions, SingulaError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::AxisEventAggregator;
use crate::command_queue::{AxisCommandQueue, SpeedWriter, StopAction};
use crate::drive::{AxisDrive, DriveContext};
use crate::port::BusAdapter;
use crate::registry::DriveRegistry;

/// Result of one fleet-wide operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetOutcome {
    /// Number of drives the operation was issued to.
    pub attempted: usize,
    pub failures: Vec<(AxisId, SingulaError)>,
}

impl FleetOutcome {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn collect(results: Vec<(AxisId, Result<(), SingulaError>)>) -> Self {
        let attempted = results.len();
        let failures = results
            .into_iter()
            .filter_map(|(axis, r)| r.err().map(|e| (axis, e)))
            .collect();
        Self { attempted, failures }
    }
}

/// Fleet operations consumed by the safety governor.
#[async_trait]
pub trait FleetControl: Send + Sync {
    async fn enable_all(&self, cancel: &CancellationToken) -> FleetOutcome;
    async fn disable_all(&self, cancel: &CancellationToken) -> FleetOutcome;
    async fn write_speed_all(&self, rpm: f64, cancel: &CancellationToken) -> FleetOutcome;
    async fn stop_all(&self, cancel: &CancellationToken) -> FleetOutcome;

    /// Clear latched bus/controller errors.
    async fn reset(&self, cancel: &CancellationToken) -> Result<(), SingulaError>;
}

/// Drive set for one bus session.
pub struct AxisController {
    bus: Arc<dyn BusAdapter>,
    registry: DriveRegistry,
    aggregator: AxisEventAggregator,
    drives: RwLock<Vec<Arc<dyn AxisDrive>>>,
    queues: RwLock<Vec<Arc<AxisCommandQueue>>>,
    /// Cancels queued commands still executing when the fleet is disposed.
    queue_cancel: CancellationToken,
}

impl AxisController {
    pub fn new(bus: Arc<dyn BusAdapter>, registry: DriveRegistry, aggregator: AxisEventAggregator) -> Self {
        Self {
            bus,
            registry,
            aggregator,
            drives: RwLock::new(Vec::new()),
            queues: RwLock::new(Vec::new()),
            queue_cancel: CancellationToken::new(),
        }
    }

    pub fn aggregator(&self) -> &AxisEventAggregator {
        &self.aggregator
    }

    /// Snapshot of the current drives, in axis order.
    pub fn drives(&self) -> Vec<Arc<dyn AxisDrive>> {
        self.drives.read().clone()
    }

    pub fn axis_count(&self) -> usize {
        self.drives.read().len()
    }

    fn raise_fault(&self, message: String) {
        warn!(%message, "axis controller fault");
        self.aggregator.publish(AxisEvent::ControllerFault { message });
    }

    /// Discover the axes and build one drive per axis.
    ///
    /// Configuration problems (no axes, unknown vendor, bad options) are
    /// raised as [`AxisEvent::ControllerFault`] and yield `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Bus I/O failures, or [`SingulaError::Config`] when called on an
    /// already initialized controller.
    pub async fn initialize(
        &self,
        vendor: &str,
        template: &DriverOptions,
        override_count: Option<i32>,
        cancel: &CancellationToken,
    ) -> Result<usize, SingulaError> {
        if !self.drives.read().is_empty() {
            return Err(SingulaError::Config("axis controller is already initialized".into()));
        }
        self.bus.initialize().await?;
        let count = match override_count {
            Some(n) => n,
            None => self.bus.axis_count().await?,
        };
        let count = match u16::try_from(count) {
            Ok(n) if n > 0 => n,
            _ => {
                self.raise_fault(format!("bus reported {count} axes"));
                return Ok(0);
            }
        };
        if !self.registry.contains(vendor) {
            self.raise_fault(SingulaError::UnknownVendor(vendor.to_string()).to_string());
            return Ok(0);
        }
        if let Err(err) = template.validate() {
            self.raise_fault(err.to_string());
            return Ok(0);
        }

        let mut drives: Vec<Arc<dyn AxisDrive>> = Vec::with_capacity(count.into());
        for index in 0..count {
            let axis = AxisId(index);
            let node_id = self.bus.translate_node_id(index);
            let port = self.bus.open_port(axis, node_id).await?;
            let ctx = DriveContext {
                axis,
                node_id,
                reversed: self.bus.should_reverse(node_id),
                port,
                options: template.clone(),
            };
            match self.registry.create(vendor, ctx) {
                Ok(drive) => drives.push(drive),
                Err(err) => {
                    join_all(drives.iter().map(|d| d.dispose())).await;
                    self.raise_fault(format!("{axis}: {err}"));
                    return Ok(0);
                }
            }
        }

        for drive in &drives {
            self.aggregator.attach(drive);
        }
        let results = join_all(drives.iter().map(|d| async move { (d.axis_id(), d.initialize(cancel).await) })).await;
        for (axis, result) in results {
            if let Err(err) = result {
                warn!(%axis, error = %err, "axis initialization failed");
            }
        }

        let queues = drives.iter().map(|d| Arc::new(self.spawn_queue(d))).collect();
        *self.queues.write() = queues;
        *self.drives.write() = drives;
        info!(vendor, axes = count, "axis fleet initialized");
        Ok(count.into())
    }

    fn spawn_queue(&self, drive: &Arc<dyn AxisDrive>) -> AxisCommandQueue {
        let (d, cancel) = (Arc::clone(drive), self.queue_cancel.clone());
        let write: SpeedWriter = Arc::new(move |rpm| {
            let (d, cancel) = (Arc::clone(&d), cancel.clone());
            async move { d.write_speed(rpm, &cancel).await }.boxed()
        });
        let (d, cancel) = (Arc::clone(drive), self.queue_cancel.clone());
        let stop: StopAction = Arc::new(move || {
            let (d, cancel) = (Arc::clone(&d), cancel.clone());
            async move { d.stop(&cancel).await }.boxed()
        });
        AxisCommandQueue::spawn(drive.axis_id(), write, stop)
    }

    async fn fan_out<'a, F>(&self, op: &'static str, call: F) -> FleetOutcome
    where
        F: Fn(Arc<dyn AxisDrive>) -> BoxFuture<'a, Result<(), SingulaError>>,
    {
        let drives = self.drives();
        let calls = drives.into_iter().map(|d| {
            let axis = d.axis_id();
            let fut = call(d);
            async move { (axis, fut.await) }
        });
        let outcome = FleetOutcome::collect(join_all(calls).await);
        if !outcome.is_ok() {
            warn!(
                op,
                attempted = outcome.attempted,
                failed = outcome.failures.len(),
                "fleet operation partially failed"
            );
        }
        outcome
    }

    /// Queue one target per axis (index-aligned).  Returns how many were
    /// queued.
    pub fn enqueue_speeds(&self, speeds: &[f64]) -> usize {
        let queues = self.queues.read();
        if speeds.len() != queues.len() {
            debug!(speeds = speeds.len(), axes = queues.len(), "speed vector length differs from axis count");
        }
        queues
            .iter()
            .zip(speeds)
            .map(|(q, rpm)| q.enqueue_speed(*rpm))
            .filter(|queued| *queued)
            .count()
    }

    pub fn enqueue_stop_all(&self) -> usize {
        self.queues.read().iter().filter(|q| q.enqueue_stop()).count()
    }

    /// Wait until every axis queue is drained.
    pub async fn flush_queues(&self) {
        let queues: Vec<Arc<AxisCommandQueue>> = self.queues.read().clone();
        join_all(queues.iter().map(|q| q.flush())).await;
    }

    /// Stop the queues, detach and dispose every drive, then close the bus.
    ///
    /// The bus is closed even when there were no drives.
    pub async fn dispose_all(&self) -> Result<(), SingulaError> {
        self.queue_cancel.cancel();
        let queues = std::mem::take(&mut *self.queues.write());
        join_all(queues.iter().map(|q| q.shutdown())).await;

        let drives = std::mem::take(&mut *self.drives.write());
        for drive in &drives {
            self.aggregator.detach(drive.axis_id());
        }
        join_all(drives.iter().map(|d| d.dispose())).await;

        let closed = self.bus.close().await;
        info!(axes = drives.len(), "axis fleet disposed");
        closed
    }
}

#[async_trait]
impl FleetControl for AxisController {
    async fn enable_all(&self, cancel: &CancellationToken) -> FleetOutcome {
        self.fan_out("enable_all", |d| async move { d.enable(cancel).await }.boxed())
            .await
    }

    async fn disable_all(&self, cancel: &CancellationToken) -> FleetOutcome {
        self.fan_out("disable_all", |d| async move { d.disable(cancel).await }.boxed())
            .await
    }

    async fn write_speed_all(&self, rpm: f64, cancel: &CancellationToken) -> FleetOutcome {
        self.fan_out("write_speed_all", |d| {
            async move { d.write_speed(rpm, cancel).await }.boxed()
        })
        .await
    }

    async fn stop_all(&self, cancel: &CancellationToken) -> FleetOutcome {
        self.fan_out("stop_all", |d| async move { d.stop(cancel).await }.boxed())
            .await
    }

    async fn reset(&self, cancel: &CancellationToken) -> Result<(), SingulaError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SingulaError::Cancelled),
            result = self.bus.reset() => result,
        }
    }
}
