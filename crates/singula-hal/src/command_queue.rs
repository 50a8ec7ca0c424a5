//! Per-axis command queue with speed coalescing and stop priority.
//!
//! Each axis gets one [`AxisCommandQueue`] and one worker task, so a slow or
//! retrying axis never delays its neighbours.
//!
//! | Lane | Carries | Capacity | Overflow |
//! |---|---|---|---|
//! | urgent | `Stop` | 8 | drop oldest |
//! | normal | `WriteSpeed` placeholder | 64 | drop oldest |
//!
//! Speed writes coalesce: only the newest target is kept in an atomic and at
//! most one placeholder sits in the normal lane.  When the worker runs the
//! placeholder it clears the pending flag *before* reading the target, so a
//! target stored after that point always gets a fresh placeholder and is
//! never lost.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use singula_types::{AxisId, SingulaError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const URGENT_CAPACITY: usize = 8;
pub const NORMAL_CAPACITY: usize = 64;

const FLUSH_POLL: Duration = Duration::from_millis(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Writes one roller speed to the axis.
pub type SpeedWriter = Arc<dyn Fn(f64) -> BoxFuture<'static, Result<(), SingulaError>> + Send + Sync>;

/// Stops the axis.
pub type StopAction = Arc<dyn Fn() -> BoxFuture<'static, Result<(), SingulaError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueuedCommand {
    WriteSpeed,
    Stop,
}

struct Lanes {
    urgent: VecDeque<QueuedCommand>,
    normal: VecDeque<QueuedCommand>,
    closed: bool,
}

struct Shared {
    axis: AxisId,
    lanes: Mutex<Lanes>,
    wake: Notify,
    speed_pending: AtomicBool,
    /// `f64` bits of the newest requested speed.
    target: AtomicU64,
    in_flight: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn push(&self, cmd: QueuedCommand) -> bool {
        let mut lanes = self.lanes.lock();
        if lanes.closed {
            return false;
        }
        let (queue, cap) = match cmd {
            QueuedCommand::Stop => (&mut lanes.urgent, URGENT_CAPACITY),
            QueuedCommand::WriteSpeed => (&mut lanes.normal, NORMAL_CAPACITY),
        };
        if queue.len() >= cap {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(axis = %self.axis, ?cmd, "command lane full, dropped oldest entry");
        }
        queue.push_back(cmd);
        drop(lanes);
        self.wake.notify_one();
        true
    }

    /// Pop the next command, urgent first.  `Err(())` once closed and empty.
    fn pop(&self) -> Result<Option<QueuedCommand>, ()> {
        let mut lanes = self.lanes.lock();
        let next = lanes.urgent.pop_front().or_else(|| lanes.normal.pop_front());
        match next {
            Some(cmd) => {
                self.in_flight.store(true, Ordering::SeqCst);
                Ok(Some(cmd))
            }
            None if lanes.closed => Err(()),
            None => Ok(None),
        }
    }

    fn is_idle(&self) -> bool {
        let lanes = self.lanes.lock();
        lanes.urgent.is_empty()
            && lanes.normal.is_empty()
            && !self.speed_pending.load(Ordering::SeqCst)
            && !self.in_flight.load(Ordering::SeqCst)
    }
}

/// Bounded two-lane command queue drained by one worker task.
pub struct AxisCommandQueue {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AxisCommandQueue {
    /// Start the worker for `axis` on the current Tokio runtime.
    pub fn spawn(axis: AxisId, write: SpeedWriter, stop: StopAction) -> Self {
        let shared = Arc::new(Shared {
            axis,
            lanes: Mutex::new(Lanes {
                urgent: VecDeque::with_capacity(URGENT_CAPACITY),
                normal: VecDeque::with_capacity(NORMAL_CAPACITY),
                closed: false,
            }),
            wake: Notify::new(),
            speed_pending: AtomicBool::new(false),
            target: AtomicU64::new(0f64.to_bits()),
            in_flight: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), cancel.clone(), write, stop));
        Self {
            shared,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn axis(&self) -> AxisId {
        self.shared.axis
    }

    /// Request a speed.  Replaces any target not yet written.
    ///
    /// Returns `false` once the queue is shut down.
    pub fn enqueue_speed(&self, rpm: f64) -> bool {
        self.shared.target.store(rpm.to_bits(), Ordering::SeqCst);
        if self
            .shared
            .speed_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return !self.shared.lanes.lock().closed;
        }
        let queued = self.shared.push(QueuedCommand::WriteSpeed);
        if !queued {
            self.shared.speed_pending.store(false, Ordering::SeqCst);
        }
        queued
    }

    /// Request a stop ahead of any queued speed write.
    pub fn enqueue_stop(&self) -> bool {
        self.shared.push(QueuedCommand::Stop)
    }

    /// Wait until both lanes are empty and nothing is executing.
    pub async fn flush(&self) {
        while !self.shared.is_idle() {
            tokio::time::sleep(FLUSH_POLL).await;
        }
    }

    /// Entries discarded because a lane was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stop the worker and discard queued commands.  Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut lanes = self.shared.lanes.lock();
            lanes.closed = true;
            lanes.urgent.clear();
            lanes.normal.clear();
        }
        self.shared.speed_pending.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.shared.wake.notify_one();

        let Some(mut handle) = self.worker.lock().take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => debug!(axis = %self.shared.axis, "command worker stopped"),
            Ok(Err(err)) => warn!(axis = %self.shared.axis, error = %err, "command worker ended abnormally"),
            Err(_) => {
                warn!(axis = %self.shared.axis, "command worker did not stop in time, aborting");
                handle.abort();
            }
        }
        self.shared.in_flight.store(false, Ordering::SeqCst);
    }
}

impl Drop for AxisCommandQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(shared: Arc<Shared>, cancel: CancellationToken, write: SpeedWriter, stop: StopAction) {
    loop {
        let cmd = match shared.pop() {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = shared.wake.notified() => continue,
                }
            }
            Err(()) => return,
        };

        // Callbacks run inside the polled future so a panic while building
        // the command future is caught as well.
        let fut: BoxFuture<'_, Result<(), SingulaError>> = match cmd {
            QueuedCommand::WriteSpeed => {
                shared.speed_pending.store(false, Ordering::SeqCst);
                let rpm = f64::from_bits(shared.target.load(Ordering::SeqCst));
                let write = &write;
                async move { write(rpm).await }.boxed()
            }
            QueuedCommand::Stop => {
                let stop = &stop;
                async move { stop().await }.boxed()
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = AssertUnwindSafe(fut).catch_unwind() => outcome,
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(axis = %shared.axis, ?cmd, error = %err, "queued axis command failed"),
            Err(_) => error!(axis = %shared.axis, ?cmd, "queued axis command panicked"),
        }
        shared.in_flight.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Write(f64),
        Stop,
    }

    fn recording_queue() -> (AxisCommandQueue, Arc<Mutex<Vec<Call>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let w = Arc::clone(&calls);
        let s = Arc::clone(&calls);
        let queue = AxisCommandQueue::spawn(
            AxisId(0),
            Arc::new(move |rpm| {
                w.lock().push(Call::Write(rpm));
                async { Ok(()) }.boxed()
            }),
            Arc::new(move || {
                s.lock().push(Call::Stop);
                async { Ok(()) }.boxed()
            }),
        );
        (queue, calls)
    }

    #[tokio::test]
    async fn rapid_speed_requests_coalesce_to_latest() {
        let (queue, calls) = recording_queue();
        // current-thread runtime: the worker cannot run until we yield
        for rpm in [100.0, 200.0, 300.0] {
            assert!(queue.enqueue_speed(rpm));
        }
        queue.flush().await;

        assert_eq!(calls.lock().as_slice(), &[Call::Write(300.0)]);
    }

    #[tokio::test]
    async fn stop_overtakes_pending_speed() {
        let (queue, calls) = recording_queue();
        queue.enqueue_speed(50.0);
        queue.enqueue_stop();
        queue.flush().await;

        assert_eq!(calls.lock().as_slice(), &[Call::Stop, Call::Write(50.0)]);
    }

    #[tokio::test]
    async fn target_set_after_write_gets_its_own_write() {
        let (queue, calls) = recording_queue();
        queue.enqueue_speed(10.0);
        queue.flush().await;
        queue.enqueue_speed(20.0);
        queue.flush().await;

        assert_eq!(calls.lock().as_slice(), &[Call::Write(10.0), Call::Write(20.0)]);
    }

    #[tokio::test]
    async fn urgent_lane_drops_oldest_when_full() {
        let (queue, _calls) = recording_queue();
        for _ in 0..URGENT_CAPACITY + 3 {
            queue.enqueue_stop();
        }
        assert_eq!(queue.dropped(), 3);
        queue.flush().await;
    }

    #[tokio::test]
    async fn failing_command_does_not_kill_worker() {
        let calls = Arc::new(Mutex::new(0u32));
        let c = Arc::clone(&calls);
        let queue = AxisCommandQueue::spawn(
            AxisId(1),
            Arc::new(move |_| {
                *c.lock() += 1;
                async {
                    Err(SingulaError::Transport {
                        axis: AxisId(1),
                        details: "offline".into(),
                    })
                }
                .boxed()
            }),
            Arc::new(|| async { Ok(()) }.boxed()),
        );
        queue.enqueue_speed(1.0);
        queue.flush().await;
        queue.enqueue_speed(2.0);
        queue.flush().await;

        assert_eq!(*calls.lock(), 2);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stall_the_queue() {
        let stops = Arc::new(Mutex::new(0u32));
        let s = Arc::clone(&stops);
        let queue = AxisCommandQueue::spawn(
            AxisId(2),
            Arc::new(|_| async { panic!("vendor bug") }.boxed()),
            Arc::new(move || {
                *s.lock() += 1;
                async { Ok(()) }.boxed()
            }),
        );
        queue.enqueue_speed(1.0);
        tokio::time::timeout(Duration::from_secs(1), queue.flush())
            .await
            .expect("flush after a panicking write");

        queue.enqueue_stop();
        queue.enqueue_speed(2.0);
        tokio::time::timeout(Duration::from_secs(1), queue.flush())
            .await
            .expect("flush after a second panicking write");
        assert_eq!(*stops.lock(), 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_further_commands() {
        let (queue, calls) = recording_queue();
        queue.shutdown().await;
        queue.shutdown().await;

        assert!(!queue.enqueue_speed(5.0));
        assert!(!queue.enqueue_stop());
        queue.flush().await;
        assert!(calls.lock().is_empty());
    }
}
