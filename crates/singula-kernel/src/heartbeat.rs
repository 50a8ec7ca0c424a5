//! [`HeartbeatMonitor`] – liveness deadline for the upstream link.
//!
//! The frame guard calls [`HeartbeatMonitor::beat`] for every heartbeat frame
//! and asks [`HeartbeatMonitor::is_timed_out`] on each watchdog tick.  Time is
//! read from the Tokio clock so paused-time tests control it exactly.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Health of the monitored link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Alive,
    TimedOut,
}

pub struct HeartbeatMonitor {
    timeout: Duration,
    last_beat: Mutex<Instant>,
}

impl HeartbeatMonitor {
    /// The deadline starts now, so a fresh monitor is [`LinkHealth::Alive`].
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_beat: Mutex::new(Instant::now()),
        }
    }

    pub fn beat(&self) {
        *self.last_beat.lock() = Instant::now();
    }

    pub fn since_last_beat(&self) -> Duration {
        self.last_beat.lock().elapsed()
    }

    /// `true` once the gap since the last beat reaches the timeout.
    pub fn is_timed_out(&self) -> bool {
        self.since_last_beat() >= self.timeout
    }

    pub fn health(&self) -> LinkHealth {
        if self.is_timed_out() {
            LinkHealth::TimedOut
        } else {
            LinkHealth::Alive
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
