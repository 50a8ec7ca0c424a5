//! [`IoButtonMonitor`] – polls the panel inputs and turns button edges into
//! governor commands.
//!
//! Inputs are read as one `u32` bit mask.  A button fires on its rising edge
//! only (held buttons do not repeat).  The emergency stop input is usually
//! wired normally-closed, so it can be configured active-low.
//!
//! | Button | Governor call | Trigger kind |
//! |---|---|---|
//! | start | `request_start` | `StartButton` |
//! | stop | `request_stop` | `StopButton` |
//! | reset | `request_reset` | `ResetButton` |
//! | emergency stop | `request_stop` | `EmergencyStop` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use singula_types::{SafetyTriggerKind, SingulaError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::safety_pipeline::SafetyPipeline;

/// Digital input source (IO card, PLC image, simulator).
#[async_trait]
pub trait IoInputs: Send + Sync {
    async fn read_inputs(&self) -> Result<u32, SingulaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoButton {
    Start,
    Stop,
    Reset,
    EmergencyStop,
}

/// Bit positions of the panel buttons.  `None` leaves a button unwired.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IoButtonMap {
    pub start: Option<u8>,
    pub stop: Option<u8>,
    pub reset: Option<u8>,
    pub emergency_stop: Option<u8>,
    pub emergency_stop_active_low: bool,
}

impl IoButtonMap {
    fn is_pressed(&self, button: IoButton, inputs: u32) -> bool {
        let bit = match button {
            IoButton::Start => self.start,
            IoButton::Stop => self.stop,
            IoButton::Reset => self.reset,
            IoButton::EmergencyStop => self.emergency_stop,
        };
        let Some(bit) = bit.filter(|b| *b < 32) else {
            return false;
        };
        let high = inputs & (1 << bit) != 0;
        if button == IoButton::EmergencyStop && self.emergency_stop_active_low {
            !high
        } else {
            high
        }
    }

    /// Buttons that went from released to pressed between two reads.
    pub fn rising_edges(&self, previous: u32, current: u32) -> Vec<IoButton> {
        [IoButton::EmergencyStop, IoButton::Stop, IoButton::Reset, IoButton::Start]
            .into_iter()
            .filter(|b| self.is_pressed(*b, current) && !self.is_pressed(*b, previous))
            .collect()
    }
}

pub struct IoButtonMonitor {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IoButtonMonitor {
    /// Start polling every `poll`.  The first successful read only sets the
    /// baseline, so a button held at power-up does not fire.
    pub fn spawn(
        inputs: Arc<dyn IoInputs>,
        map: IoButtonMap,
        poll: Duration,
        pipeline: Arc<SafetyPipeline>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut previous: Option<u32> = None;
            info!(?map, ?poll, "io monitor started");
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let current = match inputs.read_inputs().await {
                    Ok(bits) => bits,
                    Err(err) => {
                        warn!(error = %err, "io read failed");
                        continue;
                    }
                };
                if let Some(prev) = previous {
                    for button in map.rising_edges(prev, current) {
                        dispatch(&pipeline, button);
                    }
                }
                previous = Some(current);
            }
            debug!("io monitor stopped");
        });
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for IoButtonMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn dispatch(pipeline: &SafetyPipeline, button: IoButton) {
    info!(?button, "panel button pressed");
    match button {
        IoButton::Start => pipeline.request_start(SafetyTriggerKind::StartButton, "start button", true),
        IoButton::Stop => pipeline.request_stop(SafetyTriggerKind::StopButton, "stop button", true),
        IoButton::Reset => pipeline.request_reset(SafetyTriggerKind::ResetButton, "reset button", true),
        IoButton::EmergencyStop => {
            pipeline.request_stop(SafetyTriggerKind::EmergencyStop, "emergency stop button", true)
        }
    }
}
