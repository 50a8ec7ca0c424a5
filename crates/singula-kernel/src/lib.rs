//! `singula-kernel` – Safety & Supervision
//!
//! Decides whether the rollers may move.  Nothing in here talks to a drive
//! directly; every axis action goes through [`singula_hal::FleetControl`].
//!
//! # Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`isolator`] | [`SafetyIsolator`] – Normal / Degraded / Isolated posture with guarded transitions |
//! | [`safety_pipeline`] | [`SafetyPipeline`] – single-consumer governor that serialises every safety trigger |
//! | [`frame_guard`] | [`FrameGuard`] – per-frame admission, degraded scaling and the heartbeat watchdog |
//! | [`sequence_window`] | [`SequenceWindow`] – duplicate detection over recent sequence numbers |
//! | [`heartbeat`] | [`HeartbeatMonitor`] – upstream liveness deadline |
//! | [`io_monitor`] | [`IoButtonMonitor`] – panel button edges into governor commands |

pub mod frame_guard;
pub mod heartbeat;
pub mod io_monitor;
pub mod isolator;
pub mod safety_pipeline;
pub mod sequence_window;

#[cfg(test)]
mod testing;

pub use frame_guard::{FrameGuard, FrameGuardConfig, FrameGuardMetrics, SafetyGovernor};
pub use heartbeat::{HeartbeatMonitor, LinkHealth};
pub use io_monitor::{IoButton, IoButtonMap, IoButtonMonitor, IoInputs};
pub use isolator::{InMemoryIsolator, ListenerId, SafetyIsolator, StateListener};
pub use safety_pipeline::{SafetyOperation, SafetyPipeline, SafetyPipelineConfig};
pub use sequence_window::SequenceWindow;
