//! Transport and vendor seams consumed by the drive layer.
//!
//! Drives never talk to serial ports, CAN interfaces or vendor SDKs directly.
//! They go through three small traits so the retry, throttle and state logic
//! in [`AxisDriveBase`][crate::drive::AxisDriveBase] stays identical for every
//! vendor:
//!
//! - [`AxisPort`] – raw send / request for one axis.
//! - [`BusAdapter`] – the shared bus controller the ports hang off.
//! - [`AxisProtocol`] – vendor byte-frame builders and the status parser.

use std::sync::Arc;

use async_trait::async_trait;
use singula_types::{AxisId, AxisStatusReport, SingulaError};

/// Raw transport to a single axis.
///
/// I/O failures are reported as [`SingulaError::Transport`] and are retried
/// by the drive layer.
#[async_trait]
pub trait AxisPort: Send + Sync {
    /// Fire-and-forget write of one command frame.
    async fn send(&self, frame: &[u8]) -> Result<(), SingulaError>;

    /// Write `frame` and read the reply into `response`.
    ///
    /// Returns the number of valid bytes written into `response`.
    async fn request(&self, frame: &[u8], response: &mut [u8]) -> Result<usize, SingulaError>;

    /// Release the underlying transport.  Must not fail.
    async fn close(&self);
}

/// The shared bus controller (gateway card, CAN master, fieldbus coupler).
#[async_trait]
pub trait BusAdapter: Send + Sync {
    async fn initialize(&self) -> Result<(), SingulaError>;

    /// Axis count reported by the bus.  Zero or negative means the bus found
    /// nothing usable.
    async fn axis_count(&self) -> Result<i32, SingulaError>;

    /// Map a zero-based axis index to the node address used on the wire.
    fn translate_node_id(&self, index: u16) -> u16;

    /// Whether the node is mounted mirrored and needs its speed negated.
    fn should_reverse(&self, node_id: u16) -> bool;

    /// Open the per-axis transport for `node_id`.
    async fn open_port(&self, axis: AxisId, node_id: u16) -> Result<Arc<dyn AxisPort>, SingulaError>;

    /// Clear latched bus/controller errors.
    async fn reset(&self) -> Result<(), SingulaError>;

    async fn close(&self) -> Result<(), SingulaError>;
}

/// Vendor protocol plug-in: builds command frames and parses status replies.
///
/// Implementations are pure; all timing, retry and state tracking lives in the
/// drive layer.
pub trait AxisProtocol: Send + Sync + 'static {
    /// Registry key, e.g. `"sim"`.
    fn vendor(&self) -> &'static str;

    /// Size of the buffer handed to [`AxisPort::request`] for status reads.
    fn response_len(&self) -> usize;

    fn encode_enable(&self, node_id: u16) -> Vec<u8>;
    fn encode_disable(&self, node_id: u16) -> Vec<u8>;
    fn encode_stop(&self, node_id: u16) -> Vec<u8>;
    fn encode_home(&self, node_id: u16) -> Vec<u8>;

    /// Target motor speed, already clamped and direction-corrected.
    fn encode_speed(&self, node_id: u16, motor_rpm: i32) -> Vec<u8>;

    fn encode_ramp(&self, node_id: u16, accel_rpm_s: u32, decel_rpm_s: u32) -> Vec<u8>;

    fn encode_status_request(&self, node_id: u16) -> Vec<u8>;

    /// Parse the valid slice of a status reply.
    ///
    /// `actual_rpm` in the returned report is the raw *motor* speed; the drive
    /// converts it back to roller speed.
    ///
    /// # Errors
    ///
    /// Returns [`SingulaError::Protocol`] for truncated or corrupt replies.
    fn decode_status(&self, axis: AxisId, node_id: u16, response: &[u8])
    -> Result<AxisStatusReport, SingulaError>;
}
