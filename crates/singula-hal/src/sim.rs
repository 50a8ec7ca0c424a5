//! In-process simulated vendor for CI/CD testing without physical hardware.
//!
//! [`SimBus`] hands out [`SimAxisPort`]s that decode the [`SimProtocol`]
//! frames they receive, keep a plausible axis state (enabled flag, speed,
//! fault code) and answer status requests from it.  Ports can be told to fail
//! so retry and isolation paths run in headless tests.
//!
//! # Wire format
//!
//! | Frame | Layout |
//! |---|---|
//! | Command (9 bytes) | `A5 op node_hi node_lo p0 p1 p2 p3 sum` |
//! | Status reply (9 bytes) | `5A node_hi node_lo flags rpm_hi rpm_lo fault_hi fault_lo sum` |
//!
//! `sum` is the wrapping byte sum of everything before it.  Reply `flags`:
//! bit 0 enabled, bit 1 warning, bit 2 fault.
//!
//! # Example
//!
//! ```rust
//! use singula_hal::sim::SimBus;
//!
//! let bus = SimBus::new(4).with_reversed(2);
//! assert_eq!(bus.node_ids(), vec![1, 2, 3, 4]);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use singula_types::{AxisId, AxisStatusReport, SingulaError};

use crate::drive::AxisDriveBase;
use crate::port::{AxisPort, AxisProtocol, BusAdapter};

/// Registry key of the simulated vendor.
pub const SIM_VENDOR: &str = "sim";

const CMD_HEADER: u8 = 0xA5;
const REPLY_HEADER: u8 = 0x5A;
const FRAME_LEN: usize = 9;

const OP_ENABLE: u8 = 0x01;
const OP_DISABLE: u8 = 0x02;
const OP_STOP: u8 = 0x03;
const OP_HOME: u8 = 0x04;
const OP_SPEED: u8 = 0x10;
const OP_RAMP: u8 = 0x11;
const OP_STATUS: u8 = 0x20;

const FLAG_ENABLED: u8 = 0b001;
const FLAG_WARNING: u8 = 0b010;
const FLAG_FAULT: u8 = 0b100;

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn command_frame(op: u8, node_id: u16, payload: [u8; 4]) -> Vec<u8> {
    let [hi, lo] = node_id.to_be_bytes();
    let mut frame = vec![CMD_HEADER, op, hi, lo];
    frame.extend_from_slice(&payload);
    frame.push(checksum(&frame));
    frame
}

// ────────────────────────────────────────────────────────────────────────────
// Protocol
// ────────────────────────────────────────────────────────────────────────────

/// Decoded simulated command, for assertions in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCommand {
    Enable { node: u16 },
    Disable { node: u16 },
    Stop { node: u16 },
    Home { node: u16 },
    Speed { node: u16, rpm: i32 },
    Ramp { node: u16, accel: u16, decel: u16 },
    StatusRequest { node: u16 },
}

/// The simulated vendor protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimProtocol;

impl SimProtocol {
    /// Parse a command frame; `None` for anything malformed.
    pub fn decode_command(frame: &[u8]) -> Option<SimCommand> {
        if frame.len() != FRAME_LEN || frame[0] != CMD_HEADER {
            return None;
        }
        if checksum(&frame[..FRAME_LEN - 1]) != frame[FRAME_LEN - 1] {
            return None;
        }
        let node = u16::from_be_bytes([frame[2], frame[3]]);
        let payload = [frame[4], frame[5], frame[6], frame[7]];
        Some(match frame[1] {
            OP_ENABLE => SimCommand::Enable { node },
            OP_DISABLE => SimCommand::Disable { node },
            OP_STOP => SimCommand::Stop { node },
            OP_HOME => SimCommand::Home { node },
            OP_SPEED => SimCommand::Speed {
                node,
                rpm: i32::from_be_bytes(payload),
            },
            OP_RAMP => SimCommand::Ramp {
                node,
                accel: u16::from_be_bytes([payload[0], payload[1]]),
                decel: u16::from_be_bytes([payload[2], payload[3]]),
            },
            OP_STATUS => SimCommand::StatusRequest { node },
            _ => return None,
        })
    }

    /// Build a status reply for `state`.
    pub fn encode_reply(node_id: u16, state: &SimAxisState) -> Vec<u8> {
        let [node_hi, node_lo] = node_id.to_be_bytes();
        let mut flags = 0u8;
        if state.enabled {
            flags |= FLAG_ENABLED;
        }
        if state.warning {
            flags |= FLAG_WARNING;
        }
        if state.fault_code.is_some() {
            flags |= FLAG_FAULT;
        }
        let rpm = state.rpm.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        let [rpm_hi, rpm_lo] = rpm.to_be_bytes();
        let [fault_hi, fault_lo] = state.fault_code.unwrap_or(0).to_be_bytes();
        let mut reply = vec![
            REPLY_HEADER,
            node_hi,
            node_lo,
            flags,
            rpm_hi,
            rpm_lo,
            fault_hi,
            fault_lo,
        ];
        reply.push(checksum(&reply));
        reply
    }
}

impl AxisProtocol for SimProtocol {
    fn vendor(&self) -> &'static str {
        SIM_VENDOR
    }

    fn response_len(&self) -> usize {
        FRAME_LEN
    }

    fn encode_enable(&self, node_id: u16) -> Vec<u8> {
        command_frame(OP_ENABLE, node_id, [0; 4])
    }

    fn encode_disable(&self, node_id: u16) -> Vec<u8> {
        command_frame(OP_DISABLE, node_id, [0; 4])
    }

    fn encode_stop(&self, node_id: u16) -> Vec<u8> {
        command_frame(OP_STOP, node_id, [0; 4])
    }

    fn encode_home(&self, node_id: u16) -> Vec<u8> {
        command_frame(OP_HOME, node_id, [0; 4])
    }

    fn encode_speed(&self, node_id: u16, motor_rpm: i32) -> Vec<u8> {
        command_frame(OP_SPEED, node_id, motor_rpm.to_be_bytes())
    }

    fn encode_ramp(&self, node_id: u16, accel_rpm_s: u32, decel_rpm_s: u32) -> Vec<u8> {
        let accel = u16::try_from(accel_rpm_s).unwrap_or(u16::MAX).to_be_bytes();
        let decel = u16::try_from(decel_rpm_s).unwrap_or(u16::MAX).to_be_bytes();
        command_frame(OP_RAMP, node_id, [accel[0], accel[1], decel[0], decel[1]])
    }

    fn encode_status_request(&self, node_id: u16) -> Vec<u8> {
        command_frame(OP_STATUS, node_id, [0; 4])
    }

    fn decode_status(
        &self,
        axis: AxisId,
        node_id: u16,
        response: &[u8],
    ) -> Result<AxisStatusReport, SingulaError> {
        let protocol_error = |details: String| SingulaError::Protocol { axis, details };
        if response.len() != FRAME_LEN {
            return Err(protocol_error(format!(
                "status reply has {} bytes, expected {FRAME_LEN}",
                response.len()
            )));
        }
        if response[0] != REPLY_HEADER {
            return Err(protocol_error(format!("bad reply header {:#04x}", response[0])));
        }
        if checksum(&response[..FRAME_LEN - 1]) != response[FRAME_LEN - 1] {
            return Err(protocol_error("reply checksum mismatch".to_string()));
        }
        let node = u16::from_be_bytes([response[1], response[2]]);
        if node != node_id {
            return Err(protocol_error(format!(
                "reply from node {node}, expected {node_id}"
            )));
        }
        let flags = response[3];
        let rpm = i16::from_be_bytes([response[4], response[5]]);
        let fault = u16::from_be_bytes([response[6], response[7]]);
        Ok(AxisStatusReport {
            axis,
            enabled: flags & FLAG_ENABLED != 0,
            actual_rpm: f64::from(rpm),
            fault_code: (flags & FLAG_FAULT != 0).then_some(fault),
            warning: flags & FLAG_WARNING != 0,
        })
    }
}

/// Drive type registered under [`SIM_VENDOR`].
pub type SimDrive = AxisDriveBase<SimProtocol>;

// ────────────────────────────────────────────────────────────────────────────
// Simulated port
// ────────────────────────────────────────────────────────────────────────────

/// Kinematic state kept by a [`SimAxisPort`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimAxisState {
    pub enabled: bool,
    /// Motor rpm as last commanded.
    pub rpm: i32,
    pub fault_code: Option<u16>,
    pub warning: bool,
}

/// A simulated axis transport that records every frame it is sent.
pub struct SimAxisPort {
    axis: AxisId,
    node_id: u16,
    state: Mutex<SimAxisState>,
    commands: Mutex<Vec<SimCommand>>,
    attempts: AtomicU32,
    fail_next: AtomicU32,
    offline: AtomicBool,
    closes: AtomicU32,
}

impl SimAxisPort {
    pub fn new(axis: AxisId, node_id: u16) -> Arc<Self> {
        Arc::new(Self {
            axis,
            node_id,
            state: Mutex::new(SimAxisState::default()),
            commands: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            fail_next: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            closes: AtomicU32::new(0),
        })
    }

    /// Fail the next `n` send/request attempts with a transport error.
    pub fn inject_failures(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every attempt until set back to `false`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_fault(&self, code: Option<u16>) {
        self.state.lock().fault_code = code;
    }

    pub fn set_warning(&self, warning: bool) {
        self.state.lock().warning = warning;
    }

    pub fn state(&self) -> SimAxisState {
        self.state.lock().clone()
    }

    /// Every successfully delivered command, oldest first.
    pub fn commands(&self) -> Vec<SimCommand> {
        self.commands.lock().clone()
    }

    /// Delivered speed commands only, in motor rpm.
    pub fn speeds(&self) -> Vec<i32> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                SimCommand::Speed { rpm, .. } => Some(*rpm),
                _ => None,
            })
            .collect()
    }

    /// Send and request attempts, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    fn admit_attempt(&self) -> Result<(), SingulaError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(self.link_error("node not responding"));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(self.link_error("injected failure"));
        }
        Ok(())
    }

    fn link_error(&self, details: &str) -> SingulaError {
        SingulaError::Transport {
            axis: self.axis,
            details: details.to_string(),
        }
    }

    fn apply(&self, command: SimCommand) {
        let mut state = self.state.lock();
        match command {
            SimCommand::Enable { .. } => state.enabled = true,
            SimCommand::Disable { .. } => {
                state.enabled = false;
                state.rpm = 0;
            }
            SimCommand::Stop { .. } => state.rpm = 0,
            SimCommand::Speed { rpm, .. } => state.rpm = rpm,
            SimCommand::Home { .. } | SimCommand::Ramp { .. } | SimCommand::StatusRequest { .. } => {
            }
        }
        drop(state);
        self.commands.lock().push(command);
    }
}

#[async_trait]
impl AxisPort for SimAxisPort {
    async fn send(&self, frame: &[u8]) -> Result<(), SingulaError> {
        self.admit_attempt()?;
        let command = SimProtocol::decode_command(frame)
            .ok_or_else(|| self.link_error("malformed command frame"))?;
        self.apply(command);
        Ok(())
    }

    async fn request(&self, frame: &[u8], response: &mut [u8]) -> Result<usize, SingulaError> {
        self.admit_attempt()?;
        match SimProtocol::decode_command(frame) {
            Some(SimCommand::StatusRequest { node }) => {
                let reply = SimProtocol::encode_reply(node, &self.state.lock());
                let n = reply.len().min(response.len());
                response[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            _ => Err(self.link_error("unsupported request frame")),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated bus
// ────────────────────────────────────────────────────────────────────────────

/// A simulated bus controller.  Node ids are `index + 1`.
pub struct SimBus {
    axis_count: i32,
    reversed: HashSet<u16>,
    ports: Mutex<HashMap<u16, Arc<SimAxisPort>>>,
    initialized: AtomicU32,
    resets: AtomicU32,
    closed: AtomicU32,
}

impl SimBus {
    pub fn new(axis_count: i32) -> Self {
        Self {
            axis_count,
            reversed: HashSet::new(),
            ports: Mutex::new(HashMap::new()),
            initialized: AtomicU32::new(0),
            resets: AtomicU32::new(0),
            closed: AtomicU32::new(0),
        }
    }

    /// Mark `node_id` as mounted mirrored.
    pub fn with_reversed(mut self, node_id: u16) -> Self {
        self.reversed.insert(node_id);
        self
    }

    /// Node ids the bus will report, in index order.
    pub fn node_ids(&self) -> Vec<u16> {
        (0..self.axis_count.max(0) as u16)
            .map(|i| self.translate_node_id(i))
            .collect()
    }

    /// The port opened for `node_id`, if any.
    pub fn port(&self, node_id: u16) -> Option<Arc<SimAxisPort>> {
        self.ports.lock().get(&node_id).cloned()
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn initialize_count(&self) -> u32 {
        self.initialized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusAdapter for SimBus {
    async fn initialize(&self) -> Result<(), SingulaError> {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn axis_count(&self) -> Result<i32, SingulaError> {
        Ok(self.axis_count)
    }

    fn translate_node_id(&self, index: u16) -> u16 {
        index + 1
    }

    fn should_reverse(&self, node_id: u16) -> bool {
        self.reversed.contains(&node_id)
    }

    async fn open_port(&self, axis: AxisId, node_id: u16) -> Result<Arc<dyn AxisPort>, SingulaError> {
        let port = Arc::clone(
            self.ports
                .lock()
                .entry(node_id)
                .or_insert_with(|| SimAxisPort::new(axis, node_id)),
        );
        Ok(port)
    }

    async fn reset(&self) -> Result<(), SingulaError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        for port in self.ports.lock().values() {
            port.set_fault(None);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SingulaError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frames_decode_back() {
        let p = SimProtocol;
        assert_eq!(
            SimProtocol::decode_command(&p.encode_speed(7, -1200)),
            Some(SimCommand::Speed { node: 7, rpm: -1200 })
        );
        assert_eq!(
            SimProtocol::decode_command(&p.encode_ramp(2, 70_000, 500)),
            Some(SimCommand::Ramp {
                node: 2,
                accel: u16::MAX,
                decel: 500
            })
        );
    }

    #[test]
    fn corrupt_frame_is_rejected() {
        let mut frame = SimProtocol.encode_enable(1);
        frame[8] ^= 0xFF;
        assert_eq!(SimProtocol::decode_command(&frame), None);
    }

    #[test]
    fn status_reply_carries_fault_code() {
        let state = SimAxisState {
            enabled: true,
            rpm: 900,
            fault_code: Some(0x31),
            warning: false,
        };
        let reply = SimProtocol::encode_reply(4, &state);
        let report = SimProtocol.decode_status(AxisId(3), 4, &reply).unwrap();
        assert!(report.enabled);
        assert_eq!(report.fault_code, Some(0x31));
        assert!((report.actual_rpm - 900.0).abs() < f64::EPSILON);
    }

    #[test]
    fn status_reply_from_wrong_node_is_protocol_error() {
        let reply = SimProtocol::encode_reply(5, &SimAxisState::default());
        let err = SimProtocol.decode_status(AxisId(0), 1, &reply).unwrap_err();
        assert!(matches!(err, SingulaError::Protocol { .. }));
    }

    #[tokio::test]
    async fn port_applies_commands_and_answers_status() {
        let port = SimAxisPort::new(AxisId(0), 1);
        let p = SimProtocol;
        port.send(&p.encode_enable(1)).await.unwrap();
        port.send(&p.encode_speed(1, 1500)).await.unwrap();

        let mut buf = [0u8; FRAME_LEN];
        let n = port.request(&p.encode_status_request(1), &mut buf).await.unwrap();
        let report = p.decode_status(AxisId(0), 1, &buf[..n]).unwrap();
        assert!(report.enabled);
        assert!((report.actual_rpm - 1500.0).abs() < f64::EPSILON);
        assert_eq!(port.speeds(), vec![1500]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let port = SimAxisPort::new(AxisId(0), 1);
        port.inject_failures(2);
        let frame = SimProtocol.encode_stop(1);
        assert!(port.send(&frame).await.is_err());
        assert!(port.send(&frame).await.is_err());
        assert!(port.send(&frame).await.is_ok());
        assert_eq!(port.attempts(), 3);
    }

    #[tokio::test]
    async fn bus_reuses_ports_and_clears_faults_on_reset() {
        let bus = SimBus::new(2).with_reversed(2);
        assert!(bus.should_reverse(2));
        assert!(!bus.should_reverse(1));

        bus.open_port(AxisId(0), 1).await.unwrap();
        let port = bus.port(1).unwrap();
        port.set_fault(Some(9));
        bus.reset().await.unwrap();
        assert_eq!(port.state().fault_code, None);
        assert_eq!(bus.reset_count(), 1);
    }
}
