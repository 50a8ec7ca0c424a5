//! `singula-hal` – axis command and concurrency layer
//!
//! Everything between "the machine wants roller N at 1200 rpm" and the bytes
//! on the vendor link.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`port`] | Transport, bus and vendor-protocol seams |
//! | [`events`] | Per-drive event handler lists |
//! | [`drive`] | [`AxisDrive`] trait and the shared [`AxisDriveBase`] (throttle, retry, status) |
//! | [`command_queue`] | Per-axis coalescing queue with stop priority |
//! | [`registry`] | Vendor-keyed drive factories |
//! | [`aggregator`] | Non-blocking fan-out of drive events |
//! | [`controller`] | Fleet orchestration and the [`FleetControl`] trait |
//! | [`sim`] | Simulated vendor for tests and the demo host |

pub mod aggregator;
pub mod command_queue;
pub mod controller;
pub mod drive;
pub mod events;
pub mod port;
pub mod registry;
pub mod sim;

pub use aggregator::{AxisEventAggregator, AxisEventHandler, SubscriberId};
pub use command_queue::AxisCommandQueue;
pub use controller::{AxisController, FleetControl, FleetOutcome};
pub use drive::{AxisDrive, AxisDriveBase, DriveContext};
pub use events::{DriveEvents, EventHandler, HandlerId};
pub use port::{AxisPort, AxisProtocol, BusAdapter};
pub use registry::{DriveFactory, DriveRegistry};
pub use sim::{SimAxisPort, SimBus, SimProtocol};
