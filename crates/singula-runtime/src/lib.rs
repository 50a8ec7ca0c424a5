//! `singula-runtime` – session wiring and process bootstrap
//!
//! # Modules
//!
//! - [`session`] – [`SingulationSession`][session::SingulationSession]:
//!   opens the axis fleet, the safety governor, the frame guard and the
//!   optional panel monitor as one unit, admits upstream frames and shuts
//!   everything down in reverse order.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod session;
pub mod telemetry;

pub use session::{SessionConfig, SingulationSession};
pub use telemetry::{LogFormat, TelemetrySettings, TracerProviderGuard, init_tracing};
