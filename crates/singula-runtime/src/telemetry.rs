//! Tracing bootstrap for Singula hosts.
//!
//! Call [`init_tracing`] once at process startup, before the Tokio runtime is
//! built, and keep the returned guard alive until exit.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `SINGULA_LOG_FORMAT=json` | Newline-delimited JSON logs instead of the compact format. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector URL (e.g. `http://localhost:4318`). Enables span export. |
//!
//! # Example
//!
//! ```rust,no_run
//! let _guard = singula_runtime::telemetry::init_tracing("singula");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON; anything else, or nothing, is compact.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Settings read from the environment by [`init_tracing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub service_name: String,
    pub format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl TelemetrySettings {
    pub fn from_env(service_name: &str) -> Self {
        Self::from_lookup(service_name, |key| std::env::var(key).ok())
    }

    fn from_lookup(service_name: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            service_name: service_name.to_string(),
            format: LogFormat::parse(lookup("SINGULA_LOG_FORMAT").as_deref()),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.trim().is_empty()),
        }
    }
}

/// Install the global subscriber: env filter, optional OTLP span export, and
/// the console formatter.
///
/// Installing twice (for example from a test harness) leaves the first
/// subscriber in place and reports the conflict on stderr.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let settings = TelemetrySettings::from_env(service_name);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let provider = settings
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| build_provider(&settings.service_name, endpoint));

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("singula")));
    let fmt_layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
    {
        eprintln!("[singula] tracing already initialised: {e}");
    }

    TracerProviderGuard(provider)
}

/// Shuts the OpenTelemetry provider down on drop, flushing pending spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[singula] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

/// `None` when the exporter cannot be built; the error goes to stderr since
/// tracing is not up yet.
fn build_provider(service_name: &str, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[singula] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // The host builds its Tokio runtime after this call, so the batch
    // exporter (which spawns tasks) cannot be used here.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
