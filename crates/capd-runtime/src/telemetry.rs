//! Logging and span export for the broker.
//!
//! The broker task opens one `command` span per queued command, tagged with
//! the command's wire name (`requestAPI`, `clientVanished`, …), and nests
//! the `request_api` / `release_api` / `client_vanished` spans below it.
//! [`init_tracing`] installs the subscriber those spans go to.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default [`DEFAULT_FILTER`]). |
//! | `CAPD_LOG_FORMAT` | `json` for newline-delimited JSON (journald, log shippers), anything else for compact text. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector base URL.  When set, broker spans are exported. |
//!
//! # Example
//!
//! ```rust,no_run
//! // Hold the guard until the process exits.
//! let _guard = capd_runtime::telemetry::init_tracing("capd");
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparseable.  zbus logs every
/// message it routes at `info`, which would drown the broker's own output.
pub const DEFAULT_FILTER: &str = "info,zbus=warn";

/// Instrumentation scope of the broker's spans.
const TRACER_NAME: &str = "capd-broker";

/// Console log rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

/// Everything [`init_tracing`] reads from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub service_name: String,
    pub filter: String,
    pub format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl TelemetrySettings {
    /// Resolve the settings through `env`.
    pub fn from_env(service_name: &str, env: impl Fn(&str) -> Option<String>) -> Self {
        let format = match env("CAPD_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };
        Self {
            service_name: service_name.to_string(),
            filter: env("RUST_LOG")
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            format,
            otlp_endpoint: env("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.trim().is_empty()),
        }
    }

    /// The OTel resource describing this broker process.
    pub fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes([
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("process.pid", i64::from(std::process::id())),
            ])
            .build()
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|e| {
            eprintln!("[capd] invalid RUST_LOG {:?}: {e}", self.filter);
            EnvFilter::new(DEFAULT_FILTER)
        })
    }
}

/// Install the global subscriber for `service_name`, configured from the
/// process environment.
///
/// The returned [`TracerProviderGuard`] **must** be held for the lifetime of
/// the process; dropping it flushes pending spans.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    init_with(&TelemetrySettings::from_env(service_name, |key| std::env::var(key).ok()))
}

/// [`init_tracing`] with explicit settings.
pub fn init_with(settings: &TelemetrySettings) -> TracerProviderGuard {
    let provider = settings.otlp_endpoint.as_deref().and_then(|endpoint| build_provider(settings, endpoint));
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(TRACER_NAME)));
    let fmt_layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(otel_layer)
        .with(fmt_layer)
        .init();

    TracerProviderGuard(provider)
}

/// Shuts down the OTel [`SdkTracerProvider`] on drop, flushing pending spans.
///
/// `std::process::exit` does not run destructors, so drop the guard
/// explicitly before exiting with the broker's exit code.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    /// `true` when spans are being exported.
    pub fn exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[capd] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

/// No subscriber exists yet, so failures go to stderr.
fn build_provider(settings: &TelemetrySettings, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[capd] OTLP exporter init failed: {e}"))
        .ok()?;

    Some(
        SdkTracerProvider::builder()
            .with_resource(settings.resource())
            // `capd` builds its Tokio runtime after tracing is up, so a
            // batch exporter would have no runtime to spawn its worker on.
            .with_simple_exporter(exporter)
            .build(),
    )
}
