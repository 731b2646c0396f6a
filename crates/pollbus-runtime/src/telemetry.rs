//! Tracing setup for hosts that embed the adapter.
//!
//! [`init_tracing`] installs the global `tracing` subscriber: an `EnvFilter`
//! read from `RUST_LOG` (default `info`), a compact or JSON console layer, and,
//! when an OTLP endpoint is configured, a span exporter layer.
//!
//! # Example
//!
//! ```rust,no_run
//! use pollbus_runtime::config::AdapterConfig;
//! use pollbus_runtime::telemetry::init_tracing;
//!
//! let cfg = AdapterConfig::default();
//! // Keep the guard alive until the poll loop exits.
//! let _guard = init_tracing(&cfg.telemetry("my-daemon")).expect("tracing");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use pollbus_types::BusError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{AdapterConfig, LogFormat};

/// What [`init_tracing`] needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl AdapterConfig {
    /// Telemetry settings of this configuration for `service_name`.
    pub fn telemetry(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            service_name: service_name.to_string(),
            log_format: self.log_format,
            otlp_endpoint: self.otlp_endpoint.clone(),
        }
    }
}

/// Install the global subscriber.
///
/// If the OTLP exporter cannot be built, span export is skipped and console
/// logging still comes up. The returned guard flushes pending spans when
/// dropped.
///
/// # Errors
///
/// [`BusError::Config`] if a global subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<TracerProviderGuard, BusError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let provider = config
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| build_provider(&config.service_name, endpoint));
    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("pollbus")));

    let (json, compact) = match config.log_format {
        LogFormat::Json => (Some(fmt::layer().json()), None),
        LogFormat::Compact => (None, Some(fmt::layer().compact())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(otel)
        .with(json)
        .with(compact)
        .try_init()
        .map_err(|e| BusError::Config(format!("tracing already initialised: {e}")))?;

    Ok(TracerProviderGuard(provider))
}

/// Shuts the span exporter down when dropped. Hold it for the lifetime of
/// the poll loop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    /// Whether spans are being exported.
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[pollbus] span exporter shutdown failed: {e}");
        }
    }
}

fn build_provider(service_name: &str, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[pollbus] OTLP exporter unavailable: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // The poll loop has no async runtime, so spans are exported inline.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_settings_follow_adapter_config() {
        let cfg = AdapterConfig {
            log_format: LogFormat::Json,
            otlp_endpoint: Some("http://collector:4318".into()),
            ..AdapterConfig::default()
        };
        let t = cfg.telemetry("daemon");
        assert_eq!(t.service_name, "daemon");
        assert_eq!(t.log_format, LogFormat::Json);
        assert_eq!(t.otlp_endpoint.as_deref(), Some("http://collector:4318"));
    }

    #[test]
    fn second_init_is_rejected() {
        let cfg = AdapterConfig::default().telemetry("test");
        let first = init_tracing(&cfg).expect("first init");
        assert!(!first.is_exporting());
        assert!(matches!(init_tracing(&cfg), Err(BusError::Config(_))));
    }

    #[test]
    fn empty_guard_drops_quietly() {
        drop(TracerProviderGuard(None));
    }
}
