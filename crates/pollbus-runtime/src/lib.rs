//! `pollbus-runtime` – The poll-loop adapter
//!
//! Wires the registries from `pollbus-core` and the dispatch machinery from
//! `pollbus-dispatch` to live bus connections, and carries the ambient setup a
//! host daemon needs around them.
//!
//! # Modules
//!
//! - [`adapter`] – [`Adapter`][adapter::Adapter]: opens and attaches
//!   connections, builds and processes the `poll(2)` descriptor set, ticks the
//!   timers, serves objects and routes subscribed signals.
//! - [`config`] – [`AdapterConfig`][config::AdapterConfig]: loaded from
//!   `~/.pollbus/config.toml` with `POLLBUS_*` environment overrides.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter. Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable span export.
//!
//! # Example
//!
//! ```rust,no_run
//! use pollbus_runtime::{Adapter, config};
//!
//! let cfg = config::load().expect("config").unwrap_or_default();
//! let adapter = Adapter::new(cfg);
//! let set = adapter.build_poll_set().expect("poll set");
//! // poll(set.as_mut_slice(), ...) goes here.
//! adapter.process_poll_set(set).expect("process");
//! adapter.tick();
//! ```

pub mod adapter;
pub mod config;
pub mod telemetry;

pub use adapter::{Adapter, emit_signal};
pub use config::{AdapterConfig, LogFormat};
pub use telemetry::{TelemetryConfig, TracerProviderGuard, init_tracing};

/// Version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    #[test]
    fn version_matches_manifest() {
        assert_eq!(super::version(), "0.1.0");
    }
}
