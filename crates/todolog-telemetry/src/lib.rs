//! Tracing setup and trace-context propagation for todolog.
//!
//! Every binary calls [`init_tracing`] once at startup: it installs an
//! `EnvFilter` (from `RUST_LOG`, falling back to the given default) and a
//! stderr fmt layer. With the `telemetry` feature, an OpenTelemetry layer is
//! added when the standard OTel environment variables ask for export:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 cargo run -p todolog-server
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to explicitly disable even when the endpoint is set.
//!
//! Trace context crosses the HTTP boundary between the client and the mutation
//! RPC as W3C `traceparent` / `tracestate` headers. Without the feature the
//! propagation helpers are inert.

#[cfg(feature = "telemetry")]
mod otel;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "telemetry")]
pub use otel::OtelGuard;

/// W3C trace context header names.
pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Keeps exporters alive; flushes pending spans on drop.
#[must_use = "dropping the guard shuts down span export"]
pub struct TracingGuard {
    #[cfg(feature = "telemetry")]
    _otel: Option<OtelGuard>,
}

/// Install the global subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset. Calling this twice is
/// harmless; the second call leaves the first subscriber in place.
pub fn init_tracing(service_name: &str, default_filter: &str) -> TracingGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    if otel_enabled() {
        match otel::otel_layer(service_name) {
            Ok((layer, guard)) => {
                let _ = registry.with(layer).try_init();
                return TracingGuard { _otel: Some(guard) };
            }
            Err(e) => {
                let _ = registry.try_init();
                tracing::warn!(error = %e, "OTel export requested but exporter failed to build");
                return TracingGuard { _otel: None };
            }
        }
    }

    let _ = service_name;
    let _ = registry.try_init();
    TracingGuard {
        #[cfg(feature = "telemetry")]
        _otel: None,
    }
}

/// Check whether OTel export should be enabled.
///
/// Returns `true` when standard OTel env vars indicate export is desired:
/// - `OTEL_SDK_DISABLED` is NOT set to `"true"`
/// - AND at least one of:
///   - `OTEL_EXPORTER_OTLP_ENDPOINT` is set
///   - `OTEL_TRACES_EXPORTER` is set (and not `"none"`)
pub fn otel_enabled() -> bool {
    if std::env::var("OTEL_SDK_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return false;
    }

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        return true;
    }

    if let Ok(exporter) = std::env::var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }

    false
}

/// Inject W3C Trace Context from the current tracing span.
///
/// Returns `(traceparent, tracestate)`; both empty when there is nothing to
/// propagate.
pub fn inject_trace_context() -> (String, String) {
    #[cfg(feature = "telemetry")]
    {
        otel::inject_trace_context_impl()
    }
    #[cfg(not(feature = "telemetry"))]
    {
        (String::new(), String::new())
    }
}

/// Extract W3C Trace Context and create a request span linked to the remote
/// parent. `name` labels the operation being served.
pub fn extract_trace_context(traceparent: &str, tracestate: &str, name: &str) -> tracing::Span {
    #[cfg(feature = "telemetry")]
    {
        otel::extract_trace_context_impl(traceparent, tracestate, name)
    }
    #[cfg(not(feature = "telemetry"))]
    {
        let _ = (traceparent, tracestate);
        tracing::info_span!("mutation.request", method = name)
    }
}
