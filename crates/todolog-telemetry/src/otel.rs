//! OpenTelemetry export: the OTLP layer, header propagation, and the sampler.

use std::collections::HashMap;

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::{ExporterBuildError, SpanExporter};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider, ShouldSample, SpanLimits};
use tracing_opentelemetry::{OpenTelemetryLayer, OpenTelemetrySpanExt};

/// Shuts down the tracer provider on drop, flushing pending spans.
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("OTel shutdown error: {e}");
        }
    }
}

/// Build an OpenTelemetry tracing layer and guard.
///
/// Must be called from inside a Tokio runtime; the batch exporter spawns onto it.
pub(crate) fn otel_layer<S>(
    service_name: &str,
) -> Result<(OpenTelemetryLayer<S, SdkTracer>, OtelGuard), ExporterBuildError>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let exporter = SpanExporter::builder().with_tonic().build()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(TodologSampler)
        .with_resource(resource)
        .with_span_limits(SpanLimits::default())
        .build();

    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer("todolog");
    let layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Ok((layer, OtelGuard { provider }))
}

// ============================================================================
// W3C Trace Context propagation
// ============================================================================

pub(crate) fn inject_trace_context_impl() -> (String, String) {
    let cx = tracing::Span::current().context();
    let mut carrier = HashMap::new();
    TraceContextPropagator::new().inject_context(&cx, &mut carrier);

    let traceparent = carrier.remove(crate::TRACEPARENT_HEADER).unwrap_or_default();
    let tracestate = carrier.remove(crate::TRACESTATE_HEADER).unwrap_or_default();
    (traceparent, tracestate)
}

pub(crate) fn extract_trace_context_impl(
    traceparent: &str,
    tracestate: &str,
    name: &str,
) -> tracing::Span {
    let span = tracing::info_span!("mutation.request", method = name);
    if traceparent.is_empty() {
        return span;
    }

    let mut carrier = HashMap::new();
    carrier.insert(crate::TRACEPARENT_HEADER.to_string(), traceparent.to_string());
    if !tracestate.is_empty() {
        carrier.insert(crate::TRACESTATE_HEADER.to_string(), tracestate.to_string());
    }

    let cx: Context = TraceContextPropagator::new().extract(&carrier);
    span.set_parent(cx);
    span
}

// ============================================================================
// TodologSampler: per-category sampling rates
// ============================================================================

/// Sampling rate by span name prefix.
///
/// | Prefix        | Rate | Notes                                 |
/// |---------------|------|---------------------------------------|
/// | `mutation.*`  | 100% | One span per write, low volume        |
/// | `session.*`   | 100% | Client-side mutation lifecycle        |
/// | `gateway.*`   | 10%  | One per shape request                 |
/// | `shape.*`     |  1%  | Long-poll and live stream plumbing    |
/// | errors        | 100% |                                       |
/// | other         | 10%  |                                       |
#[derive(Debug, Clone)]
struct TodologSampler;

impl ShouldSample for TodologSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        // A sampled parent keeps the trace whole.
        if let Some(cx) = parent_context {
            let parent_span = cx.span();
            let parent_ctx = parent_span.span_context();
            if parent_ctx.is_sampled() {
                return SamplingResult {
                    decision: SamplingDecision::RecordAndSample,
                    attributes: vec![],
                    trace_state: parent_ctx.trace_state().clone(),
                };
            }
        }

        let is_error = attributes.iter().any(|kv| {
            (kv.key.as_str() == "otel.status_code" && kv.value.as_str() == "ERROR")
                || (kv.key.as_str() == "error" && kv.value.as_str() == "true")
        });
        if is_error {
            return SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: vec![],
                trace_state: TraceState::default(),
            };
        }

        let rate = if name.starts_with("mutation") || name.starts_with("session") {
            1.0
        } else if name.starts_with("shape") {
            0.01
        } else {
            0.1
        };

        Sampler::TraceIdRatioBased(rate).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}
