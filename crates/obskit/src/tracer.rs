//! Tracer facade, sampler selection and the OTLP tracing pipeline.
//!
//! A [`Tracer`] is either backed by an OpenTelemetry SDK provider or is a
//! no-op; the variant is fixed at construction so call sites never branch on
//! whether tracing is enabled.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::global::BoxedTracer;
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::noop::NoopTracer;
use opentelemetry::trace::{
    SpanBuilder, SpanKind, TraceContextExt, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};

use crate::config::TracingConfig;
use crate::error::ObservabilityError;
use crate::orchestrator::Pipeline;
use crate::resource::{require_runtime, service_resource};

/// Hex trace ID of the span active in `cx`, or `""` when there is none.
pub fn trace_id(cx: &Context) -> String {
    let span = cx.span();
    let span_context = span.span_context();
    if span_context.is_valid() {
        span_context.trace_id().to_string()
    } else {
        String::new()
    }
}

/// Hex span ID of the span active in `cx`, or `""` when there is none.
pub fn span_id(cx: &Context) -> String {
    let span = cx.span();
    let span_context = span.span_context();
    if span_context.is_valid() {
        span_context.span_id().to_string()
    } else {
        String::new()
    }
}

/// Pick a sampler for a configured rate.
///
/// `rate >= 1.0` records everything, `rate <= 0.0` (or NaN) records nothing,
/// anything in between samples by trace ID ratio.
pub fn select_sampler(rate: f64) -> Sampler {
    if rate.is_nan() || rate <= 0.0 {
        Sampler::AlwaysOff
    } else if rate >= 1.0 {
        Sampler::AlwaysOn
    } else {
        Sampler::TraceIdRatioBased(rate)
    }
}

/// Options applied to a new span.
#[derive(Debug, Clone)]
pub struct SpanOptions {
    pub kind: SpanKind,
    pub attributes: Vec<KeyValue>,
}

impl Default for SpanOptions {
    fn default() -> Self {
        Self {
            kind: SpanKind::Internal,
            attributes: Vec::new(),
        }
    }
}

impl SpanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.attributes.extend(attributes);
        self
    }
}

enum Backend {
    Sdk(BoxedTracer),
    Noop(NoopTracer),
}

struct TracerInner {
    name: String,
    backend: Backend,
    propagator: TextMapCompositePropagator,
}

/// Span factory bound to a service name.
///
/// Cheap to clone; clones share the underlying tracer.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// A tracer that creates non-recording spans. Spans started under a valid
    /// parent keep the parent's IDs, so correlation still flows through.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::build(name.into(), Backend::Noop(NoopTracer::new()))
    }

    /// A tracer drawing spans from an SDK provider.
    pub fn from_provider(provider: &SdkTracerProvider, name: impl Into<String>) -> Self {
        let name = name.into();
        let tracer = provider.tracer(name.clone());
        Self::build(name, Backend::Sdk(BoxedTracer::new(Box::new(tracer))))
    }

    fn build(name: String, backend: Backend) -> Self {
        let propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>> = vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ];
        Self {
            inner: Arc::new(TracerInner {
                name,
                backend,
                propagator: TextMapCompositePropagator::new(propagators),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `false` for the no-op variant.
    pub fn is_enabled(&self) -> bool {
        matches!(self.inner.backend, Backend::Sdk(_))
    }

    /// Start a span as a child of the span active in `cx` (or a new root).
    ///
    /// The returned context carries the new span: reach it with
    /// `cx.span()` and finish it with `cx.span().end()`.
    pub fn start_span(
        &self,
        cx: &Context,
        name: impl Into<Cow<'static, str>>,
        options: SpanOptions,
    ) -> Context {
        let builder = SpanBuilder::from_name(name)
            .with_kind(options.kind)
            .with_attributes(options.attributes);

        match &self.inner.backend {
            Backend::Sdk(tracer) => cx.with_span(tracer.build_with_context(builder, cx)),
            Backend::Noop(tracer) => cx.with_span(tracer.build_with_context(builder, cx)),
        }
    }

    pub fn trace_id(&self, cx: &Context) -> String {
        trace_id(cx)
    }

    pub fn span_id(&self, cx: &Context) -> String {
        span_id(cx)
    }

    /// Write W3C `traceparent`/`tracestate` and `baggage` headers for `cx`.
    pub fn inject(&self, cx: &Context, carrier: &mut HashMap<String, String>) {
        self.inner.propagator.inject_context(cx, carrier);
    }

    /// Rebuild a remote parent context from propagation headers.
    pub fn extract(&self, carrier: &HashMap<String, String>) -> Context {
        self.inner
            .propagator
            .extract_with_context(&Context::new(), carrier)
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("name", &self.inner.name)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Export side of tracing: owns the SDK provider and its batch exporter.
pub enum TracePipeline {
    Otlp(SdkTracerProvider),
    Disabled,
}

impl TracePipeline {
    /// Build the tracer and its pipeline. Disabled tracing yields a no-op
    /// tracer bound to the service name.
    ///
    /// Enabled tracing must be set up inside a tokio runtime; without one
    /// this returns [`ObservabilityError::Exporter`].
    pub fn setup(config: &TracingConfig) -> Result<(Tracer, TracePipeline), ObservabilityError> {
        if !config.enabled {
            return Ok((Tracer::noop(config.service_name.clone()), TracePipeline::Disabled));
        }

        require_runtime("trace")?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(config.endpoint.clone())
            .build()
            .map_err(|e| ObservabilityError::Exporter {
                signal: "trace",
                reason: e.to_string(),
            })?;

        let provider = SdkTracerProvider::builder()
            .with_sampler(select_sampler(config.sampling_rate))
            .with_batch_exporter(exporter)
            .with_resource(service_resource(
                &config.service_name,
                &config.service_version,
                &config.environment,
            ))
            .build();

        let tracer = Tracer::from_provider(&provider, config.service_name.clone());
        Ok((tracer, TracePipeline::Otlp(provider)))
    }
}

impl Pipeline for TracePipeline {
    fn shutdown(&self, timeout: Duration) -> Result<(), ObservabilityError> {
        match self {
            Self::Otlp(provider) => {
                provider
                    .shutdown_with_timeout(timeout)
                    .map_err(|e| ObservabilityError::Shutdown {
                        component: "tracer",
                        reason: e.to_string(),
                    })
            }
            Self::Disabled => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

    fn sdk_tracer() -> (Tracer, SdkTracerProvider) {
        let provider = SdkTracerProvider::builder().build();
        (Tracer::from_provider(&provider, "checkout"), provider)
    }

    fn remote_parent() -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ))
    }

    #[test]
    fn sampler_selection() {
        assert!(matches!(select_sampler(1.0), Sampler::AlwaysOn));
        assert!(matches!(select_sampler(3.5), Sampler::AlwaysOn));
        assert!(matches!(select_sampler(0.0), Sampler::AlwaysOff));
        assert!(matches!(select_sampler(-0.2), Sampler::AlwaysOff));
        assert!(matches!(select_sampler(f64::NAN), Sampler::AlwaysOff));
        assert!(matches!(select_sampler(0.25), Sampler::TraceIdRatioBased(r) if r == 0.25));
    }

    #[test]
    fn ids_are_empty_without_span() {
        let cx = Context::new();
        assert_eq!(trace_id(&cx), "");
        assert_eq!(span_id(&cx), "");
    }

    #[test]
    fn ids_are_fixed_width_hex_with_span() {
        let (tracer, _provider) = sdk_tracer();
        let cx = tracer.start_span(&Context::new(), "charge", SpanOptions::new());

        let trace = tracer.trace_id(&cx);
        let span = tracer.span_id(&cx);
        assert_eq!(trace.len(), 32);
        assert_eq!(span.len(), 16);
        assert!(trace.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(span.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        cx.span().end();
    }

    #[test]
    fn child_spans_share_the_trace() {
        let (tracer, _provider) = sdk_tracer();
        let parent = tracer.start_span(
            &Context::new(),
            "request",
            SpanOptions::new().with_kind(SpanKind::Server),
        );
        let child = tracer.start_span(
            &parent,
            "db.query",
            SpanOptions::new().with_attributes([KeyValue::new("db.system", "postgresql")]),
        );

        assert_eq!(trace_id(&child), trace_id(&parent));
        assert_ne!(span_id(&child), span_id(&parent));
    }

    #[test]
    fn noop_tracer_is_usable() {
        let tracer = Tracer::noop("checkout");
        assert!(!tracer.is_enabled());
        assert_eq!(tracer.name(), "checkout");

        let cx = tracer.start_span(&Context::new(), "work", SpanOptions::new());
        assert_eq!(tracer.trace_id(&cx), "");
        cx.span().end();
    }

    #[test]
    fn noop_tracer_keeps_parent_ids() {
        let tracer = Tracer::noop("checkout");
        let cx = tracer.start_span(&remote_parent(), "work", SpanOptions::new());
        assert_eq!(tracer.trace_id(&cx), "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[test]
    fn propagation_round_trip() {
        let (tracer, _provider) = sdk_tracer();
        let cx = tracer.start_span(&Context::new(), "outbound", SpanOptions::new());

        let mut headers = HashMap::new();
        tracer.inject(&cx, &mut headers);
        let traceparent = headers.get("traceparent").unwrap();
        assert!(traceparent.starts_with(&format!("00-{}-{}-", trace_id(&cx), span_id(&cx))));

        let remote = tracer.extract(&headers);
        assert_eq!(trace_id(&remote), trace_id(&cx));
        assert_eq!(span_id(&remote), span_id(&cx));
    }

    #[test]
    fn disabled_pipeline_is_noop() {
        let config = TracingConfig {
            service_name: "checkout".into(),
            ..TracingConfig::default()
        };
        let (tracer, pipeline) = TracePipeline::setup(&config).unwrap();
        assert!(!tracer.is_enabled());
        assert_eq!(tracer.name(), "checkout");
        assert!(matches!(pipeline, TracePipeline::Disabled));
        pipeline.shutdown(Duration::from_secs(1)).unwrap();
    }
}
