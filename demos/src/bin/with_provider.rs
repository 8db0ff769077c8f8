//! # with_provider
//!
//! Full lifecycle: initialize logging, tracing and metrics, handle a few
//! simulated requests, then shut everything down.
//!
//! Run with:
//! ```sh
//! cargo run --bin with_provider
//!
//! # Export to a local collector:
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 cargo run --bin with_provider
//!
//! # Human-readable logs:
//! LOG_FORMAT=console LOG_LEVEL=debug cargo run --bin with_provider
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use obskit::{ObservabilityConfig, Orchestrator, Provider, SpanOptions};
use opentelemetry::trace::{SpanKind, TraceContextExt};
use opentelemetry::{Context, KeyValue};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = ObservabilityConfig::default();
    config.service.name = "demo-api".into();
    config.service.version = env!("CARGO_PKG_VERSION").into();
    config.service.environment = "local".into();
    // Setting an endpoint is what turns export on for the demo.
    let exporting = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();
    config.tracing.enabled = exporting;
    config.metrics.enabled = exporting;
    config.metrics.export_interval_secs = 5;
    let config = config.apply_env();

    let orchestrator = Orchestrator::new();
    let (provider, cleanup) = orchestrator.initialize_from(config)?;
    let logger = provider.logger().with(&[KeyValue::new("component", "demo")]);

    logger.info(
        &Context::new(),
        "demo starting",
        &[
            KeyValue::new("service", provider.service_name().to_string()),
            KeyValue::new("exporting", exporting),
        ],
    );

    let in_flight = Arc::new(AtomicU64::new(0));
    let gauge_source = Arc::clone(&in_flight);
    provider.metrics().create_gauge("demo.requests.in_flight", "Requests being handled", move || {
        gauge_source.load(Ordering::Relaxed) as f64
    })?;
    provider
        .metrics()
        .create_histogram("demo.payload.size", "Request payload size", "By")?;

    let tasks: Vec<_> = (0..4)
        .map(|id| {
            let provider = provider.clone();
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move {
                in_flight.fetch_add(1, Ordering::Relaxed);
                handle_request(&provider, id).await;
                in_flight.fetch_sub(1, Ordering::Relaxed);
            })
        })
        .collect();
    for task in tasks {
        task.await?;
    }

    logger.info(&Context::new(), "demo finished", &[]);

    // Shutdown blocks on exporter flushes.
    let ran = tokio::task::spawn_blocking(move || cleanup.shutdown()).await?;
    println!("cleanup ran: {ran}, state: {}", orchestrator.state());
    Ok(())
}

async fn handle_request(provider: &Provider, id: u64) {
    let tracer = provider.tracer();
    let metrics = provider.metrics();
    let logger = provider.logger();

    let cx = tracer.start_span(
        &Context::new(),
        "GET /orders",
        SpanOptions::new()
            .with_kind(SpanKind::Server)
            .with_attributes([KeyValue::new("request.id", id as i64)]),
    );
    let timer = metrics.measure_duration(
        &cx,
        "demo.request.duration",
        &[KeyValue::new("route", "/orders")],
    );

    logger.info(&cx, "handling request", &[KeyValue::new("request_id", id as i64)]);
    if let Err(e) =
        metrics.increment_counter(&cx, "demo.requests", 1, &[KeyValue::new("route", "/orders")])
    {
        logger.warn(&cx, "counter rejected", &[KeyValue::new("error", e.to_string())]);
    }
    let _ = metrics.record_histogram(&cx, "demo.payload.size", 256.0 * (id + 1) as f64, &[]);

    // Downstream call carrying the trace in its headers.
    let downstream = tracer.start_span(
        &cx,
        "inventory.lookup",
        SpanOptions::new().with_kind(SpanKind::Client),
    );
    let mut headers = HashMap::new();
    tracer.inject(&downstream, &mut headers);
    logger.debug(
        &downstream,
        "calling inventory",
        &[KeyValue::new("traceparent", headers.get("traceparent").cloned().unwrap_or_default())],
    );
    tokio::time::sleep(Duration::from_millis(10 * (id + 1))).await;
    downstream.span().end();

    let seconds = timer.stop();
    logger.debug(&cx, "request done", &[KeyValue::new("seconds", seconds)]);
    cx.span().end();
}
