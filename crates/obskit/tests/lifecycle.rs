//! End-to-end initialization and shutdown through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use obskit::{
    Bootstrap, LifecycleState, LogConfig, LogLevel, Logger, MemorySink, Metrics, MetricsConfig,
    ObservabilityConfig, ObservabilityError, Orchestrator, Pipeline, SpanOptions, Stage, Tracer,
    TracingConfig,
};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::{Context, KeyValue};
use serde_json::Value;

/// Shared log of what the bootstrap and its pipeline were asked to do.
#[derive(Clone, Default)]
struct Calls(Arc<Mutex<Vec<&'static str>>>);

impl Calls {
    fn push(&self, call: &'static str) {
        self.0.lock().unwrap().push(call);
    }

    fn all(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

struct RecordingPipeline {
    calls: Calls,
    shutdowns: Arc<AtomicUsize>,
    fail: bool,
}

impl Pipeline for RecordingPipeline {
    fn shutdown(&self, _timeout: Duration) -> Result<(), ObservabilityError> {
        self.calls.push("tracer.shutdown");
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ObservabilityError::Shutdown {
                component: "tracer",
                reason: "collector unreachable".into(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MockBootstrap {
    sink: MemorySink,
    calls: Calls,
    tracer_shutdowns: Arc<AtomicUsize>,
    fail_tracer: bool,
    fail_metrics: bool,
    fail_tracer_shutdown: bool,
}

impl Bootstrap for MockBootstrap {
    fn logger(&self, _config: &LogConfig) -> Result<Logger, ObservabilityError> {
        self.calls.push("logger");
        Logger::new(&LogConfig::memory(LogLevel::Debug, self.sink.clone()))
    }

    fn tracer(
        &self,
        config: &TracingConfig,
    ) -> Result<(Tracer, Box<dyn Pipeline>), ObservabilityError> {
        self.calls.push("tracer");
        if self.fail_tracer {
            return Err(ObservabilityError::Exporter {
                signal: "trace",
                reason: "invalid endpoint".into(),
            });
        }
        let pipeline = RecordingPipeline {
            calls: self.calls.clone(),
            shutdowns: Arc::clone(&self.tracer_shutdowns),
            fail: self.fail_tracer_shutdown,
        };
        Ok((Tracer::noop(config.service_name.clone()), Box::new(pipeline)))
    }

    fn metrics(
        &self,
        _config: &MetricsConfig,
        logger: &Logger,
    ) -> Result<Metrics, ObservabilityError> {
        self.calls.push("metrics");
        if self.fail_metrics {
            return Err(ObservabilityError::Exporter {
                signal: "metric",
                reason: "invalid endpoint".into(),
            });
        }
        Ok(Metrics::disabled(logger.clone()))
    }
}

fn tracing_config() -> TracingConfig {
    TracingConfig {
        service_name: "inventory".into(),
        service_version: "2.0.1".into(),
        ..TracingConfig::default()
    }
}

fn initialize(
    bootstrap: &MockBootstrap,
) -> Result<(obskit::Provider, obskit::Cleanup), ObservabilityError> {
    Orchestrator::with_bootstrap(bootstrap.clone()).initialize(
        &LogConfig::default(),
        &tracing_config(),
        &MetricsConfig::default(),
    )
}

fn messages(sink: &MemorySink) -> Vec<String> {
    sink.lines()
        .iter()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|entry| entry["message"].as_str().map(str::to_string))
        .collect()
}

#[test]
fn constructs_in_order() {
    let bootstrap = MockBootstrap::default();
    let (provider, _cleanup) = initialize(&bootstrap).unwrap();

    assert_eq!(bootstrap.calls.all(), vec!["logger", "tracer", "metrics"]);
    assert_eq!(provider.service_name(), "inventory");
    assert_eq!(provider.tracer().name(), "inventory");
}

#[test]
fn tracer_failure_skips_metrics() {
    let bootstrap = MockBootstrap {
        fail_tracer: true,
        ..MockBootstrap::default()
    };
    let err = initialize(&bootstrap).unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Tracer));
    assert!(err.to_string().starts_with("failed to initialize tracer"));
    assert_eq!(bootstrap.calls.all(), vec!["logger", "tracer"]);
}

#[test]
fn metrics_failure_shuts_tracer_down_first() {
    let bootstrap = MockBootstrap {
        fail_metrics: true,
        ..MockBootstrap::default()
    };
    let orchestrator = Orchestrator::with_bootstrap(bootstrap.clone());
    let err = orchestrator
        .initialize(&LogConfig::default(), &tracing_config(), &MetricsConfig::default())
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Metrics));
    assert_eq!(
        bootstrap.calls.all(),
        vec!["logger", "tracer", "metrics", "tracer.shutdown"]
    );
    assert_eq!(bootstrap.tracer_shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.state(), LifecycleState::Unstarted);
}

#[test]
fn failed_initialize_can_be_retried() {
    let failing = MockBootstrap {
        fail_metrics: true,
        ..MockBootstrap::default()
    };
    let orchestrator = Orchestrator::with_bootstrap(failing);
    assert!(orchestrator
        .initialize(&LogConfig::default(), &tracing_config(), &MetricsConfig::default())
        .is_err());

    // The state went back to unstarted, so the entry point is usable again.
    let second = orchestrator
        .initialize(&LogConfig::default(), &tracing_config(), &MetricsConfig::default())
        .unwrap_err();
    assert_eq!(second.stage(), Some(Stage::Metrics));
}

#[test]
fn cleanup_is_idempotent() {
    let bootstrap = MockBootstrap::default();
    let (_provider, cleanup) = initialize(&bootstrap).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cleanup = cleanup.clone();
            std::thread::spawn(move || cleanup.shutdown())
        })
        .collect();
    let ran: usize = handles
        .into_iter()
        .map(|h| usize::from(h.join().unwrap()))
        .sum();

    assert_eq!(ran, 1);
    assert_eq!(bootstrap.tracer_shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(bootstrap.sink.flush_count(), 1);
}

#[test]
fn shutdown_failures_are_logged_not_raised() {
    let bootstrap = MockBootstrap {
        fail_tracer_shutdown: true,
        ..MockBootstrap::default()
    };
    let (_provider, cleanup) = initialize(&bootstrap).unwrap();

    assert!(cleanup.shutdown_with_timeout(Duration::from_millis(100)));
    assert!(messages(&bootstrap.sink).contains(&"error shutting down tracer".to_string()));
    // The logger is still synced after the tracer failed.
    assert_eq!(bootstrap.sink.flush_count(), 1);
}

#[test]
fn disabled_end_to_end_with_memory_sink() {
    let sink = MemorySink::new();
    let mut config = ObservabilityConfig::default();
    config.logging = LogConfig::memory(LogLevel::Info, sink.clone());
    config.service.name = "billing".into();
    config.service.version = "0.9.0".into();

    let orchestrator = Orchestrator::new();
    let (provider, cleanup) = orchestrator.initialize_from(config).unwrap();
    assert_eq!(provider.service_name(), "billing");

    let cx = provider
        .tracer()
        .start_span(&Context::new(), "charge", SpanOptions::new());
    provider
        .logger()
        .info(&cx, "charging card", &[KeyValue::new("amount", 1250_i64)]);
    provider
        .metrics()
        .increment_counter(&cx, "charges", 1, &[])
        .unwrap();
    provider
        .metrics()
        .measure_duration(&cx, "charge.duration", &[])
        .stop();
    cx.span().end();

    assert!(cleanup.shutdown());
    assert_eq!(orchestrator.state(), LifecycleState::ShutDown);
    assert_eq!(sink.flush_count(), 1);

    let entry: Value = serde_json::from_str(&sink.lines()[0]).unwrap();
    assert_eq!(entry["message"], "charging card");
    assert!(entry.get("trace_id").is_none());
}
