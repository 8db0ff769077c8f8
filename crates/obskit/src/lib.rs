//! # obskit
//!
//! Structured logging, distributed tracing and metrics behind one
//! initialization call.
//!
//! # Overview
//!
//! - [`Logger`] — context-aware structured logs via `tracing-subscriber`,
//!   tagged with `trace_id`/`span_id` when a span is active
//! - [`Tracer`] — spans exported over OTLP/gRPC, or a no-op when disabled
//! - [`Metrics`] — counters, histograms and gauges created on first use
//! - [`Orchestrator`] — builds all three in order and returns a [`Provider`]
//!   plus an idempotent [`Cleanup`]
//!
//! ```no_run
//! use obskit::{LogConfig, MetricsConfig, TracingConfig};
//! use opentelemetry::Context;
//!
//! let (provider, cleanup) = obskit::initialize(
//!     &LogConfig::default(),
//!     &TracingConfig::default(),
//!     &MetricsConfig::default(),
//! )?;
//! provider.logger().info(&Context::new(), "ready", &[]);
//! cleanup.shutdown();
//! # Ok::<(), obskit::ObservabilityError>(())
//! ```
//!
//! Nothing is registered globally; facades are passed around explicitly.

pub mod config;
pub mod error;
mod format;
pub mod logger;
pub mod meter;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod resource;
pub mod sink;
pub mod tracer;

pub use config::{
    LogConfig, LogFormat, LogLevel, LogOutput, MetricsConfig, ObservabilityConfig, ServiceConfig,
    TracingConfig,
};
pub use error::{ObservabilityError, Stage};
pub use logger::Logger;
pub use meter::{MeterBackend, NoopMeter, OtelMeter};
pub use metrics::{DurationGuard, Metrics};
pub use orchestrator::{
    initialize, Bootstrap, Cleanup, LifecycleState, Orchestrator, OtlpBootstrap, Pipeline,
    SHUTDOWN_BUDGET,
};
pub use provider::Provider;
pub use sink::MemorySink;
pub use tracer::{SpanOptions, TracePipeline, Tracer};
