//! Initialization and shutdown sequencing.
//!
//! Components are constructed in a fixed order (logger, tracer, metrics) and
//! torn down in reverse through a single [`Cleanup`] handle:
//!
//! ```text
//! Unstarted ──initialize──▶ Initializing ──ok──▶ Running ──cleanup──▶ ShutDown
//!     ▲                          │
//!     └──────────error───────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use opentelemetry::{Context, KeyValue};

use crate::config::{LogConfig, MetricsConfig, ObservabilityConfig, TracingConfig};
use crate::error::{ObservabilityError, Stage};
use crate::logger::Logger;
use crate::metrics::Metrics;
use crate::provider::Provider;
use crate::tracer::{TracePipeline, Tracer};

/// Total time cleanup may spend across all components.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// An export pipeline that must be stopped at shutdown.
pub trait Pipeline: Send + Sync {
    fn shutdown(&self, timeout: Duration) -> Result<(), ObservabilityError>;
}

/// Lifecycle of an [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    Initializing,
    Running,
    ShutDown,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unstarted => write!(f, "unstarted"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ShutDown => write!(f, "shut down"),
        }
    }
}

/// Constructors for the three components.
///
/// [`OtlpBootstrap`] is what production code uses; a custom implementation
/// can substitute any stage.
pub trait Bootstrap: Send + Sync {
    fn logger(&self, config: &LogConfig) -> Result<Logger, ObservabilityError>;

    fn tracer(
        &self,
        config: &TracingConfig,
    ) -> Result<(Tracer, Box<dyn Pipeline>), ObservabilityError>;

    fn metrics(
        &self,
        config: &MetricsConfig,
        logger: &Logger,
    ) -> Result<Metrics, ObservabilityError>;
}

/// `tracing-subscriber` logging with OTLP/gRPC trace and metric export.
#[derive(Debug, Default, Clone, Copy)]
pub struct OtlpBootstrap;

impl Bootstrap for OtlpBootstrap {
    fn logger(&self, config: &LogConfig) -> Result<Logger, ObservabilityError> {
        Logger::new(config)
    }

    fn tracer(
        &self,
        config: &TracingConfig,
    ) -> Result<(Tracer, Box<dyn Pipeline>), ObservabilityError> {
        let (tracer, pipeline) = TracePipeline::setup(config)?;
        Ok((tracer, Box::new(pipeline)))
    }

    fn metrics(
        &self,
        config: &MetricsConfig,
        logger: &Logger,
    ) -> Result<Metrics, ObservabilityError> {
        Metrics::new(config, logger.clone())
    }
}

/// Builds a [`Provider`] exactly once and hands back its [`Cleanup`].
pub struct Orchestrator<B = OtlpBootstrap> {
    bootstrap: B,
    state: Arc<Mutex<LifecycleState>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::with_bootstrap(OtlpBootstrap)
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Bootstrap> Orchestrator<B> {
    pub fn with_bootstrap(bootstrap: B) -> Self {
        Self {
            bootstrap,
            state: Arc::new(Mutex::new(LifecycleState::Unstarted)),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Construct logger, tracer and metrics in that order.
    ///
    /// A failing stage is reported through [`ObservabilityError::Stage`].
    /// If metrics fail, the already running trace pipeline is shut down
    /// before the error is returned. On any failure the orchestrator goes
    /// back to [`LifecycleState::Unstarted`].
    pub fn initialize(
        &self,
        log: &LogConfig,
        tracing: &TracingConfig,
        metrics: &MetricsConfig,
    ) -> Result<(Provider, Cleanup), ObservabilityError> {
        self.transition(LifecycleState::Unstarted, LifecycleState::Initializing)?;

        match self.build(log, tracing, metrics) {
            Ok(started) => {
                self.set(LifecycleState::Running);
                Ok(started)
            }
            Err(e) => {
                self.set(LifecycleState::Unstarted);
                Err(e)
            }
        }
    }

    /// [`initialize`](Self::initialize) from one aggregated config.
    pub fn initialize_from(
        &self,
        config: ObservabilityConfig,
    ) -> Result<(Provider, Cleanup), ObservabilityError> {
        let (log, tracing, metrics) = config.into_parts();
        self.initialize(&log, &tracing, &metrics)
    }

    fn build(
        &self,
        log: &LogConfig,
        tracing: &TracingConfig,
        metrics_config: &MetricsConfig,
    ) -> Result<(Provider, Cleanup), ObservabilityError> {
        let logger = self
            .bootstrap
            .logger(log)
            .map_err(|e| e.at(Stage::Logger))?;

        let (tracer, pipeline) = self
            .bootstrap
            .tracer(tracing)
            .map_err(|e| e.at(Stage::Tracer))?;

        let metrics = match self.bootstrap.metrics(metrics_config, &logger) {
            Ok(metrics) => metrics,
            Err(e) => {
                if let Err(shutdown) = pipeline.shutdown(SHUTDOWN_BUDGET) {
                    logger.error(
                        &Context::new(),
                        "error shutting down tracer after metrics failed",
                        &[KeyValue::new("error", shutdown.to_string())],
                    );
                }
                return Err(e.at(Stage::Metrics));
            }
        };

        logger.debug(
            &Context::new(),
            "observability initialized",
            &[
                KeyValue::new("service", tracing.service_name.clone()),
                KeyValue::new("tracing", tracer.is_enabled()),
                KeyValue::new("metrics", metrics.is_enabled()),
            ],
        );

        let provider = Provider::new(
            logger.clone(),
            tracer,
            metrics.clone(),
            tracing.service_name.clone(),
            tracing.service_version.clone(),
        );
        let cleanup = Cleanup {
            inner: Arc::new(CleanupInner {
                logger,
                metrics,
                pipeline,
                done: AtomicBool::new(false),
                state: Arc::clone(&self.state),
            }),
        };
        Ok((provider, cleanup))
    }

    fn transition(
        &self,
        expected: LifecycleState,
        next: LifecycleState,
    ) -> Result<(), ObservabilityError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != expected {
            return Err(ObservabilityError::InvalidState {
                expected,
                actual: *state,
            });
        }
        *state = next;
        Ok(())
    }

    fn set(&self, next: LifecycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

/// Initialize with the production [`OtlpBootstrap`].
///
/// With tracing or metrics enabled this must run inside a tokio runtime;
/// otherwise the failing stage reports an exporter error.
pub fn initialize(
    log: &LogConfig,
    tracing: &TracingConfig,
    metrics: &MetricsConfig,
) -> Result<(Provider, Cleanup), ObservabilityError> {
    Orchestrator::new().initialize(log, tracing, metrics)
}

struct CleanupInner {
    logger: Logger,
    metrics: Metrics,
    pipeline: Box<dyn Pipeline>,
    done: AtomicBool,
    state: Arc<Mutex<LifecycleState>>,
}

/// Shuts down everything an [`Orchestrator`] started.
///
/// Clones share the same underlying sequence, which runs at most once.
#[derive(Clone)]
pub struct Cleanup {
    inner: Arc<CleanupInner>,
}

impl Cleanup {
    /// Stop metrics, then tracing, then flush the logger, within
    /// [`SHUTDOWN_BUDGET`]. Returns `false` if shutdown already ran.
    pub fn shutdown(&self) -> bool {
        self.shutdown_with_timeout(SHUTDOWN_BUDGET)
    }

    /// Like [`shutdown`](Self::shutdown) with a custom total budget.
    ///
    /// Component failures are logged and do not stop later steps.
    pub fn shutdown_with_timeout(&self, budget: Duration) -> bool {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return false;
        }

        let deadline = Instant::now() + budget;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let cx = Context::new();
        let logger = &self.inner.logger;

        if let Err(e) = self.inner.metrics.shutdown(remaining()) {
            logger.error(
                &cx,
                "error shutting down metrics",
                &[KeyValue::new("error", e.to_string())],
            );
        }

        if let Err(e) = self.inner.pipeline.shutdown(remaining()) {
            logger.error(
                &cx,
                "error shutting down tracer",
                &[KeyValue::new("error", e.to_string())],
            );
        }

        if let Err(e) = logger.sync() {
            eprintln!("obskit: error syncing logger: {e}");
        }

        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = LifecycleState::ShutDown;
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleanup")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
