//! Metrics facade with create-once instrument caches.
//!
//! Instruments are created lazily by name the first time they are used and
//! reused afterwards. Each cache is a `RwLock<HashMap<..>>`: lookups take the
//! read lock, creation re-checks under the write lock, so concurrent first use
//! of a name creates exactly one instrument.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use opentelemetry::{Context, KeyValue};

use crate::config::MetricsConfig;
use crate::error::ObservabilityError;
use crate::logger::Logger;
use crate::meter::{GaugeCallback, GaugeHandle, MeterBackend, NoopMeter, OtelMeter, Recorder};

const MAX_NAME_LEN: usize = 255;

type Cache<T> = RwLock<HashMap<String, Arc<T>>>;

struct MetricsInner {
    backend: Box<dyn MeterBackend>,
    logger: Logger,
    counters: Cache<dyn Recorder<u64>>,
    histograms: Cache<dyn Recorder<f64>>,
    gauges: Cache<dyn GaugeHandle>,
}

/// Counter, histogram and gauge recording by instrument name.
///
/// Cheap to clone; clones share the instrument caches.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

impl Metrics {
    /// OTLP-exporting metrics when `config.enabled`, no-op otherwise.
    pub fn new(config: &MetricsConfig, logger: Logger) -> Result<Self, ObservabilityError> {
        if !config.enabled {
            return Ok(Self::disabled(logger));
        }
        Ok(Self::with_backend(OtelMeter::otlp(config)?, logger))
    }

    /// Metrics that accept every call and record nothing.
    pub fn disabled(logger: Logger) -> Self {
        Self::with_backend(NoopMeter, logger)
    }

    pub fn with_backend(backend: impl MeterBackend + 'static, logger: Logger) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                backend: Box::new(backend),
                logger,
                counters: RwLock::default(),
                histograms: RwLock::default(),
                gauges: RwLock::default(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.backend.is_enabled()
    }

    /// Register a counter with a custom description. A name that already
    /// exists keeps its original instrument.
    pub fn create_counter(&self, name: &str, description: &str) -> Result<(), ObservabilityError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.counter(&Context::current(), name, Some(description)).map(drop)
    }

    /// Register a histogram with a custom description and unit. A name that
    /// already exists keeps its original instrument.
    pub fn create_histogram(
        &self,
        name: &str,
        description: &str,
        unit: &str,
    ) -> Result<(), ObservabilityError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.histogram(&Context::current(), name, Some((description, unit)))
            .map(drop)
    }

    /// Add `value` to the counter `name`, creating it on first use.
    pub fn increment_counter(
        &self,
        cx: &Context,
        name: &str,
        value: u64,
        attributes: &[KeyValue],
    ) -> Result<(), ObservabilityError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let counter = self.counter(cx, name, None)?;
        let _attached = cx.clone().attach();
        counter.record(value, attributes);
        Ok(())
    }

    /// Record `value` into the histogram `name`, creating it on first use
    /// with unit `s`.
    pub fn record_histogram(
        &self,
        cx: &Context,
        name: &str,
        value: f64,
        attributes: &[KeyValue],
    ) -> Result<(), ObservabilityError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let histogram = self.histogram(cx, name, None)?;
        let _attached = cx.clone().attach();
        histogram.record(value, attributes);
        Ok(())
    }

    /// Register an observable gauge whose value is read from `callback` on
    /// every collection. The first registration of a name wins.
    pub fn create_gauge<F>(
        &self,
        name: &str,
        description: &str,
        callback: F,
    ) -> Result<(), ObservabilityError>
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        if !self.is_enabled() {
            return Ok(());
        }
        self.validate(&Context::current(), name)?;
        let callback: GaugeCallback = Arc::new(callback);
        get_or_create(&self.inner.gauges, name, || {
            self.inner.backend.gauge(name, description, callback)
        });
        Ok(())
    }

    /// Start timing an operation. The elapsed seconds are recorded into the
    /// histogram `name` once, when the guard is stopped or dropped.
    pub fn measure_duration(
        &self,
        cx: &Context,
        name: &str,
        attributes: &[KeyValue],
    ) -> DurationGuard {
        DurationGuard {
            metrics: self.clone(),
            cx: cx.clone(),
            name: name.to_string(),
            attributes: attributes.to_vec(),
            start: Instant::now(),
            stopped: false,
        }
    }

    /// Flush pending measurements and stop the backend.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), ObservabilityError> {
        self.inner.backend.shutdown(timeout)
    }

    pub fn counter_count(&self) -> usize {
        read(&self.inner.counters).len()
    }

    pub fn histogram_count(&self) -> usize {
        read(&self.inner.histograms).len()
    }

    pub fn gauge_count(&self) -> usize {
        read(&self.inner.gauges).len()
    }

    fn counter(
        &self,
        cx: &Context,
        name: &str,
        description: Option<&str>,
    ) -> Result<Arc<dyn Recorder<u64>>, ObservabilityError> {
        self.validate(cx, name)?;
        Ok(get_or_create(&self.inner.counters, name, || {
            let description = description
                .map(str::to_string)
                .unwrap_or_else(|| format!("Counter for {name}"));
            self.inner.backend.counter(name, &description)
        }))
    }

    fn histogram(
        &self,
        cx: &Context,
        name: &str,
        metadata: Option<(&str, &str)>,
    ) -> Result<Arc<dyn Recorder<f64>>, ObservabilityError> {
        self.validate(cx, name)?;
        Ok(get_or_create(&self.inner.histograms, name, || match metadata {
            Some((description, unit)) => self.inner.backend.histogram(name, description, unit),
            None => self
                .inner
                .backend
                .histogram(name, &format!("Duration of {name}"), "s"),
        }))
    }

    fn validate(&self, cx: &Context, name: &str) -> Result<(), ObservabilityError> {
        let Err(reason) = check_name(name) else {
            return Ok(());
        };
        self.inner.logger.error(
            cx,
            "failed to create instrument",
            &[
                KeyValue::new("instrument", name.to_string()),
                KeyValue::new("reason", reason.clone()),
            ],
        );
        Err(ObservabilityError::InvalidInstrument {
            name: name.to_string(),
            reason,
        })
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("enabled", &self.is_enabled())
            .field("counters", &self.counter_count())
            .field("histograms", &self.histogram_count())
            .field("gauges", &self.gauge_count())
            .finish()
    }
}

/// Times one operation for [`Metrics::measure_duration`].
#[must_use = "the duration is recorded when the guard is stopped or dropped"]
pub struct DurationGuard {
    metrics: Metrics,
    cx: Context,
    name: String,
    attributes: Vec<KeyValue>,
    start: Instant,
    stopped: bool,
}

impl DurationGuard {
    /// Record the elapsed time now and return it in seconds.
    pub fn stop(mut self) -> f64 {
        self.finish()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn finish(&mut self) -> f64 {
        let seconds = self.start.elapsed().as_secs_f64();
        self.stopped = true;
        // Failures are already logged by the facade.
        let _ = self
            .metrics
            .record_histogram(&self.cx, &self.name, seconds, &self.attributes);
        seconds
    }
}

impl Drop for DurationGuard {
    fn drop(&mut self) {
        if !self.stopped {
            self.finish();
        }
    }
}

fn check_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err("name is empty".into());
    };
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name is longer than {MAX_NAME_LEN} characters"));
    }
    if !first.is_ascii_alphabetic() {
        return Err("name must start with an ASCII letter".into());
    }
    if let Some(bad) =
        chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/')))
    {
        return Err(format!("invalid character {bad:?}"));
    }
    Ok(())
}

fn read<T: ?Sized>(cache: &Cache<T>) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<T>>> {
    cache.read().unwrap_or_else(PoisonError::into_inner)
}

fn get_or_create<T: ?Sized>(
    cache: &Cache<T>,
    name: &str,
    create: impl FnOnce() -> Arc<T>,
) -> Arc<T> {
    if let Some(found) = read(cache).get(name) {
        return Arc::clone(found);
    }
    let mut map = cache.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(map.entry(name.to_string()).or_insert_with(create))
}
