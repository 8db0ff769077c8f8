//! Metrics backend capability.
//!
//! [`MeterBackend`] is the seam between the [`Metrics`](crate::Metrics)
//! facade and whatever actually aggregates and exports measurements.
//! Two implementations ship with the crate: [`OtelMeter`] (OpenTelemetry SDK,
//! OTLP export) and [`NoopMeter`] (disabled metrics).

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider as _};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

use crate::config::MetricsConfig;
use crate::error::ObservabilityError;
use crate::resource::{require_runtime, service_resource};

/// A synchronous instrument that accepts measurements of type `T`.
pub trait Recorder<T>: Send + Sync {
    fn record(&self, value: T, attributes: &[KeyValue]);
}

impl Recorder<u64> for Counter<u64> {
    fn record(&self, value: u64, attributes: &[KeyValue]) {
        self.add(value, attributes);
    }
}

impl Recorder<f64> for Histogram<f64> {
    fn record(&self, value: f64, attributes: &[KeyValue]) {
        Histogram::record(self, value, attributes);
    }
}

/// Keeps an observable instrument registered for as long as it is held.
pub trait GaugeHandle: Send + Sync {}

impl<T: Send + Sync> GaugeHandle for T {}

/// Value source for an observable gauge, invoked on every collection.
pub type GaugeCallback = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Creates instruments and owns the export pipeline behind them.
pub trait MeterBackend: Send + Sync {
    fn counter(&self, name: &str, description: &str) -> Arc<dyn Recorder<u64>>;

    fn histogram(&self, name: &str, description: &str, unit: &str) -> Arc<dyn Recorder<f64>>;

    fn gauge(&self, name: &str, description: &str, callback: GaugeCallback) -> Arc<dyn GaugeHandle>;

    /// `false` when measurements are discarded.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Flush pending measurements and stop exporting.
    fn shutdown(&self, timeout: Duration) -> Result<(), ObservabilityError>;
}

/// OpenTelemetry SDK meter.
pub struct OtelMeter {
    meter: Meter,
    provider: SdkMeterProvider,
}

impl OtelMeter {
    /// Periodic OTLP/gRPC export to `config.endpoint`. Must be called inside
    /// a tokio runtime.
    pub fn otlp(config: &MetricsConfig) -> Result<Self, ObservabilityError> {
        require_runtime("metric")?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(config.endpoint.clone())
            .build()
            .map_err(|e| ObservabilityError::Exporter {
                signal: "metric",
                reason: e.to_string(),
            })?;

        let reader = PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(config.export_interval_secs.max(1)))
            .build();

        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(service_resource(
                &config.service_name,
                &config.service_version,
                &config.environment,
            ))
            .build();

        Ok(Self::from_provider(provider, config.service_name.clone()))
    }

    /// Use a provider assembled by the host, e.g. with a different exporter
    /// or an in-process reader.
    pub fn from_provider(provider: SdkMeterProvider, scope: impl Into<String>) -> Self {
        let meter = provider.meter_with_scope(InstrumentationScope::builder(scope.into()).build());
        Self { meter, provider }
    }
}

impl MeterBackend for OtelMeter {
    fn counter(&self, name: &str, description: &str) -> Arc<dyn Recorder<u64>> {
        Arc::new(
            self.meter
                .u64_counter(name.to_string())
                .with_description(description.to_string())
                .build(),
        )
    }

    fn histogram(&self, name: &str, description: &str, unit: &str) -> Arc<dyn Recorder<f64>> {
        Arc::new(
            self.meter
                .f64_histogram(name.to_string())
                .with_description(description.to_string())
                .with_unit(unit.to_string())
                .build(),
        )
    }

    fn gauge(
        &self,
        name: &str,
        description: &str,
        callback: GaugeCallback,
    ) -> Arc<dyn GaugeHandle> {
        Arc::new(
            self.meter
                .f64_observable_gauge(name.to_string())
                .with_description(description.to_string())
                .with_callback(move |observer| observer.observe(callback(), &[]))
                .build(),
        )
    }

    fn shutdown(&self, timeout: Duration) -> Result<(), ObservabilityError> {
        self.provider
            .shutdown_with_timeout(timeout)
            .map_err(|e| ObservabilityError::Shutdown {
                component: "metrics",
                reason: e.to_string(),
            })
    }
}

/// Backend for disabled metrics: every instrument discards its input.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMeter;

struct Discard;

impl Recorder<u64> for Discard {
    fn record(&self, _value: u64, _attributes: &[KeyValue]) {}
}

impl Recorder<f64> for Discard {
    fn record(&self, _value: f64, _attributes: &[KeyValue]) {}
}

impl MeterBackend for NoopMeter {
    fn counter(&self, _name: &str, _description: &str) -> Arc<dyn Recorder<u64>> {
        Arc::new(Discard)
    }

    fn histogram(&self, _name: &str, _description: &str, _unit: &str) -> Arc<dyn Recorder<f64>> {
        Arc::new(Discard)
    }

    fn gauge(
        &self,
        _name: &str,
        _description: &str,
        _callback: GaugeCallback,
    ) -> Arc<dyn GaugeHandle> {
        Arc::new(())
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn shutdown(&self, _timeout: Duration) -> Result<(), ObservabilityError> {
        Ok(())
    }
}
