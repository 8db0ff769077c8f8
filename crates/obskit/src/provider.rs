//! The bundle of facades handed to application code.

use crate::logger::Logger;
use crate::metrics::Metrics;
use crate::tracer::Tracer;

/// Shared access to the logger, tracer and metrics of one service.
///
/// Cheap to clone. Created by the [`Orchestrator`](crate::Orchestrator), torn
/// down through the matching [`Cleanup`](crate::Cleanup).
#[derive(Clone, Debug)]
pub struct Provider {
    logger: Logger,
    tracer: Tracer,
    metrics: Metrics,
    service_name: String,
    service_version: String,
}

impl Provider {
    pub fn new(
        logger: Logger,
        tracer: Tracer,
        metrics: Metrics,
        service_name: impl Into<String>,
        service_version: impl Into<String>,
    ) -> Self {
        Self {
            logger,
            tracer,
            metrics,
            service_name: service_name.into(),
            service_version: service_version.into(),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_version(&self) -> &str {
        &self.service_version
    }
}
