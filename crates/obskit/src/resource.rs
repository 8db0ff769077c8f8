//! Shared setup for the OTLP pipelines: the service resource and the
//! runtime the gRPC exporters run on.

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};

use crate::error::ObservabilityError;

/// Resource attribute key for the deployment environment.
pub const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";

/// Resource shared by every span and metric the service exports.
///
/// Blank fields are left out rather than exported as empty strings.
pub fn service_resource(name: &str, version: &str, environment: &str) -> Resource {
    Resource::builder_empty()
        .with_attributes(service_attributes(name, version, environment))
        .build()
}

/// The tonic exporters spawn onto the current tokio runtime and panic
/// without one, so check before building them.
pub(crate) fn require_runtime(signal: &'static str) -> Result<(), ObservabilityError> {
    tokio::runtime::Handle::try_current()
        .map(drop)
        .map_err(|_| ObservabilityError::Exporter {
            signal,
            reason: "no tokio runtime".into(),
        })
}

fn service_attributes(name: &str, version: &str, environment: &str) -> Vec<KeyValue> {
    [
        (SERVICE_NAME, name),
        (SERVICE_VERSION, version),
        (DEPLOYMENT_ENVIRONMENT, environment),
    ]
    .into_iter()
    .filter(|(_, value)| !value.is_empty())
    .map(|(key, value)| KeyValue::new(key, value.to_string()))
    .collect()
}
