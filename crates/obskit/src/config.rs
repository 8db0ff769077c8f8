//! Configuration model for logging, tracing and metrics.
//!
//! Every struct derives serde so hosts can load it from whatever format they
//! already use. Levels, formats and outputs go through lenient string parsers:
//! an unknown level becomes `info`, an unknown format becomes `json`.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::sink::MemorySink;

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Logs, syncs, then terminates the process.
    Fatal,
}

impl LogLevel {
    /// Parse a level name. `"warning"` is accepted for `Warn`; anything
    /// unrecognised falls back to `Info`.
    pub fn parse(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "fatal" => Self::Fatal,
            _ => Self::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for LogLevel {
    fn from(level: String) -> Self {
        Self::parse(&level)
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

/// Encoding of log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable lines.
    Console,
}

impl LogFormat {
    /// Parse a format name; anything unrecognised falls back to `Json`.
    pub fn parse(format: &str) -> Self {
        match format.trim().to_ascii_lowercase().as_str() {
            "console" => Self::Console,
            _ => Self::Json,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Console => "console",
        }
    }
}

impl From<String> for LogFormat {
    fn from(format: String) -> Self {
        Self::parse(&format)
    }
}

impl From<LogFormat> for String {
    fn from(format: LogFormat) -> Self {
        format.as_str().to_string()
    }
}

/// Where log entries are written.
#[derive(Debug, Clone)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Appended to, created if missing.
    File(PathBuf),
    /// In-process buffer, readable through the sink handle.
    Memory(MemorySink),
}

impl LogOutput {
    /// `"stdout"` and `"stderr"` name the standard streams; anything else is a
    /// file path.
    pub fn parse(output: &str) -> Self {
        match output {
            "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            path => Self::File(PathBuf::from(path)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Stdout => "stdout".into(),
            Self::Stderr => "stderr".into(),
            Self::File(path) => path.display().to_string(),
            Self::Memory(_) => "memory".into(),
        }
    }
}

impl PartialEq for LogOutput {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Stdout, Self::Stdout) | (Self::Stderr, Self::Stderr) => true,
            (Self::File(a), Self::File(b)) => a == b,
            (Self::Memory(a), Self::Memory(b)) => a.same_buffer(b),
            _ => false,
        }
    }
}

impl Serialize for LogOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.describe())
    }
}

impl<'de> Deserialize<'de> for LogOutput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Logger configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
    /// Empty means standard output.
    #[serde(default)]
    pub outputs: Vec<LogOutput>,
    /// Human-friendly output: pretty console lines, thread names, colours on
    /// terminal streams.
    #[serde(default)]
    pub development: bool,
}

impl LogConfig {
    /// A JSON logger writing only to the given in-memory sink.
    pub fn memory(level: LogLevel, sink: MemorySink) -> Self {
        Self {
            level,
            format: LogFormat::Json,
            outputs: vec![LogOutput::Memory(sink)],
            development: false,
        }
    }

    /// The configured outputs, or standard output when none are configured.
    pub fn resolved_outputs(&self) -> Vec<LogOutput> {
        if self.outputs.is_empty() {
            vec![LogOutput::Stdout]
        } else {
            self.outputs.clone()
        }
    }
}

/// Distributed tracing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_version: String,
    #[serde(default)]
    pub environment: String,
    /// OTLP/gRPC collector endpoint (e.g. "http://localhost:4317")
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub enabled: bool,
    /// Fraction of traces recorded. ≥ 1.0 samples everything, ≤ 0.0 nothing.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            service_version: String::new(),
            environment: String::new(),
            endpoint: default_endpoint(),
            enabled: false,
            sampling_rate: default_sampling_rate(),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_version: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub enabled: bool,
    /// OTLP/gRPC collector endpoint (e.g. "http://localhost:4317")
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Seconds between periodic exports.
    #[serde(default = "default_export_interval_secs")]
    pub export_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            service_version: String::new(),
            environment: String::new(),
            enabled: false,
            endpoint: default_endpoint(),
            export_interval_secs: default_export_interval_secs(),
        }
    }
}

/// Identity of the running service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub environment: String,
}

/// All observability configuration in one place.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

impl ObservabilityConfig {
    /// Split into the three stage configs. Blank service fields on the
    /// tracing and metrics sides are filled from `service`.
    pub fn into_parts(self) -> (LogConfig, TracingConfig, MetricsConfig) {
        let Self {
            logging,
            mut tracing,
            mut metrics,
            service,
        } = self;

        fill(&mut tracing.service_name, &service.name);
        fill(&mut tracing.service_version, &service.version);
        fill(&mut tracing.environment, &service.environment);
        fill(&mut metrics.service_name, &service.name);
        fill(&mut metrics.service_version, &service.version);
        fill(&mut metrics.environment, &service.environment);

        (logging, tracing, metrics)
    }

    /// Overlay the process environment. See [`apply_env_with`](Self::apply_env_with).
    pub fn apply_env(self) -> Self {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`:
    ///
    /// - `OTEL_SERVICE_NAME` → service name, overriding the tracing and
    ///   metrics names even when they are set explicitly
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT` → tracing and metrics endpoints
    /// - `OTEL_TRACES_SAMPLER_ARG` → sampling rate
    /// - `OTEL_SDK_DISABLED=true` → tracing and metrics disabled
    /// - `LOG_LEVEL`, `LOG_FORMAT` → logger level and format
    ///
    /// A sampling rate that does not parse leaves the field unchanged; levels
    /// and formats parse leniently.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(name) = get("OTEL_SERVICE_NAME") {
            self.tracing.service_name = name.clone();
            self.metrics.service_name = name.clone();
            self.service.name = name;
        }
        if let Some(endpoint) = get("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.tracing.endpoint = endpoint.clone();
            self.metrics.endpoint = endpoint;
        }
        if let Some(rate) =
            get("OTEL_TRACES_SAMPLER_ARG").and_then(|v| v.trim().parse::<f64>().ok())
        {
            self.tracing.sampling_rate = rate;
        }
        if get("OTEL_SDK_DISABLED").is_some_and(|v| v.trim().eq_ignore_ascii_case("true")) {
            self.tracing.enabled = false;
            self.metrics.enabled = false;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.logging.level = LogLevel::parse(&level);
        }
        if let Some(format) = get("LOG_FORMAT") {
            self.logging.format = LogFormat::parse(&format);
        }
        self
    }
}

fn fill(field: &mut String, fallback: &str) {
    if field.is_empty() {
        *field = fallback.to_string();
    }
}

fn default_endpoint() -> String {
    "http://localhost:4317".into()
}

fn default_sampling_rate() -> f64 {
    1.0
}

fn default_export_interval_secs() -> u64 {
    60
}
