//! Structured logger facade.
//!
//! Every [`Logger`] owns a private `tracing` dispatcher built from a
//! `tracing-subscriber` registry, so constructing one never touches the
//! process-global subscriber. Entries are enriched with `trace_id` and
//! `span_id` when the caller's context carries a valid span. In JSON format
//! bound and call fields are written as top-level keys of the entry.

use std::sync::Arc;

use opentelemetry::{Context, KeyValue, Value};
use serde_json::{Map, Value as JsonValue};
use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::{fmt, Layer, Registry};

use crate::config::{LogConfig, LogFormat, LogLevel};
use crate::error::ObservabilityError;
use crate::format::JsonLines;
use crate::sink::SinkSet;
use crate::tracer;

type FilteredRegistry = Layered<LevelFilter, Registry>;

struct LoggerCore {
    dispatch: Dispatch,
    sinks: SinkSet,
    level: LogLevel,
}

/// Context-aware structured logger.
///
/// Cheap to clone; clones share the same outputs.
#[derive(Clone)]
pub struct Logger {
    core: Arc<LoggerCore>,
    bound: Arc<[KeyValue]>,
}

impl Logger {
    /// Build a logger from configuration. Fails if a file output cannot be
    /// opened.
    pub fn new(config: &LogConfig) -> Result<Self, ObservabilityError> {
        let sinks = SinkSet::open(&config.resolved_outputs())?;
        let ansi =
            config.development && config.format == LogFormat::Console && sinks.streams_only();

        let fmt_layer: Box<dyn Layer<FilteredRegistry> + Send + Sync> = match config.format {
            LogFormat::Json => fmt::layer()
                .event_format(JsonLines {
                    thread_names: config.development,
                })
                .with_writer(sinks.clone())
                .boxed(),
            LogFormat::Console if config.development => fmt::layer()
                .pretty()
                .with_target(false)
                .with_thread_names(true)
                .with_ansi(ansi)
                .with_writer(sinks.clone())
                .boxed(),
            LogFormat::Console => fmt::layer()
                .with_target(false)
                .with_ansi(ansi)
                .with_writer(sinks.clone())
                .boxed(),
        };

        let subscriber = tracing_subscriber::registry()
            .with(level_filter(config.level))
            .with(fmt_layer);

        Ok(Self {
            core: Arc::new(LoggerCore {
                dispatch: Dispatch::new(subscriber),
                sinks,
                level: config.level,
            }),
            bound: Arc::from(Vec::new()),
        })
    }

    /// A child logger that adds `fields` to every entry. The parent is left
    /// untouched.
    pub fn with(&self, fields: &[KeyValue]) -> Logger {
        let bound: Vec<KeyValue> = self.bound.iter().chain(fields).cloned().collect();
        Logger {
            core: Arc::clone(&self.core),
            bound: bound.into(),
        }
    }

    /// The configured threshold.
    pub fn level(&self) -> LogLevel {
        self.core.level
    }

    /// Whether an entry at `level` would be written.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.core.level
    }

    /// Write one entry. A `Fatal` entry terminates the process after it is
    /// written, exactly like [`fatal`](Self::fatal).
    pub fn log(&self, level: LogLevel, cx: &Context, message: &str, fields: &[KeyValue]) {
        if level == LogLevel::Fatal {
            self.fatal(cx, message, fields);
        }
        self.emit(level, cx, message, fields);
    }

    pub fn debug(&self, cx: &Context, message: &str, fields: &[KeyValue]) {
        self.emit(LogLevel::Debug, cx, message, fields);
    }

    pub fn info(&self, cx: &Context, message: &str, fields: &[KeyValue]) {
        self.emit(LogLevel::Info, cx, message, fields);
    }

    pub fn warn(&self, cx: &Context, message: &str, fields: &[KeyValue]) {
        self.emit(LogLevel::Warn, cx, message, fields);
    }

    pub fn error(&self, cx: &Context, message: &str, fields: &[KeyValue]) {
        self.emit(LogLevel::Error, cx, message, fields);
    }

    /// Log at fatal level, flush every output and exit with status 1.
    pub fn fatal(&self, cx: &Context, message: &str, fields: &[KeyValue]) -> ! {
        self.emit(LogLevel::Fatal, cx, message, fields);
        if let Err(e) = self.sync() {
            eprintln!("obskit: failed to sync logger before exit: {e}");
        }
        std::process::exit(1)
    }

    /// Flush every output.
    pub fn sync(&self) -> Result<(), ObservabilityError> {
        self.core.sinks.sync().map_err(ObservabilityError::from)
    }

    fn emit(&self, level: LogLevel, cx: &Context, message: &str, fields: &[KeyValue]) {
        if !self.enabled(level) {
            return;
        }

        let (trace_id, span_id) = trace_fields(cx);
        let trace_id = trace_id.as_deref();
        let span_id = span_id.as_deref();
        let fields = render_fields(self.bound.iter().chain(fields));
        let fields = fields.as_deref().map(tracing::field::display);

        tracing::dispatcher::with_default(&self.core.dispatch, || match level {
            LogLevel::Debug => tracing::debug!(trace_id, span_id, fields, "{}", message),
            LogLevel::Info => tracing::info!(trace_id, span_id, fields, "{}", message),
            LogLevel::Warn => tracing::warn!(trace_id, span_id, fields, "{}", message),
            LogLevel::Error => tracing::error!(trace_id, span_id, fields, "{}", message),
            LogLevel::Fatal => {
                tracing::error!(fatal = true, trace_id, span_id, fields, "{}", message)
            }
        });
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.core.level)
            .field("bound", &self.bound.len())
            .finish()
    }
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
    }
}

/// Trace correlation for `cx`, present only when the context has a valid span.
fn trace_fields(cx: &Context) -> (Option<String>, Option<String>) {
    let trace_id = tracer::trace_id(cx);
    if trace_id.is_empty() {
        return (None, None);
    }
    (Some(trace_id), Some(tracer::span_id(cx)))
}

/// Bound and call fields as one JSON object; later keys win. The JSON
/// encoder spreads it back out into top-level keys.
fn render_fields<'a>(fields: impl Iterator<Item = &'a KeyValue>) -> Option<String> {
    let map: Map<String, JsonValue> = fields
        .map(|kv| (kv.key.as_str().to_string(), json_value(&kv.value)))
        .collect();
    if map.is_empty() {
        return None;
    }
    Some(JsonValue::Object(map).to_string())
}

fn json_value(value: &Value) -> JsonValue {
    match value {
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::I64(i) => JsonValue::from(*i),
        Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(f.to_string())),
        Value::String(s) => JsonValue::String(s.as_str().to_string()),
        other => JsonValue::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };

    fn memory_logger(level: LogLevel) -> (Logger, MemorySink) {
        let sink = MemorySink::new();
        let logger = Logger::new(&LogConfig::memory(level, sink.clone())).unwrap();
        (logger, sink)
    }

    fn entries(sink: &MemorySink) -> Vec<JsonValue> {
        sink.lines()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn remote_context() -> Context {
        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        Context::new().with_remote_span_context(span_context)
    }

    #[test]
    fn filters_below_threshold() {
        let levels = [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error];
        for threshold in levels {
            let (logger, sink) = memory_logger(threshold);
            let cx = Context::new();
            logger.debug(&cx, "debug", &[]);
            logger.info(&cx, "info", &[]);
            logger.warn(&cx, "warn", &[]);
            logger.error(&cx, "error", &[]);

            let written: Vec<String> = entries(&sink)
                .iter()
                .map(|e| e["message"].as_str().unwrap().to_string())
                .collect();
            let expected: Vec<String> = levels
                .iter()
                .filter(|l| **l >= threshold)
                .map(|l| l.as_str().to_string())
                .collect();
            assert_eq!(written, expected, "threshold {threshold}");
        }
    }

    #[test]
    fn entry_shape() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        logger.info(&Context::new(), "started", &[KeyValue::new("port", 8080_i64)]);

        let entry = &entries(&sink)[0];
        assert_eq!(entry["level"], "INFO");
        assert_eq!(entry["message"], "started");
        assert!(entry.get("timestamp").is_some());
        assert_eq!(entry["port"], 8080);
        assert!(entry.get("fields").is_none());
    }

    #[test]
    fn fields_keep_their_json_types() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        logger.info(
            &Context::new(),
            "typed",
            &[
                KeyValue::new("retry", true),
                KeyValue::new("ratio", 0.5),
                KeyValue::new("region", "eu-west-1"),
            ],
        );

        let entry = &entries(&sink)[0];
        assert_eq!(entry["retry"], true);
        assert_eq!(entry["ratio"], 0.5);
        assert_eq!(entry["region"], "eu-west-1");
    }

    #[test]
    fn builtin_keys_win_over_fields() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        logger.warn(
            &Context::new(),
            "real message",
            &[
                KeyValue::new("message", "shadow"),
                KeyValue::new("level", "DEBUG"),
            ],
        );

        let entry = &entries(&sink)[0];
        assert_eq!(entry["message"], "real message");
        assert_eq!(entry["level"], "WARN");
    }

    #[test]
    fn no_trace_fields_without_span() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        logger.info(&Context::new(), "plain", &[]);

        let entry = &entries(&sink)[0];
        assert!(entry.get("trace_id").is_none());
        assert!(entry.get("span_id").is_none());
        assert!(entry.get("fields").is_none());
    }

    #[test]
    fn trace_fields_with_valid_span() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        logger.info(&remote_context(), "traced", &[]);

        let entry = &entries(&sink)[0];
        assert_eq!(entry["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(entry["span_id"], "00f067aa0ba902b7");
    }

    #[test]
    fn with_binds_fields_without_touching_parent() {
        let (parent, sink) = memory_logger(LogLevel::Info);
        let child = parent.with(&[KeyValue::new("request_id", "r-1")]);
        let grandchild = child.with(&[KeyValue::new("attempt", 2_i64)]);

        let cx = Context::new();
        parent.info(&cx, "parent", &[]);
        child.info(&cx, "child", &[]);
        grandchild.info(&cx, "grandchild", &[KeyValue::new("request_id", "r-2")]);

        let entries = entries(&sink);
        assert!(entries[0].get("request_id").is_none());
        assert_eq!(entries[1]["request_id"], "r-1");
        assert_eq!(entries[2]["attempt"], 2);
        assert_eq!(entries[2]["request_id"], "r-2");
    }

    #[test]
    fn sync_flushes_outputs() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        logger.sync().unwrap();
        assert_eq!(sink.flush_count(), 1);
    }

    #[test]
    fn console_format_is_plain_text() {
        let sink = MemorySink::new();
        let config = LogConfig {
            format: LogFormat::Console,
            ..LogConfig::memory(LogLevel::Debug, sink.clone())
        };
        let logger = Logger::new(&config).unwrap();
        logger.warn(&Context::new(), "disk almost full", &[]);

        let contents = sink.contents();
        assert!(contents.contains("WARN"));
        assert!(contents.contains("disk almost full"));
        assert!(serde_json::from_str::<JsonValue>(contents.trim()).is_err());
    }

    #[test]
    fn fatal_threshold_suppresses_errors() {
        let (logger, sink) = memory_logger(LogLevel::Fatal);
        logger.error(&Context::new(), "not fatal", &[]);
        assert!(sink.is_empty());
        assert!(logger.enabled(LogLevel::Fatal));
    }
}
