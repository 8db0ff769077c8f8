//! JSON line encoding for log entries.

use std::fmt;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Encodes each event as one flat JSON object.
///
/// Caller fields become top-level keys next to `timestamp`, `level`,
/// `message`, `trace_id` and `span_id`. On a name clash the built-in key wins.
pub(crate) struct JsonLines {
    pub(crate) thread_names: bool,
}

impl<S, N> FormatEvent<S, N> for JsonLines
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut entry = EntryVisitor::default();
        event.record(&mut entry);

        let mut timestamp = String::new();
        SystemTime.format_time(&mut Writer::new(&mut timestamp))?;

        let level = if entry.fatal {
            "FATAL".to_string()
        } else {
            event.metadata().level().to_string()
        };

        let mut object = Map::new();
        object.insert("timestamp".into(), Value::String(timestamp));
        object.insert("level".into(), Value::String(level));
        object.insert("message".into(), Value::String(entry.message));
        if let Some(trace_id) = entry.trace_id {
            object.insert("trace_id".into(), Value::String(trace_id));
        }
        if let Some(span_id) = entry.span_id {
            object.insert("span_id".into(), Value::String(span_id));
        }
        if self.thread_names {
            if let Some(name) = std::thread::current().name() {
                object.insert("thread".into(), Value::String(name.to_string()));
            }
        }
        for (key, value) in entry.fields {
            object.entry(key).or_insert(value);
        }

        let line = serde_json::to_string(&object).map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

/// Collects the fields the logger attaches to every event.
#[derive(Default)]
struct EntryVisitor {
    message: String,
    trace_id: Option<String>,
    span_id: Option<String>,
    fields: Map<String, Value>,
    fatal: bool,
}

impl EntryVisitor {
    fn record_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "trace_id" => self.trace_id = Some(value),
            "span_id" => self.span_id = Some(value),
            "fields" => self.fields = serde_json::from_str(&value).unwrap_or_default(),
            _ => {}
        }
    }
}

impl Visit for EntryVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "fatal" {
            self.fatal = value;
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_text(field, format!("{value:?}"));
    }
}
