//! Leveled, structured-or-text logging (spec §6).
//!
//! Grounded in the `tracing` + `tracing-subscriber` stack used throughout
//! `iwismer-rusty-timer`'s services. `tracing` only has five levels;
//! EMERG/ALERT/CRIT collapse onto `ERROR` with a `severity` field carrying
//! the original eight-level name so JSON mode can still round-trip it.

use crate::config::{LogFormat, LogLevel};
use std::cell::RefCell;
use std::fmt;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{format, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
};

thread_local! {
    /// The request id tagging the invocation currently being processed,
    /// set by [`enter_invocation`] for its duration. A thread-local
    /// rather than a `tracing::Span` field lookup: the main loop is
    /// single-threaded per spec §5, so there is exactly one "current"
    /// request id at a time and no span-walk is needed to find it.
    static CURRENT_REQUEST_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// The eight severities named in spec §6, exposed to scripts via
/// `lws.log(level, message)` and used for the `severity` log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Emerg,
    Alert,
    Crit,
    Err,
    Warn,
    Notice,
    Info,
    Debug,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Emerg => "EMERG",
            Severity::Alert => "ALERT",
            Severity::Crit => "CRIT",
            Severity::Err => "ERR",
            Severity::Warn => "WARN",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }

    /// Parses a `lws.log(level, ...)` level argument; unknown values
    /// default to `err` per spec §4.10.
    pub fn parse(level: Option<&str>) -> Self {
        match level {
            Some("emerg") => Severity::Emerg,
            Some("alert") => Severity::Alert,
            Some("crit") => Severity::Crit,
            Some("warn") => Severity::Warn,
            Some("notice") => Severity::Notice,
            Some("info") => Severity::Info,
            Some("debug") => Severity::Debug,
            _ => Severity::Err,
        }
    }

    fn tracing_level(self) -> Level {
        match self {
            Severity::Emerg | Severity::Alert | Severity::Crit | Severity::Err => Level::ERROR,
            Severity::Warn => Level::WARN,
            Severity::Notice | Severity::Info => Level::INFO,
            Severity::Debug => Level::DEBUG,
        }
    }
}

impl From<LogLevel> for Severity {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Emerg => Severity::Emerg,
            LogLevel::Alert => Severity::Alert,
            LogLevel::Crit => Severity::Crit,
            LogLevel::Err => Severity::Err,
            LogLevel::Warn => Severity::Warn,
            LogLevel::Notice => Severity::Notice,
            LogLevel::Info => Severity::Info,
            LogLevel::Debug => Severity::Debug,
        }
    }
}

/// Emits one log line at the given severity, with an optional request-id
/// field (spec §6: "per-context request-ID tagging"). Modeled on a plain
/// function rather than a `Logger` struct/handle, since `tracing`'s global
/// dispatcher is itself the shared handle — a second layer of indirection
/// here would just be ceremony.
#[track_caller]
pub fn log(severity: Severity, message: &str) {
    match severity.tracing_level() {
        Level::ERROR => tracing::error!(severity = severity.as_str(), "{message}"),
        Level::WARN => tracing::warn!(severity = severity.as_str(), "{message}"),
        Level::INFO => tracing::info!(severity = severity.as_str(), "{message}"),
        Level::DEBUG => tracing::debug!(severity = severity.as_str(), "{message}"),
        _ => tracing::trace!(severity = severity.as_str(), "{message}"),
    }
}

/// Installs the global subscriber for the configured level/format.
///
/// Text mode: `"{ts} [{LEVEL}] [{requestId}] {msg}"`.
/// JSON mode: `{ts, level, msg, requestId?}`, millisecond-precision UTC
/// ISO-8601 timestamp.
pub fn init(level: LogLevel, format: LogFormat) {
    let max_level = Severity::from(level).tracing_level();
    let filter = tracing_subscriber::filter::LevelFilter::from_level(max_level);

    let builder = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(std::io::stdout);

    match format {
        LogFormat::Text => builder.event_format(TextFormat).init(),
        LogFormat::Json => builder.event_format(JsonFormat).init(),
    }
}

struct TextFormat;

impl<S, N> FormatEvent<S, N> for TextFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let ts = now_iso8601_millis();
        let level = severity_field(event).unwrap_or_else(|| event.metadata().level().to_string());
        let request_id = current_request_id().unwrap_or_default();

        let mut message = String::new();
        {
            let mut visitor = MessageVisitor(&mut message);
            event.record(&mut visitor);
        }

        write!(writer, "{ts} [{level}] [{request_id}] {message}")?;
        writeln!(writer)
    }
}

struct JsonFormat;

impl<S, N> FormatEvent<S, N> for JsonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let ts = now_iso8601_millis();
        let level = severity_field(event).unwrap_or_else(|| event.metadata().level().to_string());
        let request_id = current_request_id();

        let mut message = String::new();
        {
            let mut visitor = MessageVisitor(&mut message);
            event.record(&mut visitor);
        }

        write!(writer, "{{\"ts\":\"{ts}\",\"level\":\"{level}\",\"msg\":")?;
        write_json_string(writer.by_ref(), &message)?;
        if let Some(rid) = request_id {
            write!(writer, ",\"requestId\":")?;
            write_json_string(writer.by_ref(), &rid)?;
        }
        writeln!(writer, "}}")
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            use std::fmt::Write;
            let _ = write!(self.0, "{value:?}");
        }
    }
}

fn severity_field(event: &tracing::Event<'_>) -> Option<String> {
    struct SeverityVisitor(Option<String>);
    impl tracing::field::Visit for SeverityVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
            if field.name() == "severity" {
                self.0 = Some(format!("{value:?}").trim_matches('"').to_string());
            }
        }
    }
    let mut visitor = SeverityVisitor(None);
    event.record(&mut visitor);
    visitor.0
}

fn current_request_id() -> Option<String> {
    CURRENT_REQUEST_ID.with(|cell| cell.borrow().clone())
}

/// Tags all logging for the duration of one invocation with its request
/// id (spec §6 "per-context request-ID tagging"). Dropping the guard
/// clears the tag, matching `RequestContext::reset_for_next_invocation`
/// clearing per-invocation substructures at the loop tail.
pub struct InvocationGuard {
    previous: Option<String>,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        CURRENT_REQUEST_ID.with(|cell| *cell.borrow_mut() = self.previous.take());
    }
}

pub fn enter_invocation(request_id: &str) -> InvocationGuard {
    let previous = CURRENT_REQUEST_ID.with(|cell| cell.replace(Some(request_id.to_string())));
    InvocationGuard { previous }
}

/// ISO-8601, millisecond-precision, UTC (spec §6 "Log format"). Built on
/// `chrono`, already present in the retrieval pack
/// (`uwuclxdy-ollama-lmstudio-proxy-rs`, and via `sqlx`'s `chrono`
/// feature in `iwismer-rusty-timer`) rather than hand-rolled calendar
/// math for a single fixed-format timestamp.
fn now_iso8601_millis() -> String {
    format_unix_time(chrono::Utc::now())
}

fn format_unix_time(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn write_json_string(mut w: impl fmt::Write, s: &str) -> fmt::Result {
    w.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => w.write_str("\\\"")?,
            '\\' => w.write_str("\\\\")?,
            '\n' => w.write_str("\\n")?,
            '\r' => w.write_str("\\r")?,
            '\t' => w.write_str("\\t")?,
            c if (c as u32) < 0x20 => {
                use std::fmt::Write as _;
                write!(w, "\\u{:04x}", c as u32)?;
            }
            c => w.write_char(c)?,
        }
    }
    w.write_char('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_formats_as_expected() {
        let epoch = chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap();
        assert_eq!(format_unix_time(epoch), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn severity_parse_defaults_to_err() {
        assert_eq!(Severity::parse(None), Severity::Err);
        assert_eq!(Severity::parse(Some("bogus")), Severity::Err);
        assert_eq!(Severity::parse(Some("debug")), Severity::Debug);
    }

    #[test]
    fn json_string_escapes_control_and_quote() {
        let mut out = String::new();
        write_json_string(&mut out, "a\"b\nc").unwrap();
        assert_eq!(out, "\"a\\\"b\\nc\"");
    }
}
