//! Forwarding of `tracing` events to the bus.
//!
//! [`BusLogLayer`] turns INFO-and-above events into [`LogRecord`]s and hands
//! them to a bounded channel; [`forward`] publishes them on
//! `<unit>/<experiment>/logs/<task>/<LEVEL>`. The layer never blocks the
//! thread that logged: when the channel is full the record is dropped.
//!
//! `tracing` has no NOTICE or CRITICAL level, so they are spelled as fields:
//! an INFO event with `notice = true` (see [`notice!`](crate::notice)) is a
//! NOTICE, an ERROR event with `critical = true` is a CRITICAL. The task is
//! the event's `job` field, else the nearest span's, else `app`.

use std::fmt;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::pubsub::{Qos, SharedTransport};
use crate::topic::logs_topic;

/// Records buffered between the layer and the publisher.
pub const LOG_CHANNEL_CAPACITY: usize = 256;

/// INFO with `notice = true`: a user-facing milestone.
#[macro_export]
macro_rules! notice {
    ($($arg:tt)+) => {
        ::tracing::info!(notice = true, $($arg)+)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    fn from_event(level: &Level, notice: bool, critical: bool) -> Self {
        match *level {
            Level::ERROR if critical => Self::Critical,
            Level::ERROR => Self::Error,
            Level::WARN => Self::Warning,
            Level::INFO if notice => Self::Notice,
            Level::INFO => Self::Info,
            _ => Self::Debug,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub message: String,
    pub task: String,
    pub level: LogLevel,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Field extraction
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EventFields {
    message: String,
    extra: Vec<String>,
    job: Option<String>,
    notice: bool,
    critical: bool,
}

impl Visit for EventFields {
    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            "notice" => self.notice = value,
            "critical" => self.critical = value,
            name => self.extra.push(format!("{name}={value}")),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "job" => self.job = Some(value.to_string()),
            name => self.extra.push(format!("{name}={value}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "job" => self.job = Some(format!("{value:?}").trim_matches('"').to_string()),
            name => self.extra.push(format!("{name}={value:?}")),
        }
    }
}

/// `job` recorded on a span, kept in the span's extensions.
struct SpanJob(String);

#[derive(Default)]
struct JobVisitor(Option<String>);

impl Visit for JobVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "job" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "job" {
            self.0 = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

pub struct BusLogLayer {
    tx: mpsc::Sender<LogRecord>,
    min: LogLevel,
}

impl BusLogLayer {
    /// Layer forwarding INFO and above, plus the receiving end for
    /// [`forward`].
    pub fn new() -> (Self, mpsc::Receiver<LogRecord>) {
        Self::with_min_level(LogLevel::Info)
    }

    pub fn with_min_level(min: LogLevel) -> (Self, mpsc::Receiver<LogRecord>) {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        (Self { tx, min }, rx)
    }
}

impl<S> Layer<S> for BusLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: Context<'_, S>,
    ) {
        let mut v = JobVisitor::default();
        attrs.record(&mut v);
        if let (Some(job), Some(span)) = (v.0, ctx.span(id)) {
            span.extensions_mut().insert(SpanJob(job));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        event.record(&mut fields);

        let level = LogLevel::from_event(event.metadata().level(), fields.notice, fields.critical);
        if level < self.min {
            return;
        }

        let task = fields
            .job
            .or_else(|| {
                ctx.event_scope(event).and_then(|scope| {
                    scope
                        .into_iter()
                        .find_map(|span| span.extensions().get::<SpanJob>().map(|j| j.0.clone()))
                })
            })
            .unwrap_or_else(|| "app".to_string());

        let mut message = fields.message;
        if !fields.extra.is_empty() {
            message = format!("{message} ({})", fields.extra.join(", "));
        }

        let record = LogRecord {
            message,
            task,
            level,
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        };
        // Dropping is preferable to stalling the caller.
        let _ = self.tx.try_send(record);
    }
}

/// Publish records until the channel closes or the transport goes away.
pub async fn forward(
    mut rx: mpsc::Receiver<LogRecord>,
    transport: SharedTransport,
    unit: String,
    experiment: String,
) {
    while let Some(record) = rx.recv().await {
        let topic = logs_topic(&unit, &experiment, &record.task, record.level.as_str());
        let payload = match serde_json::to_vec(&record) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if transport
            .publish(&topic, payload, false, Qos::AtMostOnce)
            .await
            .is_err()
        {
            break;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
