//! # Logging
//!
//! One `tracing-subscriber` registry for the whole library. Events from the
//! workspace crates go to stdout in the chosen [`LogFormat`], and when a
//! [`LoggerSink`] is configured every event that passes the filter is also
//! handed to the host as a [`LogEntry`].
//!
//! ```ignore
//! use bridge_traits::time::{ConsoleLogger, LogLevel};
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use std::sync::Arc;
//!
//! init_logging(
//!     LoggingConfig::default()
//!         .with_format(LogFormat::Compact)
//!         .with_level(LogLevel::Debug)
//!         .with_logger_sink(Arc::new(ConsoleLogger::default())),
//! )?;
//!
//! tracing::info!(target: "core_discovery", entry_point = "file:///music", "Reload requested");
//! ```
//!
//! Hosts without their own settings screen can use [`LoggingConfig::from_env`],
//! which reads `MEDIALIB_LOG` (a filter directive) and `MEDIALIB_LOG_FORMAT`.

use crate::error::{Error, Result};

use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::format::FmtSpan,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
};

/// Environment variable holding a full filter directive.
pub const FILTER_ENV: &str = "MEDIALIB_LOG";
/// Environment variable selecting `pretty`, `json` or `compact`.
pub const FORMAT_ENV: &str = "MEDIALIB_LOG_FORMAT";

const WORKSPACE_CRATES: &[&str] = &[
    "medialib_workspace",
    "bridge_traits",
    "bridge_desktop",
    "core_runtime",
    "core_library",
    "core_discovery",
    "core_service",
];

// SQLite chatter is only interesting when it goes wrong.
const QUIET_DEPENDENCIES: &[(&str, LogLevel)] = &[("rusqlite", LogLevel::Warn)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored, with span enter/exit
    Pretty,
    /// Flattened JSON, one object per line
    Json,
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(Error::Logging(format!("unknown log format '{}'", other))),
        }
    }
}

#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Threshold applied to the workspace crates by the default filter
    pub level: LogLevel,
    /// Replaces the default filter entirely
    pub filter: Option<String>,
    pub sink: Option<Arc<dyn LoggerSink>>,
    pub spans: bool,
    pub show_target: bool,
    /// Thread ids and names; the discovery worker names its thread
    pub show_threads: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            format: LogFormat::default(),
            level: LogLevel::Info,
            filter: None,
            sink: None,
            spans: true,
            show_target: true,
            show_threads: true,
        }
    }
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("filter", &self.filter)
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl LoggingConfig {
    /// Defaults overridden by [`FILTER_ENV`] and [`FORMAT_ENV`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = LoggingConfig::default();
        if let Some(filter) = lookup(FILTER_ENV).filter(|f| !f.trim().is_empty()) {
            config.filter = Some(filter);
        }
        if let Some(format) = lookup(FORMAT_ENV) {
            config.format = format.parse()?;
        }
        Ok(config)
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// e.g. `"core_discovery=trace,rusqlite=debug"`
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.spans = enable;
        self
    }

    pub fn with_target(mut self, display: bool) -> Self {
        self.show_target = display;
        self
    }

    pub fn with_thread_info(mut self, display: bool) -> Self {
        self.show_threads = display;
        self
    }

    fn directives(&self) -> String {
        if let Some(custom) = &self.filter {
            return custom.clone();
        }
        WORKSPACE_CRATES
            .iter()
            .map(|krate| (*krate, self.level))
            .chain(QUIET_DEPENDENCIES.iter().copied())
            .map(|(target, level)| format!("{}={}", target, level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Install the global subscriber. Only the first call in a process succeeds.
///
/// # Errors
///
/// `Error::Logging` for a malformed filter or when a subscriber is already set.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;
    let output = output_layer(&config);

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .with(LoggerSinkLayer::new(config.sink))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = config.directives();
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Logging(format!("bad filter '{}': {}", directives, e)))
}

fn output_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(config.show_target)
        .with_thread_names(config.show_threads)
        .with_thread_ids(config.show_threads);

    match config.format {
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(config.spans)
            .with_span_list(config.spans)
            .boxed(),
        LogFormat::Pretty => {
            let span_events = if config.spans {
                FmtSpan::ACTIVE
            } else {
                FmtSpan::NONE
            };
            layer.pretty().with_span_events(span_events).boxed()
        }
    }
}

/// Copies filtered events into a host [`LoggerSink`].
pub struct LoggerSinkLayer {
    sink: Option<Arc<dyn LoggerSink>>,
}

impl LoggerSinkLayer {
    pub fn new(sink: Option<Arc<dyn LoggerSink>>) -> Self {
        LoggerSinkLayer { sink }
    }
}

impl<S> Layer<S> for LoggerSinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = &self.sink else {
            return;
        };
        let meta = event.metadata();
        let level = LogLevel::from(*meta.level());
        if level < sink.min_level() {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let message = fields.message.take().unwrap_or_else(|| meta.name().to_string());
        let mut entry = LogEntry::new(level, meta.target(), message);
        entry.fields = fields.values;
        if let Some(span) = ctx.event_span(event) {
            entry = entry.with_span(span.name());
        }

        // A failing sink must not turn into a tracing event of its own.
        if let Err(err) = sink.log(entry) {
            eprintln!("medialib: {}", err);
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: HashMap<String, String>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            name => {
                self.values.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, value.to_string());
    }

    // Numbers and bools fall through here.
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{:?}", value));
    }
}

/// Last segment of a path or MRL, for log fields that should not leak the
/// user's directory layout.
///
/// ```
/// use core_runtime::logging::strip_path;
///
/// assert_eq!(strip_path("file:///sdcard/Music/song.mp3"), "song.mp3");
/// ```
pub fn strip_path(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
