//! Progress and log events.
//!
//! Every stage of the pipeline reports through a [`LogSink`]. Sinks must never
//! block the pipeline; the bounded [`LogQueue`] drops the oldest events when
//! its consumer falls behind and tells the consumer how many were lost.
//!
//! Events are also mirrored to `tracing`, so a headless run with a subscriber
//! installed sees the same stream.

mod queue;

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::job::Stage;

pub use queue::{LogQueue, LogReceiver, log_queue};

/// Severity of a [`LogEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Info,
  Warn,
  Error,
}

impl fmt::Display for LogLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LogLevel::Info => "info",
      LogLevel::Warn => "warn",
      LogLevel::Error => "error",
    };
    f.write_str(s)
  }
}

/// A single progress or log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
  pub timestamp: DateTime<Utc>,
  pub level: LogLevel,
  /// Pipeline stage that emitted the event.
  pub stage: Stage,
  pub message: String,
}

impl LogEvent {
  pub fn new(level: LogLevel, stage: Stage, message: impl Into<String>) -> Self {
    Self {
      timestamp: Utc::now(),
      level,
      stage,
      message: message.into(),
    }
  }
}

/// Append-only receiver of log events.
///
/// Implementations must return quickly: `emit` is called from the pipeline
/// task, including from inside download and process loops.
pub trait LogSink: Send + Sync {
  fn emit(&self, event: LogEvent);
}

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
  fn emit(&self, event: LogEvent) {
    (**self).emit(event)
  }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
  fn emit(&self, _event: LogEvent) {}
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F> LogSink for FnSink<F>
where
  F: Fn(LogEvent) + Send + Sync,
{
  fn emit(&self, event: LogEvent) {
    (self.0)(event)
  }
}

/// Keeps every event in memory. Meant for headless drivers and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
  events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<LogEvent> {
    self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn messages(&self) -> Vec<String> {
    self.events().into_iter().map(|e| e.message).collect()
  }

  /// Whether any event message contains `needle`.
  pub fn contains(&self, needle: &str) -> bool {
    self.events().iter().any(|e| e.message.contains(needle))
  }
}

impl LogSink for MemorySink {
  fn emit(&self, event: LogEvent) {
    self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
  }
}

/// Stage-tagged handle the pipeline components log through.
#[derive(Clone)]
pub struct Reporter {
  sink: Arc<dyn LogSink>,
  stage: Stage,
}

impl Reporter {
  pub fn new(sink: Arc<dyn LogSink>) -> Self {
    Self {
      sink,
      stage: Stage::Pending,
    }
  }

  /// A reporter that tags its events with `stage`.
  pub fn for_stage(&self, stage: Stage) -> Self {
    Self {
      sink: Arc::clone(&self.sink),
      stage,
    }
  }

  pub fn stage(&self) -> Stage {
    self.stage
  }

  pub fn emit(&self, level: LogLevel, message: impl Into<String>) {
    let message = message.into();
    match level {
      LogLevel::Info => info!(stage = %self.stage, "{}", message),
      LogLevel::Warn => warn!(stage = %self.stage, "{}", message),
      LogLevel::Error => error!(stage = %self.stage, "{}", message),
    }
    self.sink.emit(LogEvent::new(level, self.stage, message));
  }

  pub fn info(&self, message: impl Into<String>) {
    self.emit(LogLevel::Info, message)
  }

  pub fn warn(&self, message: impl Into<String>) {
    self.emit(LogLevel::Warn, message)
  }

  pub fn error(&self, message: impl Into<String>) {
    self.emit(LogLevel::Error, message)
  }
}

impl fmt::Debug for Reporter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Reporter").field("stage", &self.stage).finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tracing_test::traced_test;

  #[test]
  fn reporter_tags_events_with_stage() {
    let sink = Arc::new(MemorySink::new());
    let reporter = Reporter::new(sink.clone()).for_stage(Stage::Download);

    reporter.info("fetching zlib");
    reporter.warn("retrying");

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.stage == Stage::Download));
    assert_eq!(events[0].level, LogLevel::Info);
    assert_eq!(events[1].level, LogLevel::Warn);
  }

  #[test]
  #[traced_test]
  fn reporter_mirrors_to_tracing() {
    let reporter = Reporter::new(Arc::new(NullSink)).for_stage(Stage::Extract);
    reporter.error("archive is corrupt");
    assert!(logs_contain("archive is corrupt"));
  }

  #[test]
  fn fn_sink_forwards_events() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let sink = FnSink(move |event: LogEvent| seen_clone.lock().unwrap().push(event.message));

    sink.emit(LogEvent::new(LogLevel::Info, Stage::Pending, "hello"));

    assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
  }

  #[test]
  fn log_event_serializes_lowercase_level() {
    let event = LogEvent::new(LogLevel::Warn, Stage::Compile, "slow");
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["level"], "warn");
    assert_eq!(json["stage"], "compile");
    let stamp = json["timestamp"].as_str().unwrap();
    assert_eq!(stamp.parse::<DateTime<Utc>>().unwrap(), event.timestamp);
  }
}
