//! Run-state of a single build.
//!
//! A [`BuildJob`] is owned by the pipeline task for the duration of one run.
//! Observers never touch it directly; they see [`LogEvent`](crate::log::LogEvent)s
//! and the final [`BuildResult`].

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::ConfigError;
use crate::consts::JOB_LOG_TAIL;
use crate::log::{LogEvent, LogSink};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  #[default]
  Pending,
  LoadConfig,
  Resolve,
  Repository,
  Download,
  Extract,
  InstallDependencies,
  Compile,
  Verify,
  Finished,
}

impl Stage {
  pub fn as_str(&self) -> &'static str {
    match self {
      Stage::Pending => "pending",
      Stage::LoadConfig => "load_config",
      Stage::Resolve => "resolve",
      Stage::Repository => "repository",
      Stage::Download => "download",
      Stage::Extract => "extract",
      Stage::InstallDependencies => "install_dependencies",
      Stage::Compile => "compile",
      Stage::Verify => "verify",
      Stage::Finished => "finished",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What the user asked for. Immutable for the duration of one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSelection {
  pub clone_directory: PathBuf,
  pub php_version: String,
  pub extensions: BTreeSet<String>,
  /// Re-download archives even when a matching file is already present.
  pub force_refresh: bool,
  /// Pass `--debug` to the build tool.
  pub debug: bool,
}

impl BuildSelection {
  /// Validate and normalize user input.
  ///
  /// Extension names are trimmed and lowercased; the PHP version must be
  /// `MAJOR.MINOR` or `MAJOR.MINOR.PATCH`.
  pub fn new<I, S>(clone_directory: impl Into<PathBuf>, php_version: &str, extensions: I) -> Result<Self, ConfigError>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let php_version = php_version.trim();
    if !is_valid_php_version(php_version) {
      return Err(ConfigError::InvalidPhpVersion(php_version.to_string()));
    }

    let mut normalized = BTreeSet::new();
    for ext in extensions {
      let ext = ext.as_ref().trim().to_ascii_lowercase();
      if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::InvalidExtension(ext));
      }
      normalized.insert(ext);
    }

    Ok(Self {
      clone_directory: clone_directory.into(),
      php_version: php_version.to_string(),
      extensions: normalized,
      force_refresh: false,
      debug: false,
    })
  }

  pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
    self.force_refresh = force_refresh;
    self
  }

  pub fn with_debug(mut self, debug: bool) -> Self {
    self.debug = debug;
    self
  }

  /// `MAJOR.MINOR` part of the requested version.
  pub fn php_minor_version(&self) -> &str {
    match self.php_version.match_indices('.').nth(1) {
      Some((idx, _)) => &self.php_version[..idx],
      None => &self.php_version,
    }
  }
}

fn is_valid_php_version(version: &str) -> bool {
  let parts: Vec<&str> = version.split('.').collect();
  (2..=3).contains(&parts.len()) && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Progress of a single library through download and extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryStatus {
  Pending,
  /// An existing archive was reused.
  Cached,
  Downloaded,
  Extracted,
}

/// Category of a failed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
  Config,
  UnknownDependency,
  Download,
  Extraction,
  Permission,
  ExternalProcess,
  ArtifactNotFound,
  Cancelled,
  /// Another build holds the clone directory.
  Busy,
  Io,
}

impl fmt::Display for FailureReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      FailureReason::Config => "configuration error",
      FailureReason::UnknownDependency => "unknown dependency",
      FailureReason::Download => "download failed",
      FailureReason::Extraction => "extraction failed",
      FailureReason::Permission => "permission denied",
      FailureReason::ExternalProcess => "external process failed",
      FailureReason::ArtifactNotFound => "artifact not found",
      FailureReason::Cancelled => "cancelled",
      FailureReason::Busy => "clone directory busy",
      FailureReason::Io => "i/o error",
    };
    f.write_str(s)
  }
}

/// Terminal outcome of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildResult {
  Success { artifact: PathBuf },
  Failure { reason: FailureReason, message: String },
}

impl BuildResult {
  pub fn is_success(&self) -> bool {
    matches!(self, BuildResult::Success { .. })
  }

  pub fn reason(&self) -> Option<FailureReason> {
    match self {
      BuildResult::Success { .. } => None,
      BuildResult::Failure { reason, .. } => Some(*reason),
    }
  }

  pub fn artifact(&self) -> Option<&Path> {
    match self {
      BuildResult::Success { artifact } => Some(artifact),
      BuildResult::Failure { .. } => None,
    }
  }
}

/// Returned by stage code that noticed a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("build cancelled")]
pub struct Cancelled;

#[derive(Debug, Default)]
struct CancelInner {
  cancelled: AtomicBool,
  notify: Notify,
}

/// Shared cancellation flag.
///
/// Stages poll it before every external process and between download chunks;
/// process runners also await it to kill a running child.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  inner: Arc<CancelInner>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.inner.cancelled.store(true, Ordering::SeqCst);
    self.inner.notify.notify_waiters();
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  pub fn check(&self) -> Result<(), Cancelled> {
    if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
  }

  /// Resolves once [`cancel`](Self::cancel) has been called.
  pub async fn cancelled(&self) {
    loop {
      let notified = self.inner.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.is_cancelled() {
        return;
      }
      notified.await;
    }
  }
}

/// Bounded tail of the messages a job has emitted.
#[derive(Debug, Default)]
pub struct LogTail {
  lines: Mutex<VecDeque<String>>,
}

impl LogTail {
  pub fn lines(&self) -> Vec<String> {
    self.lines.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
  }
}

impl LogSink for LogTail {
  fn emit(&self, event: LogEvent) {
    let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
    if lines.len() >= JOB_LOG_TAIL {
      lines.pop_front();
    }
    lines.push_back(format!("[{}] {}", event.level, event.message));
  }
}

/// Mutable state of one build run.
#[derive(Debug)]
pub struct BuildJob {
  selection: BuildSelection,
  stage: Stage,
  libraries: Vec<(String, LibraryStatus)>,
  log: Arc<LogTail>,
  cancel: CancelToken,
  result: Option<BuildResult>,
}

impl BuildJob {
  pub fn new(selection: BuildSelection, cancel: CancelToken) -> Self {
    Self {
      selection,
      stage: Stage::Pending,
      libraries: Vec::new(),
      log: Arc::new(LogTail::default()),
      cancel,
      result: None,
    }
  }

  pub fn selection(&self) -> &BuildSelection {
    &self.selection
  }

  pub fn stage(&self) -> Stage {
    self.stage
  }

  pub fn enter(&mut self, stage: Stage) {
    self.stage = stage;
  }

  pub fn cancel_token(&self) -> &CancelToken {
    &self.cancel
  }

  /// Sink that records into this job's log tail.
  pub fn log_tail(&self) -> Arc<LogTail> {
    Arc::clone(&self.log)
  }

  pub fn log_lines(&self) -> Vec<String> {
    self.log.lines()
  }

  /// Register the resolved libraries, all pending.
  pub fn track_libraries<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
    self.libraries = names.into_iter().map(|n| (n.to_string(), LibraryStatus::Pending)).collect();
  }

  pub fn set_library_status(&mut self, name: &str, status: LibraryStatus) {
    if let Some(entry) = self.libraries.iter_mut().find(|(n, _)| n == name) {
      entry.1 = status;
    }
  }

  pub fn library_status(&self, name: &str) -> Option<LibraryStatus> {
    self.libraries.iter().find(|(n, _)| n == name).map(|(_, s)| *s)
  }

  pub fn libraries(&self) -> &[(String, LibraryStatus)] {
    &self.libraries
  }

  pub fn finish(&mut self, result: BuildResult) {
    self.result = Some(result);
  }

  pub fn result(&self) -> Option<&BuildResult> {
    self.result.as_ref()
  }
}
