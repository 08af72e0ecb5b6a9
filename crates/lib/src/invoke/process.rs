//! Running external programs with live output.
//!
//! Every line a child writes to stdout or stderr is forwarded to the
//! [`Reporter`] as soon as it is read. A cancelled build kills the child.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::job::CancelToken;
use crate::log::Reporter;

/// Lines of each stream kept for error reports.
const OUTPUT_TAIL: usize = 200;

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommand {
  pub program: String,
  pub args: Vec<String>,
  pub cwd: Option<PathBuf>,
  pub env: BTreeMap<String, String>,
}

impl StepCommand {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      cwd: None,
      env: BTreeMap::new(),
    }
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.cwd = Some(dir.into());
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  pub fn working_dir(&self) -> Option<&Path> {
    self.cwd.as_deref()
  }
}

impl fmt::Display for StepCommand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.program)?;
    for arg in &self.args {
      if arg.is_empty() || arg.contains(char::is_whitespace) {
        write!(f, " \"{arg}\"")?;
      } else {
        write!(f, " {arg}")?;
      }
    }
    Ok(())
  }
}

/// Result of a process that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
  /// Exit code; `None` when the process was terminated by a signal.
  pub code: Option<i32>,
  pub stdout_tail: Vec<String>,
  pub stderr_tail: Vec<String>,
}

impl ProcessOutput {
  pub fn success() -> Self {
    Self {
      code: Some(0),
      ..Self::default()
    }
  }

  pub fn failed(code: i32) -> Self {
    Self {
      code: Some(code),
      ..Self::default()
    }
  }

  pub fn with_stdout<I, S>(mut self, lines: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.stdout_tail = lines.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_stderr<I, S>(mut self, lines: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.stderr_tail = lines.into_iter().map(Into::into).collect();
    self
  }

  pub fn is_success(&self) -> bool {
    self.code == Some(0)
  }
}

#[derive(Debug, Error)]
pub enum ProcessError {
  #[error("failed to start {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("failed waiting for {program}: {source}")]
  Wait {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("cancelled while running {program}")]
  Cancelled { program: String },
}

/// Seam between the build stages and the operating system.
#[async_trait]
pub trait CommandRunner: Send + Sync {
  /// Run `command` to completion, streaming its output to `reporter`.
  ///
  /// A non-zero exit is not an error here; callers inspect
  /// [`ProcessOutput::code`].
  async fn run(
    &self,
    command: &StepCommand,
    reporter: &Reporter,
    cancel: &CancelToken,
  ) -> Result<ProcessOutput, ProcessError>;

  /// Whether `program` could be started at all.
  fn is_available(&self, program: &str) -> bool {
    find_program(program).is_some()
  }
}

/// Locate `program` the way a shell would: as given when it contains a path
/// separator, otherwise in each `PATH` directory.
pub fn find_program(program: &str) -> Option<PathBuf> {
  let path = Path::new(program);
  if path.is_absolute() || path.components().count() > 1 {
    return path.is_file().then(|| path.to_path_buf());
  }
  let dirs = std::env::var_os("PATH")?;
  std::env::split_paths(&dirs)
    .flat_map(|dir| program_candidates(&dir.join(program)))
    .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn program_candidates(base: &Path) -> Vec<PathBuf> {
  let mut candidates = vec![base.to_path_buf()];
  if base.extension().is_none() {
    let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    for ext in exts.split(';').filter(|e| !e.is_empty()) {
      let mut name = base.as_os_str().to_os_string();
      name.push(ext);
      candidates.push(PathBuf::from(name));
    }
  }
  candidates
}

#[cfg(not(windows))]
fn program_candidates(base: &Path) -> Vec<PathBuf> {
  vec![base.to_path_buf()]
}

/// Spawns real processes with tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioRunner;

#[async_trait]
impl CommandRunner for TokioRunner {
  async fn run(
    &self,
    command: &StepCommand,
    reporter: &Reporter,
    cancel: &CancelToken,
  ) -> Result<ProcessOutput, ProcessError> {
    let program = command.program.clone();
    if cancel.is_cancelled() {
      return Err(ProcessError::Cancelled { program });
    }

    let mut cmd = Command::new(&command.program);
    cmd
      .args(&command.args)
      .envs(&command.env)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
      cmd.current_dir(cwd);
    }

    debug!(command = %command, cwd = ?command.cwd, "spawning process");
    reporter.info(format!("$ {command}"));

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
      program: program.clone(),
      source,
    })?;

    let stdout = child.stdout.take().map(|out| tokio::spawn(pump(out, reporter.clone())));
    let stderr = child.stderr.take().map(|err| tokio::spawn(pump(err, reporter.clone())));

    let status = tokio::select! {
      status = child.wait() => status.map_err(|source| ProcessError::Wait { program: program.clone(), source })?,
      _ = cancel.cancelled() => {
        if let Err(e) = child.kill().await {
          debug!(error = %e, "failed to kill cancelled process");
        }
        for task in [stdout, stderr].into_iter().flatten() {
          task.abort();
        }
        return Err(ProcessError::Cancelled { program });
      }
    };

    let stdout_tail = match stdout {
      Some(task) => task.await.unwrap_or_default(),
      None => Vec::new(),
    };
    let stderr_tail = match stderr {
      Some(task) => task.await.unwrap_or_default(),
      None => Vec::new(),
    };

    debug!(command = %command, code = ?status.code(), "process exited");
    Ok(ProcessOutput {
      code: status.code(),
      stdout_tail,
      stderr_tail,
    })
  }
}

/// Forward each line of `reader` and keep the last [`OUTPUT_TAIL`] lines.
async fn pump<R>(reader: R, reporter: Reporter) -> Vec<String>
where
  R: AsyncRead + Unpin,
{
  let mut reader = BufReader::new(reader);
  let mut tail = VecDeque::with_capacity(OUTPUT_TAIL);
  let mut buf = Vec::new();

  loop {
    buf.clear();
    match reader.read_until(b'\n', &mut buf).await {
      Ok(0) => break,
      Ok(_) => {
        let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
          continue;
        }
        reporter.info(line.clone());
        if tail.len() == OUTPUT_TAIL {
          tail.pop_front();
        }
        tail.push_back(line);
      }
      Err(e) => {
        debug!(error = %e, "stopped reading process output");
        break;
      }
    }
  }

  tail.into()
}
