//! Build Invoker: drives composer and static-php-cli.
//!
//! The steps run in order: install the build tool's PHP dependencies, run
//! `spc build`, locate the produced executable and ask it for its modules.
//! Any non-zero exit aborts the build; partial build output is left on disk.

mod privilege;
mod process;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::Settings;
use crate::job::{BuildJob, CancelToken, Cancelled, Stage};
use crate::layout::BuildLayout;
use crate::log::Reporter;
use crate::platform::os::Os;

pub use privilege::{Escalation, PosixStrategy, PrivilegeStrategy, WindowsStrategy, for_os, is_permission_failure};
pub use process::{CommandRunner, ProcessError, ProcessOutput, StepCommand, TokioRunner, find_program};

#[derive(Debug, Error)]
pub enum InvokeError {
  #[error("`{command}` {}", exit_description(code))]
  ExitStatus {
    command: String,
    code: Option<i32>,
    stderr_tail: Vec<String>,
  },

  #[error("failed to run `{command}`: {source}")]
  Io {
    command: String,
    #[source]
    source: io::Error,
  },

  #[error("{guidance}")]
  Permission { command: String, guidance: String },

  #[error("`{program}` was not found on PATH")]
  MissingTool { program: String },

  #[error("the build finished but {} does not exist", path.display())]
  ArtifactNotFound { path: PathBuf },

  #[error("build cancelled")]
  Cancelled,
}

impl From<Cancelled> for InvokeError {
  fn from(_: Cancelled) -> Self {
    InvokeError::Cancelled
  }
}

fn exit_description(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("exited with code {code}"),
    None => "was terminated by a signal".to_string(),
  }
}

impl InvokeError {
  fn from_process(command: &StepCommand, err: ProcessError) -> Self {
    match err {
      ProcessError::Cancelled { .. } => InvokeError::Cancelled,
      ProcessError::Spawn { source, .. } | ProcessError::Wait { source, .. } => InvokeError::Io {
        command: command.to_string(),
        source,
      },
    }
  }
}

/// Run `command`, turning spawn failures and non-zero exits into errors.
pub async fn run_checked(
  runner: &dyn CommandRunner,
  command: &StepCommand,
  reporter: &Reporter,
  cancel: &CancelToken,
) -> Result<ProcessOutput, InvokeError> {
  cancel.check()?;
  let result = runner.run(command, reporter, cancel).await;
  check_output(command, result)
}

fn check_output(
  command: &StepCommand,
  result: Result<ProcessOutput, ProcessError>,
) -> Result<ProcessOutput, InvokeError> {
  let output = result.map_err(|e| InvokeError::from_process(command, e))?;
  if output.is_success() {
    Ok(output)
  } else {
    Err(InvokeError::ExitStatus {
      command: command.to_string(),
      code: output.code,
      stderr_tail: output.stderr_tail,
    })
  }
}

/// Runs the external build steps inside a [`BuildLayout`].
#[derive(Clone)]
pub struct BuildInvoker {
  runner: Arc<dyn CommandRunner>,
  privilege: Arc<dyn PrivilegeStrategy>,
  settings: Settings,
  os: Os,
}

/// Fail fast when git, composer or php cannot be started.
pub fn check_tools(runner: &dyn CommandRunner, settings: &Settings, reporter: &Reporter) -> Result<(), InvokeError> {
  for program in [&settings.git_program, &settings.composer_program, &settings.php_program] {
    if !runner.is_available(program) {
      return Err(InvokeError::MissingTool {
        program: program.clone(),
      });
    }
  }
  reporter.info(format!(
    "found {}, {} and {}",
    settings.git_program, settings.composer_program, settings.php_program
  ));
  Ok(())
}

impl BuildInvoker {
  pub fn new(runner: Arc<dyn CommandRunner>, privilege: Arc<dyn PrivilegeStrategy>, settings: Settings, os: Os) -> Self {
    Self {
      runner,
      privilege,
      settings,
      os,
    }
  }

  /// `composer install` when a lock file exists, else `composer update`.
  pub fn dependency_install_command(&self, layout: &BuildLayout) -> StepCommand {
    let cmd = StepCommand::new(&self.settings.composer_program).current_dir(layout.tool_dir());
    if layout.composer_lock().exists() {
      cmd.args(["install", "--ignore-platform-reqs"])
    } else {
      cmd.args(["update", "--no-dev", "--prefer-dist"])
    }
  }

  pub fn build_command(&self, layout: &BuildLayout, php_version: &str, extensions: &[String], debug: bool) -> StepCommand {
    let mut cmd = StepCommand::new(&self.settings.php_program)
      .arg(layout.spc_entry().to_string_lossy())
      .arg("build")
      .arg(extensions.join(","))
      .arg("--build-cli")
      .arg(format!("--with-php={php_version}"))
      .env("SPC_CONCURRENCY", self.settings.build_concurrency.to_string())
      .current_dir(layout.tool_dir());
    if debug {
      cmd = cmd.arg("--debug");
    }
    cmd
  }

  /// Step (a): install the build tool's own dependencies.
  pub async fn install_dependencies(
    &self,
    layout: &BuildLayout,
    reporter: &Reporter,
    cancel: &CancelToken,
  ) -> Result<(), InvokeError> {
    let cmd = self.dependency_install_command(layout);
    self.run_privileged(&cmd, layout.tool_dir(), true, reporter, cancel).await
  }

  /// Step (b): compile PHP with `extensions`.
  pub async fn compile(
    &self,
    layout: &BuildLayout,
    php_version: &str,
    extensions: &[String],
    debug: bool,
    reporter: &Reporter,
    cancel: &CancelToken,
  ) -> Result<(), InvokeError> {
    let cmd = self.build_command(layout, php_version, extensions, debug);
    reporter.info(format!(
      "building PHP {php_version} with {} extensions (SPC_CONCURRENCY={})",
      extensions.len(),
      self.settings.build_concurrency
    ));
    self.run_privileged(&cmd, layout.tool_dir(), false, reporter, cancel).await
  }

  pub fn locate_artifact(&self, layout: &BuildLayout) -> Result<PathBuf, InvokeError> {
    let path = layout.artifact_path(self.os);
    if path.is_file() {
      Ok(path)
    } else {
      Err(InvokeError::ArtifactNotFound { path })
    }
  }

  /// Run `<php> -m` and return the compiled-in module names.
  pub async fn verify(&self, artifact: &Path, reporter: &Reporter, cancel: &CancelToken) -> Result<Vec<String>, InvokeError> {
    let mut cmd = StepCommand::new(artifact.to_string_lossy()).arg("-m");
    if let Some(dir) = artifact.parent() {
      cmd = cmd.current_dir(dir);
    }
    let output = run_checked(self.runner.as_ref(), &cmd, reporter, cancel).await?;

    let modules: Vec<String> = output
      .stdout_tail
      .iter()
      .map(|l| l.trim())
      .filter(|l| !l.is_empty() && !l.starts_with('['))
      .map(str::to_string)
      .collect();
    reporter.info(format!("{} reports {} modules", artifact.display(), modules.len()));
    Ok(modules)
  }

  /// All invoker steps for `job`, tagging events with the matching stage.
  pub async fn run_build(
    &self,
    job: &mut BuildJob,
    layout: &BuildLayout,
    extensions: &[String],
    reporter: &Reporter,
  ) -> Result<PathBuf, InvokeError> {
    let cancel = job.cancel_token().clone();
    let php_version = job.selection().php_version.clone();
    let debug = job.selection().debug;

    job.enter(Stage::InstallDependencies);
    self
      .install_dependencies(layout, &reporter.for_stage(Stage::InstallDependencies), &cancel)
      .await?;

    job.enter(Stage::Compile);
    self
      .compile(layout, &php_version, extensions, debug, &reporter.for_stage(Stage::Compile), &cancel)
      .await?;

    job.enter(Stage::Verify);
    let verify_reporter = reporter.for_stage(Stage::Verify);
    let artifact = self.locate_artifact(layout)?;
    verify_reporter.info(format!("found {}", artifact.display()));
    self.verify(&artifact, &verify_reporter, &cancel).await?;

    info!(artifact = %artifact.display(), "build produced artifact");
    Ok(artifact)
  }

  async fn run_privileged(
    &self,
    cmd: &StepCommand,
    dir: &Path,
    allow_retry: bool,
    reporter: &Reporter,
    cancel: &CancelToken,
  ) -> Result<(), InvokeError> {
    cancel.check()?;
    let result = self.runner.run(cmd, reporter, cancel).await;
    if !is_permission_failure(&result) {
      return check_output(cmd, result).map(drop);
    }

    let escalation = if allow_retry {
      self.privilege.escalate(cmd, dir)
    } else {
      Escalation::Abort {
        guidance: self.privilege.guidance(cmd, dir),
      }
    };

    match escalation {
      Escalation::Abort { guidance } => Err(InvokeError::Permission {
        command: cmd.to_string(),
        guidance,
      }),
      Escalation::Retry(elevated) => {
        reporter.warn(format!(
          "`{cmd}` was denied access; retrying once with elevated privileges"
        ));
        cancel.check()?;
        let retry = self.runner.run(&elevated, reporter, cancel).await;
        if is_permission_failure(&retry) {
          return Err(InvokeError::Permission {
            command: cmd.to_string(),
            guidance: self.privilege.guidance(cmd, dir),
          });
        }
        check_output(&elevated, retry).map(drop)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use tempfile::TempDir;

  use crate::job::BuildSelection;
  use crate::log::MemorySink;
  use crate::util::testutil::ScriptedRunner;

  struct Fixture {
    _temp: TempDir,
    layout: BuildLayout,
    sink: Arc<MemorySink>,
    reporter: Reporter,
  }

  fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let layout = BuildLayout::new(temp.path(), "static-php-cli");
    fs::create_dir_all(layout.tool_dir()).unwrap();
    let sink = Arc::new(MemorySink::new());
    let reporter = Reporter::new(sink.clone());
    Fixture {
      _temp: temp,
      layout,
      sink,
      reporter,
    }
  }

  fn invoker(runner: Arc<ScriptedRunner>, privilege: Arc<dyn PrivilegeStrategy>) -> BuildInvoker {
    BuildInvoker::new(runner, privilege, Settings::default(), Os::Linux)
  }

  fn place_artifact(layout: &BuildLayout) {
    let path = layout.artifact_path(Os::Linux);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"#!php").unwrap();
  }

  fn job(layout: &BuildLayout) -> BuildJob {
    let selection = BuildSelection::new(layout.clone_dir(), "8.3", ["mysql"]).unwrap();
    BuildJob::new(selection, CancelToken::new())
  }

  #[test]
  fn install_command_depends_on_lock_file() {
    let fx = fixture();
    let invoker = invoker(Arc::new(ScriptedRunner::succeeding()), Arc::new(PosixStrategy));

    let cmd = invoker.dependency_install_command(&fx.layout);
    assert_eq!(cmd.args, vec!["update", "--no-dev", "--prefer-dist"]);

    fs::write(fx.layout.composer_lock(), "{}").unwrap();
    let cmd = invoker.dependency_install_command(&fx.layout);
    assert_eq!(cmd.args, vec!["install", "--ignore-platform-reqs"]);
    assert_eq!(cmd.working_dir(), Some(fx.layout.tool_dir()));
  }

  #[test]
  fn build_command_shape() {
    let fx = fixture();
    let invoker = invoker(Arc::new(ScriptedRunner::succeeding()), Arc::new(PosixStrategy));
    let exts = vec!["ctype".to_string(), "mbstring".to_string()];

    let cmd = invoker.build_command(&fx.layout, "8.3.14", &exts, true);

    assert_eq!(cmd.program, "php");
    assert_eq!(
      cmd.args,
      vec![
        Path::new("bin").join("spc").to_string_lossy().to_string(),
        "build".into(),
        "ctype,mbstring".into(),
        "--build-cli".into(),
        "--with-php=8.3.14".into(),
        "--debug".into(),
      ]
    );
    assert_eq!(cmd.env.get("SPC_CONCURRENCY").map(String::as_str), Some("4"));
  }

  #[tokio::test]
  async fn successful_build_returns_artifact() {
    let fx = fixture();
    place_artifact(&fx.layout);
    let runner = Arc::new(ScriptedRunner::new(|cmd| {
      if cmd.args.first().map(String::as_str) == Some("-m") {
        Ok(ProcessOutput::success().with_stdout(["[PHP Modules]", "Core", "mbstring", "", "[Zend Modules]"]))
      } else {
        Ok(ProcessOutput::success())
      }
    }));
    let invoker = invoker(runner.clone(), Arc::new(PosixStrategy));
    let mut job = job(&fx.layout);

    let artifact = invoker
      .run_build(&mut job, &fx.layout, &["mbstring".to_string()], &fx.reporter)
      .await
      .unwrap();

    assert_eq!(artifact, fx.layout.artifact_path(Os::Linux));
    assert_eq!(job.stage(), Stage::Verify);
    let calls = runner.call_summaries();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].starts_with("composer") && calls[0].ends_with(" update"));
    assert!(calls[1].starts_with("php "));
    assert!(calls[2].ends_with(" -m"));
    assert!(fx.sink.contains("reports 2 modules"));
  }

  #[tokio::test]
  async fn failing_compile_is_external_process_error_without_artifact_check() {
    let fx = fixture();
    let runner = Arc::new(ScriptedRunner::new(|cmd| {
      if cmd.program == "php" {
        Ok(ProcessOutput::failed(1).with_stderr(["make: *** [all] Error 2"]))
      } else {
        Ok(ProcessOutput::success())
      }
    }));
    let invoker = invoker(runner.clone(), Arc::new(PosixStrategy));
    let mut job = job(&fx.layout);

    let err = invoker
      .run_build(&mut job, &fx.layout, &["mbstring".to_string()], &fx.reporter)
      .await
      .unwrap_err();

    match err {
      InvokeError::ExitStatus { code, stderr_tail, .. } => {
        assert_eq!(code, Some(1));
        assert_eq!(stderr_tail, vec!["make: *** [all] Error 2".to_string()]);
      }
      other => panic!("expected ExitStatus, got {other:?}"),
    }
    assert_eq!(job.stage(), Stage::Compile);
    assert_eq!(runner.calls().len(), 2, "no verification after a failed compile");
  }

  #[tokio::test]
  async fn missing_artifact_after_successful_build() {
    let fx = fixture();
    let runner = Arc::new(ScriptedRunner::succeeding());
    let invoker = invoker(runner.clone(), Arc::new(PosixStrategy));
    let mut job = job(&fx.layout);

    let err = invoker
      .run_build(&mut job, &fx.layout, &[], &fx.reporter)
      .await
      .unwrap_err();

    assert!(matches!(err, InvokeError::ArtifactNotFound { .. }));
    assert_eq!(runner.calls().len(), 2);
  }

  #[tokio::test]
  async fn posix_permission_failure_aborts_with_guidance() {
    let fx = fixture();
    let runner = Arc::new(ScriptedRunner::new(|cmd| {
      if cmd.program.starts_with("composer") {
        Ok(ProcessOutput::failed(1).with_stderr(["mkdir(): Permission denied"]))
      } else {
        Ok(ProcessOutput::success())
      }
    }));
    let invoker = invoker(runner.clone(), Arc::new(PosixStrategy));

    let err = invoker
      .install_dependencies(&fx.layout, &fx.reporter, &CancelToken::new())
      .await
      .unwrap_err();

    match err {
      InvokeError::Permission { guidance, .. } => {
        assert!(guidance.contains(&fx.layout.tool_dir().display().to_string()));
      }
      other => panic!("expected Permission, got {other:?}"),
    }
    assert_eq!(runner.calls().len(), 1, "posix must not retry");
  }

  #[tokio::test]
  async fn windows_permission_failure_retries_once_elevated() {
    let fx = fixture();
    let runner = Arc::new(ScriptedRunner::new(|cmd| {
      if cmd.program.starts_with("composer") {
        Err(ProcessError::Spawn {
          program: "composer".into(),
          source: io::Error::from(io::ErrorKind::PermissionDenied),
        })
      } else {
        Ok(ProcessOutput::success())
      }
    }));
    let invoker = invoker(runner.clone(), Arc::new(WindowsStrategy));

    invoker
      .install_dependencies(&fx.layout, &fx.reporter, &CancelToken::new())
      .await
      .unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].program.starts_with("composer"));
    assert_eq!(calls[1].program, "powershell.exe");
    assert!(fx.sink.contains("retrying once with elevated privileges"));
  }

  #[tokio::test]
  async fn windows_elevated_retry_happens_only_once() {
    let fx = fixture();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let runner = Arc::new(ScriptedRunner::new(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(ProcessOutput::failed(1).with_stderr(["Access is denied."]))
    }));
    let invoker = invoker(runner, Arc::new(WindowsStrategy));

    let err = invoker
      .install_dependencies(&fx.layout, &fx.reporter, &CancelToken::new())
      .await
      .unwrap_err();

    assert!(matches!(err, InvokeError::Permission { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn cancelled_token_skips_processes() {
    let fx = fixture();
    let runner = Arc::new(ScriptedRunner::succeeding());
    let invoker = invoker(runner.clone(), Arc::new(PosixStrategy));
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = invoker
      .install_dependencies(&fx.layout, &fx.reporter, &cancel)
      .await
      .unwrap_err();

    assert!(matches!(err, InvokeError::Cancelled));
    assert!(runner.calls().is_empty());
  }
}
