//! What to do when an external step fails for lack of permissions.
//!
//! The strategy is picked once per process from the host OS. Windows can
//! re-run a step elevated through UAC; POSIX hosts never escalate on their
//! own and tell the user how to fix the directory permissions instead.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use super::process::{ProcessError, ProcessOutput, StepCommand};
use crate::platform::is_elevated;
use crate::platform::os::Os;

/// Phrases tools print when they hit a permission problem.
const PERMISSION_PHRASES: &[&str] = &[
  "permission denied",
  "access is denied",
  "access denied",
  "operation not permitted",
  "eacces",
  "eperm",
  "is not writable",
  "requires elevation",
];

/// Outcome of a permission failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
  /// Run this command once instead.
  Retry(StepCommand),
  /// Give up and show `guidance` to the user.
  Abort { guidance: String },
}

pub trait PrivilegeStrategy: Send + Sync + fmt::Debug {
  fn name(&self) -> &'static str;

  /// Decide how to react to `failed` hitting a permission error in `dir`.
  fn escalate(&self, failed: &StepCommand, dir: &Path) -> Escalation;

  /// Message shown when escalation is not attempted or did not help.
  fn guidance(&self, failed: &StepCommand, dir: &Path) -> String;
}

/// Never escalates.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixStrategy;

impl PrivilegeStrategy for PosixStrategy {
  fn name(&self) -> &'static str {
    "posix"
  }

  fn escalate(&self, failed: &StepCommand, dir: &Path) -> Escalation {
    Escalation::Abort {
      guidance: self.guidance(failed, dir),
    }
  }

  fn guidance(&self, failed: &StepCommand, dir: &Path) -> String {
    if is_elevated() {
      format!(
        "`{failed}` was denied access to {} even though phpstatic runs as root. \
         Check that the filesystem is not mounted read-only and that no other process holds the files.",
        dir.display()
      )
    } else {
      format!(
        "`{failed}` was denied access to {dir}. Give your user ownership of the directory \
         (for example `sudo chown -R \"$(id -un)\" {dir}`) or re-run phpstatic with elevated privileges.",
        dir = dir.display()
      )
    }
  }
}

/// Retries a failed step once through an elevated PowerShell.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsStrategy;

impl WindowsStrategy {
  /// `Start-Process -Verb RunAs -Wait`, forwarding the child's exit code.
  pub fn elevated_command(failed: &StepCommand, dir: &Path) -> StepCommand {
    let args = failed.args.iter().map(|a| ps_quote(a)).collect::<Vec<_>>().join(",");
    let mut script = format!(
      "$p = Start-Process -FilePath {} -WorkingDirectory {} -Verb RunAs -Wait -PassThru",
      ps_quote(&failed.program),
      ps_quote(&dir.to_string_lossy()),
    );
    if !args.is_empty() {
      script.push_str(" -ArgumentList ");
      script.push_str(&args);
    }
    script.push_str("; exit $p.ExitCode");

    let mut cmd = StepCommand::new("powershell.exe")
      .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command"])
      .arg(script)
      .current_dir(dir);
    cmd.env = failed.env.clone();
    cmd
  }
}

impl PrivilegeStrategy for WindowsStrategy {
  fn name(&self) -> &'static str {
    "windows"
  }

  fn escalate(&self, failed: &StepCommand, dir: &Path) -> Escalation {
    Escalation::Retry(Self::elevated_command(failed, dir))
  }

  fn guidance(&self, failed: &StepCommand, dir: &Path) -> String {
    format!(
      "`{failed}` was denied access to {} even when elevated. \
       Accept the UAC prompt, or move the clone directory somewhere your account can write to.",
      dir.display()
    )
  }
}

/// The strategy for `os`.
pub fn for_os(os: Os) -> Arc<dyn PrivilegeStrategy> {
  if os.is_windows() {
    Arc::new(WindowsStrategy)
  } else {
    Arc::new(PosixStrategy)
  }
}

/// Whether a step failed because of missing permissions.
pub fn is_permission_failure(result: &Result<ProcessOutput, ProcessError>) -> bool {
  match result {
    Err(ProcessError::Spawn { source, .. }) => source.kind() == io::ErrorKind::PermissionDenied,
    Err(_) => false,
    Ok(output) if output.is_success() => false,
    Ok(output) => output
      .stderr_tail
      .iter()
      .chain(&output.stdout_tail)
      .any(|line| mentions_permission(line)),
  }
}

fn mentions_permission(line: &str) -> bool {
  let line = line.to_ascii_lowercase();
  PERMISSION_PHRASES.iter().any(|phrase| line.contains(phrase))
}

/// Single-quoted PowerShell string literal.
fn ps_quote(s: &str) -> String {
  format!("'{}'", s.replace('\'', "''"))
}
