//! Crate-level error type.
//!
//! Every stage has its own error enum; [`BuildError`] folds them together so
//! the pipeline can map any failure to a [`FailureReason`] and a hint the
//! user can act on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::extract::ExtractError;
use crate::fetch::{FetchError, RepositoryError};
use crate::invoke::InvokeError;
use crate::job::{Cancelled, FailureReason};
use crate::lock::CloneLockError;
use crate::resolve::ResolveError;

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Repository(#[from] RepositoryError),

  #[error("failed to extract {}: {source}", archive.display())]
  Extract {
    archive: PathBuf,
    #[source]
    source: ExtractError,
  },

  #[error(transparent)]
  Invoke(#[from] InvokeError),

  #[error(transparent)]
  Lock(#[from] CloneLockError),

  #[error("build cancelled")]
  Cancelled,

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },
}

impl From<Cancelled> for BuildError {
  fn from(_: Cancelled) -> Self {
    BuildError::Cancelled
  }
}

impl BuildError {
  pub fn reason(&self) -> FailureReason {
    match self {
      BuildError::Config(_) => FailureReason::Config,
      BuildError::Resolve(_) => FailureReason::UnknownDependency,
      BuildError::Fetch(FetchError::Cancelled) => FailureReason::Cancelled,
      BuildError::Fetch(_) => FailureReason::Download,
      BuildError::Repository(RepositoryError::Command(e)) => invoke_reason(e),
      BuildError::Repository(RepositoryError::Io { .. }) => FailureReason::Io,
      BuildError::Repository(_) => FailureReason::Config,
      BuildError::Extract { .. } => FailureReason::Extraction,
      BuildError::Invoke(e) => invoke_reason(e),
      BuildError::Lock(CloneLockError::Busy { .. } | CloneLockError::BusyUnknown { .. }) => FailureReason::Busy,
      BuildError::Lock(_) => FailureReason::Io,
      BuildError::Cancelled => FailureReason::Cancelled,
      BuildError::Io { .. } => FailureReason::Io,
    }
  }

  /// A suggestion for what to do next, when there is a useful one.
  pub fn hint(&self) -> Option<String> {
    let hint = match self {
      BuildError::Config(ConfigError::NotFound(_)) => "Pass the manifest with --manifest or create config/lib.json.",
      BuildError::Config(_) => "Fix the manifest or settings file and try again.",
      BuildError::Resolve(_) => "Check the extension names against the manifest's extensionSets and library extensions.",
      BuildError::Fetch(FetchError::ChecksumMismatch { .. }) => {
        "The download does not match the manifest checksum; check the url and sha256 entries."
      }
      BuildError::Fetch(FetchError::Cancelled) | BuildError::Cancelled => return None,
      BuildError::Fetch(_) => "Check your network connection; the partial download is kept and resumes on the next run.",
      BuildError::Repository(RepositoryError::Command(e)) | BuildError::Invoke(e) => return invoke_hint(e),
      BuildError::Repository(_) => return None,
      BuildError::Extract { .. } => "Run again with --force-refresh to download a fresh copy of the archive.",
      BuildError::Lock(CloneLockError::Busy { .. } | CloneLockError::BusyUnknown { .. }) => {
        "Wait for the other build to finish or choose another clone directory."
      }
      BuildError::Lock(_) | BuildError::Io { .. } => "Check that the clone directory is writable.",
    };
    Some(hint.to_string())
  }
}

fn invoke_reason(err: &InvokeError) -> FailureReason {
  match err {
    InvokeError::ExitStatus { .. } | InvokeError::Io { .. } | InvokeError::MissingTool { .. } => {
      FailureReason::ExternalProcess
    }
    InvokeError::Permission { .. } => FailureReason::Permission,
    InvokeError::ArtifactNotFound { .. } => FailureReason::ArtifactNotFound,
    InvokeError::Cancelled => FailureReason::Cancelled,
  }
}

fn invoke_hint(err: &InvokeError) -> Option<String> {
  match err {
    InvokeError::Io { command, source } if source.kind() == io::ErrorKind::NotFound => {
      let program = command.split_whitespace().next().unwrap_or(command);
      Some(format!("`{program}` was not found; install it or add it to PATH."))
    }
    InvokeError::MissingTool { program } => Some(format!(
      "`{program}` was not found; install it or add it to PATH."
    )),
    InvokeError::ExitStatus { stderr_tail, .. } => {
      let last = stderr_tail.iter().rev().find(|l| !l.trim().is_empty());
      Some(match last {
        Some(line) => format!("Last error output: {}. Re-run with --debug for a verbose build log.", line.trim()),
        None => "Re-run with --debug for a verbose build log.".to_string(),
      })
    }
    InvokeError::ArtifactNotFound { .. } => Some("Inspect the build log; the build tool reported success without output.".to_string()),
    InvokeError::Io { .. } | InvokeError::Permission { .. } | InvokeError::Cancelled => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn busy_lock_maps_to_busy() {
    let err = BuildError::from(CloneLockError::BusyUnknown {
      dir: PathBuf::from("/tmp/c"),
      lock_path: PathBuf::from("/tmp/c/.phpstatic.lock"),
    });
    assert_eq!(err.reason(), FailureReason::Busy);
    assert!(err.hint().unwrap().contains("other build"));
  }

  #[test]
  fn invoke_errors_map_by_kind() {
    let exit = BuildError::from(InvokeError::ExitStatus {
      command: "php bin/spc build".into(),
      code: Some(1),
      stderr_tail: vec!["fatal: openssl not found".into(), "".into()],
    });
    assert_eq!(exit.reason(), FailureReason::ExternalProcess);
    assert!(exit.hint().unwrap().contains("openssl not found"));

    let perm = BuildError::from(InvokeError::Permission {
      command: "composer install".into(),
      guidance: "chown it".into(),
    });
    assert_eq!(perm.reason(), FailureReason::Permission);

    let missing = BuildError::from(InvokeError::ArtifactNotFound {
      path: PathBuf::from("buildroot/bin/php"),
    });
    assert_eq!(missing.reason(), FailureReason::ArtifactNotFound);
  }

  #[test]
  fn missing_program_hint_names_it() {
    let err = BuildError::from(RepositoryError::Command(InvokeError::Io {
      command: "git clone --depth 1 https://example.com/x.git".into(),
      source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
    }));
    assert_eq!(err.reason(), FailureReason::ExternalProcess);
    assert_eq!(err.hint().unwrap(), "`git` was not found; install it or add it to PATH.");

    let preflight = BuildError::from(InvokeError::MissingTool {
      program: "composer".into(),
    });
    assert_eq!(preflight.reason(), FailureReason::ExternalProcess);
    assert_eq!(preflight.hint().unwrap(), "`composer` was not found; install it or add it to PATH.");
  }

  #[test]
  fn cancellation_has_no_hint() {
    assert_eq!(BuildError::Cancelled.reason(), FailureReason::Cancelled);
    assert_eq!(BuildError::from(FetchError::Cancelled).reason(), FailureReason::Cancelled);
    assert!(BuildError::Cancelled.hint().is_none());
  }

  #[test]
  fn unknown_extension_is_unknown_dependency() {
    let err = BuildError::from(ResolveError::UnknownExtension("nope".into()));
    assert_eq!(err.reason(), FailureReason::UnknownDependency);
  }
}
