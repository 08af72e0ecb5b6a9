//! The build tool checkout.
//!
//! A usable checkout is detected with `gix`; cloning and updating go through
//! the `git` client so their output streams like every other step.

use std::io;
use std::path::{Path, PathBuf};

use gix::remote::Direction;
use thiserror::Error;
use tracing::debug;

use crate::invoke::{CommandRunner, InvokeError, StepCommand, run_checked};
use crate::job::CancelToken;
use crate::log::Reporter;

#[derive(Debug, Error)]
pub enum RepositoryError {
  #[error(
    "{} exists but is not a git checkout. Remove it or pick another clone directory.",
    path.display()
  )]
  NotARepository { path: PathBuf },

  #[error(
    "{} is a checkout of {actual}, expected {expected}. Remove it or pick another clone directory.",
    path.display()
  )]
  OriginMismatch {
    path: PathBuf,
    expected: String,
    actual: String,
  },

  #[error("failed to inspect {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Command(#[from] InvokeError),
}

/// What currently occupies the checkout directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryState {
  Missing,
  Empty,
  Checkout { origin: Option<String> },
  NotARepository,
}

pub fn inspect_repository(dir: &Path) -> Result<RepositoryState, RepositoryError> {
  let io_err = |source| RepositoryError::Io {
    path: dir.to_path_buf(),
    source,
  };

  let mut entries = match std::fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RepositoryState::Missing),
    Err(e) => return Err(io_err(e)),
  };
  if entries.next().is_none() {
    return Ok(RepositoryState::Empty);
  }

  match gix::open(dir) {
    Ok(repo) => {
      let origin = repo
        .find_default_remote(Direction::Fetch)
        .and_then(Result::ok)
        .and_then(|remote| remote.url(Direction::Fetch).map(|url| url.to_bstring().to_string()));
      Ok(RepositoryState::Checkout { origin })
    }
    Err(e) => {
      debug!(path = ?dir, error = %e, "not a git repository");
      Ok(RepositoryState::NotARepository)
    }
  }
}

/// Clone `url` into `dest`, or fast-forward an existing checkout of it.
pub async fn fetch_repository(
  url: &str,
  dest: &Path,
  git_program: &str,
  runner: &dyn CommandRunner,
  reporter: &Reporter,
  cancel: &CancelToken,
) -> Result<(), RepositoryError> {
  let dir = dest.to_path_buf();
  let state = tokio::task::spawn_blocking(move || inspect_repository(&dir))
    .await
    .map_err(|e| RepositoryError::Io {
      path: dest.to_path_buf(),
      source: io::Error::other(e),
    })??;

  match state {
    RepositoryState::Missing | RepositoryState::Empty => {
      reporter.info(format!("cloning {url}"));
      let parent = dest.parent().unwrap_or(dest);
      tokio::fs::create_dir_all(parent).await.map_err(|source| RepositoryError::Io {
        path: parent.to_path_buf(),
        source,
      })?;
      let cmd = StepCommand::new(git_program)
        .args(["clone", "--depth", "1", url])
        .arg(dest.to_string_lossy())
        .current_dir(parent);
      run_checked(runner, &cmd, reporter, cancel).await?;
    }
    RepositoryState::Checkout { origin } => {
      let actual = origin.unwrap_or_else(|| "no origin".to_string());
      if !same_remote(&actual, url) {
        return Err(RepositoryError::OriginMismatch {
          path: dest.to_path_buf(),
          expected: url.to_string(),
          actual,
        });
      }
      reporter.info(format!("updating existing checkout in {}", dest.display()));
      let cmd = StepCommand::new(git_program).args(["pull", "--ff-only"]).current_dir(dest);
      run_checked(runner, &cmd, reporter, cancel).await?;
    }
    RepositoryState::NotARepository => {
      return Err(RepositoryError::NotARepository {
        path: dest.to_path_buf(),
      });
    }
  }
  Ok(())
}

fn same_remote(a: &str, b: &str) -> bool {
  fn normalize(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url).to_ascii_lowercase()
  }
  normalize(a) == normalize(b)
}
