//! Fetcher: library archives over HTTP(S) and the build tool repository.
//!
//! Archives are streamed into `<file>.part` and renamed once complete, so a
//! file without the suffix is always a finished download. An interrupted
//! transfer is resumed with a `Range` request on the next attempt.

mod progress;
mod repo;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::{LibrarySpec, Settings};
use crate::consts::{APP_NAME, PARTIAL_SUFFIX};
use crate::job::{CancelToken, Cancelled};
use crate::log::Reporter;
use crate::util::hash::hash_file_async;

use progress::DownloadProgress;
pub use repo::{RepositoryError, RepositoryState, fetch_repository, inspect_repository};

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("failed to set up the HTTP client: {0}")]
  Client(#[source] reqwest::Error),

  #[error("request to {url} failed: {source}")]
  Http {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("{url} returned HTTP {status}")]
  Status { url: String, status: u16 },

  #[error("download of {url} ended after {received} of {expected} bytes")]
  Incomplete { url: String, received: u64, expected: u64 },

  #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
  ChecksumMismatch {
    name: String,
    expected: String,
    actual: String,
  },

  #[error("{} failed: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("giving up on {url} after {attempts} attempts: {last}")]
  RetriesExhausted {
    url: String,
    attempts: u32,
    #[source]
    last: Box<FetchError>,
  },

  #[error("download cancelled")]
  Cancelled,
}

impl From<Cancelled> for FetchError {
  fn from(_: Cancelled) -> Self {
    FetchError::Cancelled
  }
}

impl FetchError {
  /// Network conditions worth another attempt.
  pub fn is_transient(&self) -> bool {
    match self {
      FetchError::Http { source, .. } => {
        source.is_connect() || source.is_timeout() || source.is_body() || source.is_decode() || source.is_request()
      }
      FetchError::Status { status, .. } => *status == 429 || (500..600).contains(status),
      FetchError::Incomplete { .. } => true,
      _ => false,
    }
  }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> FetchError + '_ {
  move |source| FetchError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Where a library archive came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
  pub path: PathBuf,
  /// An existing file was kept instead of downloading.
  pub cached: bool,
}

/// Downloads library archives.
#[derive(Debug, Clone)]
pub struct Fetcher {
  client: reqwest::Client,
  retries: u32,
  backoff: Duration,
  progress_step: u8,
}

impl Fetcher {
  pub fn new(settings: &Settings) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .user_agent(format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION")))
      .connect_timeout(Duration::from_secs(30))
      .build()
      .map_err(FetchError::Client)?;

    Ok(Self {
      client,
      retries: settings.download_retries,
      backoff: settings.retry_backoff(),
      progress_step: settings.progress_step_percent,
    })
  }

  /// Download `spec` into `dest_dir`, or keep an existing matching file.
  pub async fn fetch(
    &self,
    spec: &LibrarySpec,
    dest_dir: &Path,
    force_refresh: bool,
    reporter: &Reporter,
    cancel: &CancelToken,
  ) -> Result<FetchOutcome, FetchError> {
    cancel.check()?;
    fs::create_dir_all(dest_dir).await.map_err(io_err(dest_dir))?;

    let target = dest_dir.join(spec.archive_file_name());
    let partial = partial_path(&target);

    if force_refresh {
      remove_if_exists(&target).await?;
      remove_if_exists(&partial).await?;
    } else if fs::try_exists(&target).await.map_err(io_err(&target))? {
      if self.is_current(spec, &target, reporter).await? {
        reporter.info(format!("{}: using existing {}", spec.name, target.display()));
        return Ok(FetchOutcome { path: target, cached: true });
      }
      reporter.warn(format!("{}: existing archive does not match, downloading again", spec.name));
      remove_if_exists(&target).await?;
    }

    reporter.info(format!("{}: downloading {}", spec.name, spec.url));
    self.download_with_retry(spec, &partial, reporter, cancel).await?;

    if let Some(expected) = &spec.sha256 {
      let actual = hash_file_async(&partial).await.map_err(io_err(&partial))?;
      if !actual.matches(expected) {
        remove_if_exists(&partial).await?;
        return Err(FetchError::ChecksumMismatch {
          name: spec.name.clone(),
          expected: expected.clone(),
          actual: actual.0,
        });
      }
      debug!(name = %spec.name, "checksum verified");
    }

    fs::rename(&partial, &target).await.map_err(io_err(&target))?;
    info!(name = %spec.name, path = %target.display(), "download complete");
    Ok(FetchOutcome { path: target, cached: false })
  }

  /// Whether an existing archive can be kept: by checksum, then declared
  /// size, then the server's `Content-Length`.
  async fn is_current(&self, spec: &LibrarySpec, target: &Path, reporter: &Reporter) -> Result<bool, FetchError> {
    if let Some(expected) = &spec.sha256 {
      let actual = hash_file_async(target).await.map_err(io_err(target))?;
      return Ok(actual.matches(expected));
    }

    let len = fs::metadata(target).await.map_err(io_err(target))?.len();
    if let Some(size) = spec.size {
      return Ok(len == size);
    }

    match self.remote_length(&spec.url).await {
      Some(remote) => Ok(remote == len),
      None => {
        reporter.info(format!(
          "{}: server did not report a size, keeping the finished download",
          spec.name
        ));
        Ok(true)
      }
    }
  }

  async fn remote_length(&self, url: &str) -> Option<u64> {
    let response = match self.client.head(url).send().await {
      Ok(response) if response.status().is_success() => response,
      Ok(response) => {
        debug!(url, status = %response.status(), "HEAD request rejected");
        return None;
      }
      Err(e) => {
        debug!(url, error = %e, "HEAD request failed");
        return None;
      }
    };
    response
      .headers()
      .get(reqwest::header::CONTENT_LENGTH)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.parse().ok())
  }

  async fn download_with_retry(
    &self,
    spec: &LibrarySpec,
    partial: &Path,
    reporter: &Reporter,
    cancel: &CancelToken,
  ) -> Result<(), FetchError> {
    let mut attempt = 0;
    loop {
      cancel.check()?;
      let err = match self.download_once(spec, partial, reporter, cancel).await {
        Ok(()) => return Ok(()),
        Err(e) if e.is_transient() => e,
        Err(e) => return Err(e),
      };

      if attempt >= self.retries {
        return Err(FetchError::RetriesExhausted {
          url: spec.url.clone(),
          attempts: attempt + 1,
          last: Box::new(err),
        });
      }

      let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt));
      attempt += 1;
      reporter.warn(format!(
        "{}: {err}; retrying in {} ({attempt}/{})",
        spec.name,
        format_delay(delay),
        self.retries
      ));
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
      }
    }
  }

  async fn download_once(
    &self,
    spec: &LibrarySpec,
    partial: &Path,
    reporter: &Reporter,
    cancel: &CancelToken,
  ) -> Result<(), FetchError> {
    let existing = match fs::metadata(partial).await {
      Ok(meta) => meta.len(),
      Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
      Err(e) => return Err(io_err(partial)(e)),
    };

    let mut request = self.client.get(&spec.url);
    if existing > 0 {
      debug!(name = %spec.name, bytes = existing, "resuming partial download");
      request = request.header(RANGE, format!("bytes={existing}-"));
    }

    let http_err = |source| FetchError::Http {
      url: spec.url.clone(),
      source,
    };
    let response = request.send().await.map_err(http_err)?;
    let status = response.status();

    if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
      // The partial file is stale or already complete; start over.
      remove_if_exists(partial).await?;
      return Err(FetchError::Incomplete {
        url: spec.url.clone(),
        received: 0,
        expected: existing,
      });
    }
    if !status.is_success() {
      return Err(FetchError::Status {
        url: spec.url.clone(),
        status: status.as_u16(),
      });
    }

    let resumed = status == StatusCode::PARTIAL_CONTENT && existing > 0;
    let mut file = if resumed {
      reporter.info(format!("{}: resuming at {}", spec.name, progress::format_bytes(existing)));
      fs::OpenOptions::new()
        .append(true)
        .open(partial)
        .await
        .map_err(io_err(partial))?
    } else {
      fs::File::create(partial).await.map_err(io_err(partial))?
    };
    let mut written = if resumed { existing } else { 0 };

    let expected_total = response.content_length().map(|len| len + written);
    let mut progress = DownloadProgress::new(&spec.name, expected_total, self.progress_step, written);

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
      if cancel.is_cancelled() {
        file.flush().await.map_err(io_err(partial))?;
        return Err(FetchError::Cancelled);
      }
      let chunk = chunk.map_err(http_err)?;
      file.write_all(&chunk).await.map_err(io_err(partial))?;
      written += chunk.len() as u64;
      progress.advance(written, reporter);
    }
    file.flush().await.map_err(io_err(partial))?;
    file.sync_all().await.map_err(io_err(partial))?;

    if let Some(expected) = expected_total
      && written < expected
    {
      return Err(FetchError::Incomplete {
        url: spec.url.clone(),
        received: written,
        expected,
      });
    }
    Ok(())
  }
}

fn partial_path(target: &Path) -> PathBuf {
  let mut name = target.file_name().unwrap_or_default().to_os_string();
  name.push(PARTIAL_SUFFIX);
  target.with_file_name(name)
}

async fn remove_if_exists(path: &Path) -> Result<(), FetchError> {
  match fs::remove_file(path).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(io_err(path)(e)),
  }
}

fn format_delay(delay: Duration) -> String {
  if delay.as_millis() < 1000 {
    format!("{} ms", delay.as_millis())
  } else {
    format!("{:.1} s", delay.as_secs_f64())
  }
}
