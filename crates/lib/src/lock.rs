//! Exclusive lock on a clone directory.
//!
//! Two builds writing into one clone directory would corrupt each other's
//! downloads and source trees. The first build to start takes an exclusive
//! `flock`/`LockFileEx` lock on `<clone dir>/.phpstatic.lock`; a second build
//! fails fast with [`CloneLockError::Busy`]. The lock is released when the
//! [`CloneDirLock`] is dropped, including when the process dies.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::LOCK_FILENAME;

/// Written into the lock file by the holder, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMetadata {
  pub pid: u32,
  pub started_at: DateTime<Utc>,
  pub php_version: String,
}

#[derive(Debug, Error)]
pub enum CloneLockError {
  #[error(
    "{} is in use by another build (PHP {}, PID {}, started {})\n\
     If no phpstatic build is running, remove the lock file:\n  {}",
    dir.display(),
    holder.php_version,
    holder.pid,
    holder.started_at.to_rfc3339(),
    lock_path.display()
  )]
  Busy {
    dir: PathBuf,
    holder: LockMetadata,
    lock_path: PathBuf,
  },

  #[error(
    "{} is in use by another build\n\
     If no phpstatic build is running, remove the lock file:\n  {}",
    dir.display(),
    lock_path.display()
  )]
  BusyUnknown { dir: PathBuf, lock_path: PathBuf },

  #[error("failed to create {}: {source}", path.display())]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open lock file {}: {source}", path.display())]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// Held for the lifetime of one build.
#[derive(Debug)]
pub struct CloneDirLock {
  file: File,
  lock_path: PathBuf,
}

impl CloneDirLock {
  /// Take the lock on `dir`, creating the directory if needed.
  pub fn acquire(dir: &Path, php_version: &str) -> Result<Self, CloneLockError> {
    std::fs::create_dir_all(dir).map_err(|source| CloneLockError::CreateDir {
      path: dir.to_path_buf(),
      source,
    })?;

    let lock_path = dir.join(LOCK_FILENAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|source| CloneLockError::Open {
        path: lock_path.clone(),
        source,
      })?;

    if let Err(err) = try_lock_exclusive(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(contention_error(dir, &lock_path));
      }
      return Err(CloneLockError::LockFailed(err));
    }

    let metadata = LockMetadata {
      pid: std::process::id(),
      started_at: Utc::now(),
      php_version: php_version.to_string(),
    };
    write_metadata(&file, &metadata)?;
    debug!(path = ?lock_path, "clone directory locked");

    Ok(Self { file, lock_path })
  }

  /// Reads the metadata through the held handle. Opening a second handle
  /// fails on Windows while the lock is held.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn write_metadata(file: &File, metadata: &LockMetadata) -> Result<(), CloneLockError> {
  file.set_len(0).map_err(CloneLockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  writer.seek(SeekFrom::Start(0)).map_err(CloneLockError::WriteMetadata)?;
  serde_json::to_writer_pretty(&mut writer, metadata).map_err(|e| CloneLockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(CloneLockError::WriteMetadata)?;
  Ok(())
}

fn contention_error(dir: &Path, lock_path: &Path) -> CloneLockError {
  if let Ok(contents) = std::fs::read_to_string(lock_path)
    && let Ok(holder) = serde_json::from_str::<LockMetadata>(&contents)
  {
    return CloneLockError::Busy {
      dir: dir.to_path_buf(),
      holder,
      lock_path: lock_path.to_path_buf(),
    };
  }

  CloneLockError::BusyUnknown {
    dir: dir.to_path_buf(),
    lock_path: lock_path.to_path_buf(),
  }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(
      handle,
      LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
      0,
      1,
      0,
      &mut overlapped,
    )
  };

  if result == 0 {
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
      return Err(io::Error::new(io::ErrorKind::WouldBlock, err));
    }
    Err(err)
  } else {
    Ok(())
  }
}
