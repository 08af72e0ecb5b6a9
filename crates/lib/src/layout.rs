//! On-disk layout of a clone directory.
//!
//! ```text
//! <clone dir>/
//!   .phpstatic.lock
//!   static-php-cli/          build tool checkout
//!     downloads/             fetched archives
//!     source/<lib>/          extracted source trees
//!     buildroot/bin/php      the artifact (php.exe on Windows)
//! ```

use std::path::{Path, PathBuf};

use crate::config::LibrarySpec;
use crate::platform::os::Os;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
  clone_dir: PathBuf,
  tool_dir: PathBuf,
}

impl BuildLayout {
  pub fn new(clone_dir: impl Into<PathBuf>, tool_dir_name: &str) -> Self {
    let clone_dir = clone_dir.into();
    let tool_dir = clone_dir.join(tool_dir_name);
    Self { clone_dir, tool_dir }
  }

  pub fn clone_dir(&self) -> &Path {
    &self.clone_dir
  }

  /// Checkout of the build tool.
  pub fn tool_dir(&self) -> &Path {
    &self.tool_dir
  }

  pub fn downloads_dir(&self) -> PathBuf {
    self.tool_dir.join("downloads")
  }

  pub fn source_dir(&self) -> PathBuf {
    self.tool_dir.join("source")
  }

  pub fn library_source_dir(&self, spec: &LibrarySpec) -> PathBuf {
    self.source_dir().join(spec.source_dir_name())
  }

  pub fn composer_lock(&self) -> PathBuf {
    self.tool_dir.join("composer.lock")
  }

  /// Relative path of the build tool entry point, as passed to `php`.
  pub fn spc_entry(&self) -> PathBuf {
    Path::new("bin").join("spc")
  }

  pub fn artifact_path(&self, os: Os) -> PathBuf {
    self.tool_dir.join("buildroot").join("bin").join(os.php_binary_name())
  }
}
