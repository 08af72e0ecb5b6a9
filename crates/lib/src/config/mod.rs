//! Configuration: the library manifest and the application settings.

mod manifest;
mod settings;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use manifest::{ArchiveKind, LibraryManifest, LibrarySpec};
pub use settings::Settings;

/// Errors raised while loading configuration or validating a selection.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("manifest not found: {}", .0.display())]
  NotFound(PathBuf),

  #[error("failed to read {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {}: {source}", path.display())]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("library entry {entry} is missing required field `{field}`")]
  MissingField { entry: String, field: &'static str },

  #[error("invalid library name {0:?}: only letters, digits, '.', '_' and '-' are allowed")]
  InvalidName(String),

  #[error("library {0} is declared more than once")]
  DuplicateName(String),

  #[error("libraries {first} and {second} would both be downloaded to {file}")]
  DuplicateArchive { first: String, second: String, file: String },

  #[error("library {name} has an unsupported url {url:?}: expected http or https")]
  InvalidUrl { name: String, url: String },

  #[error("library {name} has an unknown archive kind {kind:?}: expected \"tar\" or \"zip\"")]
  InvalidArchiveKind { name: String, kind: String },

  #[error("invalid PHP version {0:?}: expected MAJOR.MINOR or MAJOR.MINOR.PATCH")]
  InvalidPhpVersion(String),

  #[error("invalid extension name {0:?}")]
  InvalidExtension(String),

  #[error("invalid value {value:?} for {var}: expected a positive integer")]
  InvalidEnv { var: &'static str, value: String },
}
