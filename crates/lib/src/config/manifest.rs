//! The library manifest (`config/lib.json`).
//!
//! # Format
//!
//! Either a bare array of library entries or an object:
//!
//! ```json
//! {
//!   "baseExtensions": ["ctype", "mbstring"],
//!   "extensionSets": { "mysql": ["pdo_mysql", "mysqli", "mysqlnd"] },
//!   "libraries": [
//!     {
//!       "name": "php-8.3",
//!       "version": "8.3.14",
//!       "url": "https://www.php.net/distributions/php-8.3.14.tar.xz",
//!       "archiveKind": "tar",
//!       "sourceDir": "php-src"
//!     }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::consts::{DEFAULT_BASE_EXTENSIONS, DEFAULT_EXTENSION_SETS};

/// Container format of a library archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
  Tar,
  Zip,
}

impl ArchiveKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ArchiveKind::Tar => "tar",
      ArchiveKind::Zip => "zip",
    }
  }
}

/// One downloadable source library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibrarySpec {
  pub name: String,
  pub version: String,
  pub url: String,
  pub archive_kind: ArchiveKind,
  /// Expected SHA-256 of the archive, lowercase hex.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sha256: Option<String>,
  /// Expected archive size in bytes.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub size: Option<u64>,
  /// Directory name under `source/`; defaults to `name`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_dir: Option<String>,
  /// PHP extensions that need this library.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub extensions: Vec<String>,
  /// Other libraries this one needs.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub depends: Vec<String>,
  /// Always part of a build.
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub base: bool,
}

impl LibrarySpec {
  pub fn source_dir_name(&self) -> &str {
    self.source_dir.as_deref().unwrap_or(&self.name)
  }

  /// File name the archive is stored under in the downloads directory.
  ///
  /// Taken from the last URL path segment, sanitized, and prefixed with the
  /// library name unless it already starts with it (`v1.0.tar.gz` becomes
  /// `libfoo-v1.0.tar.gz`). Falls back to `<name>-<version>.<ext>` when the
  /// URL has no usable file name.
  pub fn archive_file_name(&self) -> String {
    let base = self.url_file_name();
    let lower = base.to_ascii_lowercase();
    let name = self.name.to_ascii_lowercase();
    let named = lower
      .strip_prefix(&name)
      .is_some_and(|rest| rest.is_empty() || rest.starts_with(['-', '_', '.']));
    if named { base } else { format!("{}-{}", self.name, base) }
  }

  fn url_file_name(&self) -> String {
    let last = self
      .url
      .split(['?', '#'])
      .next()
      .unwrap_or(&self.url)
      .rsplit('/')
      .next()
      .unwrap_or_default();

    let sanitized: String = last
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized.chars().any(|c| c != '.') {
      return sanitized;
    }

    let ext = match self.archive_kind {
      ArchiveKind::Tar => "tar.gz",
      ArchiveKind::Zip => "zip",
    };
    format!("{}-{}.{}", self.name, self.version, ext)
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLibrary {
  name: Option<String>,
  version: Option<String>,
  url: Option<String>,
  archive_kind: Option<String>,
  sha256: Option<String>,
  size: Option<u64>,
  source_dir: Option<String>,
  #[serde(default)]
  extensions: Vec<String>,
  #[serde(default)]
  depends: Vec<String>,
  #[serde(default)]
  base: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifestObject {
  libraries: Vec<RawLibrary>,
  base_extensions: Option<Vec<String>>,
  extension_sets: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawManifest {
  List(Vec<RawLibrary>),
  Object(RawManifestObject),
}

/// Loaded manifest: libraries keyed by name, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryManifest {
  libraries: Vec<LibrarySpec>,
  index: HashMap<String, usize>,
  base_extensions: Vec<String>,
  extension_sets: BTreeMap<String, Vec<String>>,
}

impl LibraryManifest {
  /// Load and validate a manifest file. Has no side effects.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ConfigError::NotFound(path.to_path_buf())),
      Err(source) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    Self::parse(&content).map_err(|e| match e {
      ParseFailure::Json(source) => ConfigError::Parse {
        path: path.to_path_buf(),
        source,
      },
      ParseFailure::Invalid(e) => e,
    })
  }

  /// Parse manifest JSON held in memory.
  pub fn from_json(content: &str) -> Result<Self, ConfigError> {
    Self::parse(content).map_err(|e| match e {
      ParseFailure::Json(source) => ConfigError::Parse {
        path: "<memory>".into(),
        source,
      },
      ParseFailure::Invalid(e) => e,
    })
  }

  fn parse(content: &str) -> Result<Self, ParseFailure> {
    let raw: RawManifest = serde_json::from_str(content).map_err(ParseFailure::Json)?;
    let (raw_libraries, base_extensions, extension_sets) = match raw {
      RawManifest::List(libraries) => (libraries, None, None),
      RawManifest::Object(obj) => (obj.libraries, obj.base_extensions, obj.extension_sets),
    };

    let libraries = raw_libraries
      .into_iter()
      .enumerate()
      .map(|(i, raw)| validate_entry(i, raw))
      .collect::<Result<Vec<_>, _>>()
      .map_err(ParseFailure::Invalid)?;

    let mut index = HashMap::with_capacity(libraries.len());
    let mut files: HashMap<String, &str> = HashMap::with_capacity(libraries.len());
    for (i, lib) in libraries.iter().enumerate() {
      if index.insert(lib.name.clone(), i).is_some() {
        return Err(ParseFailure::Invalid(ConfigError::DuplicateName(lib.name.clone())));
      }
      let file = lib.archive_file_name();
      if let Some(first) = files.get(&file.to_ascii_lowercase()) {
        return Err(ParseFailure::Invalid(ConfigError::DuplicateArchive {
          first: first.to_string(),
          second: lib.name.clone(),
          file,
        }));
      }
      files.insert(file.to_ascii_lowercase(), &lib.name);
    }

    let base_extensions =
      base_extensions.unwrap_or_else(|| DEFAULT_BASE_EXTENSIONS.iter().map(|s| s.to_string()).collect());
    let extension_sets = extension_sets.unwrap_or_else(|| {
      DEFAULT_EXTENSION_SETS
        .iter()
        .map(|(name, exts)| (name.to_string(), exts.iter().map(|s| s.to_string()).collect()))
        .collect()
    });

    Ok(Self {
      libraries,
      index,
      base_extensions,
      extension_sets,
    })
  }

  pub fn get(&self, name: &str) -> Option<&LibrarySpec> {
    self.index.get(name).map(|&i| &self.libraries[i])
  }

  /// Position of `name` in declaration order.
  pub fn position(&self, name: &str) -> Option<usize> {
    self.index.get(name).copied()
  }

  pub fn libraries(&self) -> &[LibrarySpec] {
    &self.libraries
  }

  pub fn len(&self) -> usize {
    self.libraries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.libraries.is_empty()
  }

  pub fn base_extensions(&self) -> &[String] {
    &self.base_extensions
  }

  /// PHP extensions enabled by a selectable set, if `name` is one.
  pub fn extension_set(&self, name: &str) -> Option<&[String]> {
    self.extension_sets.get(name).map(Vec::as_slice)
  }

  pub fn extension_sets(&self) -> &BTreeMap<String, Vec<String>> {
    &self.extension_sets
  }
}

enum ParseFailure {
  Json(serde_json::Error),
  Invalid(ConfigError),
}

fn is_valid_name(name: &str) -> bool {
  !name.is_empty()
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

fn validate_entry(index: usize, raw: RawLibrary) -> Result<LibrarySpec, ConfigError> {
  let name = raw.name.ok_or_else(|| ConfigError::MissingField {
    entry: format!("#{index}"),
    field: "name",
  })?;
  if !is_valid_name(&name) {
    return Err(ConfigError::InvalidName(name));
  }

  let missing = |field: &'static str| ConfigError::MissingField {
    entry: name.clone(),
    field,
  };
  let version = raw.version.ok_or_else(|| missing("version"))?;
  let url = raw.url.ok_or_else(|| missing("url"))?;
  let kind = raw.archive_kind.ok_or_else(|| missing("archiveKind"))?;

  let parsed = Url::parse(&url).ok();
  let url_ok = parsed
    .as_ref()
    .is_some_and(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty()));
  if !url_ok {
    return Err(ConfigError::InvalidUrl { name, url });
  }

  let archive_kind = match kind.to_ascii_lowercase().as_str() {
    "tar" => ArchiveKind::Tar,
    "zip" => ArchiveKind::Zip,
    _ => return Err(ConfigError::InvalidArchiveKind { name, kind }),
  };

  if let Some(dir) = &raw.source_dir
    && (!is_valid_name(dir) || dir == "." || dir == "..")
  {
    return Err(ConfigError::InvalidName(dir.clone()));
  }

  Ok(LibrarySpec {
    name,
    version,
    url,
    archive_kind,
    sha256: raw.sha256.map(|s| s.trim().to_ascii_lowercase()),
    size: raw.size,
    source_dir: raw.source_dir,
    extensions: raw.extensions.into_iter().map(|e| e.to_ascii_lowercase()).collect(),
    depends: raw.depends,
    base: raw.base,
  })
}
