//! Dependency resolution.
//!
//! Turns a [`BuildSelection`] into the ordered list of libraries to fetch.
//! The result only depends on its inputs: the same manifest and selection
//! always resolve to the same libraries in manifest declaration order.

use std::collections::{BTreeSet, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::config::{LibraryManifest, LibrarySpec};
use crate::job::BuildSelection;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
  #[error("no PHP source for version {version}: the manifest has none of {}", tried.join(", "))]
  UnknownPhpVersion { version: String, tried: Vec<String> },

  #[error("unknown extension {0:?}: no library or extension set in the manifest provides it")]
  UnknownExtension(String),

  #[error("library {required_by} depends on {name}, which is not in the manifest")]
  UnknownLibrary { name: String, required_by: String },
}

/// Libraries a build needs, without duplicates, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependencySet {
  libraries: Vec<LibrarySpec>,
  php_source: String,
}

impl ResolvedDependencySet {
  pub fn libraries(&self) -> &[LibrarySpec] {
    &self.libraries
  }

  pub fn iter(&self) -> impl Iterator<Item = &LibrarySpec> {
    self.libraries.iter()
  }

  pub fn names(&self) -> Vec<&str> {
    self.libraries.iter().map(|l| l.name.as_str()).collect()
  }

  /// The PHP source entry.
  pub fn php_source(&self) -> Option<&LibrarySpec> {
    self.libraries.iter().find(|l| l.name == self.php_source)
  }

  pub fn len(&self) -> usize {
    self.libraries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.libraries.is_empty()
  }
}

impl<'a> IntoIterator for &'a ResolvedDependencySet {
  type Item = &'a LibrarySpec;
  type IntoIter = std::slice::Iter<'a, LibrarySpec>;

  fn into_iter(self) -> Self::IntoIter {
    self.libraries.iter()
  }
}

/// Compute the libraries needed for `selection`.
pub fn resolve(selection: &BuildSelection, manifest: &LibraryManifest) -> Result<ResolvedDependencySet, ResolveError> {
  let php_source = find_php_source(selection, manifest)?;

  let mut wanted = BTreeSet::new();
  let mut queue = VecDeque::new();
  let mut push = |position: usize, queue: &mut VecDeque<usize>| {
    if wanted.insert(position) {
      queue.push_back(position);
    }
  };

  if let Some(pos) = manifest.position(&php_source) {
    push(pos, &mut queue);
  }

  for (pos, lib) in manifest.libraries().iter().enumerate() {
    if lib.base {
      push(pos, &mut queue);
    }
  }

  for ext in &selection.extensions {
    let candidates = extension_candidates(ext, manifest);
    let mut matched = false;
    for (pos, lib) in manifest.libraries().iter().enumerate() {
      if lib.name == *ext || lib.extensions.iter().any(|e| candidates.contains(e.as_str())) {
        push(pos, &mut queue);
        matched = true;
      }
    }
    if !matched && !is_known_extension(ext, manifest) {
      return Err(ResolveError::UnknownExtension(ext.clone()));
    }
  }

  let libraries = manifest.libraries();
  while let Some(pos) = queue.pop_front() {
    let lib = &libraries[pos];
    for dep in &lib.depends {
      let dep_pos = manifest.position(dep).ok_or_else(|| ResolveError::UnknownLibrary {
        name: dep.clone(),
        required_by: lib.name.clone(),
      })?;
      push(dep_pos, &mut queue);
    }
  }

  let libraries: Vec<LibrarySpec> = wanted.into_iter().map(|pos| libraries[pos].clone()).collect();
  debug!(
    libraries = ?libraries.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
    "resolved dependencies"
  );

  Ok(ResolvedDependencySet { libraries, php_source })
}

/// PHP extensions to compile: the manifest's base list plus everything the
/// selection enables, sorted and de-duplicated.
pub fn php_extensions(selection: &BuildSelection, manifest: &LibraryManifest) -> Vec<String> {
  let mut extensions: BTreeSet<String> = manifest.base_extensions().iter().cloned().collect();
  for ext in &selection.extensions {
    match manifest.extension_set(ext) {
      Some(members) => extensions.extend(members.iter().cloned()),
      None => {
        extensions.insert(ext.clone());
      }
    }
  }
  extensions.into_iter().collect()
}

fn find_php_source(selection: &BuildSelection, manifest: &LibraryManifest) -> Result<String, ResolveError> {
  let mut tried = vec![format!("php-{}", selection.php_version)];
  let minor = format!("php-{}", selection.php_minor_version());
  if minor != tried[0] {
    tried.push(minor);
  }

  tried
    .iter()
    .find(|name| manifest.get(name).is_some())
    .cloned()
    .ok_or_else(|| ResolveError::UnknownPhpVersion {
      version: selection.php_version.clone(),
      tried,
    })
}

/// The extension itself plus the members of the set it names.
fn extension_candidates<'a>(ext: &'a str, manifest: &'a LibraryManifest) -> BTreeSet<&'a str> {
  let mut candidates = BTreeSet::from([ext]);
  if let Some(members) = manifest.extension_set(ext) {
    candidates.extend(members.iter().map(String::as_str));
  }
  candidates
}

fn is_known_extension(ext: &str, manifest: &LibraryManifest) -> bool {
  manifest.extension_set(ext).is_some()
    || manifest.base_extensions().iter().any(|e| e == ext)
    || manifest.extension_sets().values().flatten().any(|e| e == ext)
}
