//! Archive Extractor.
//!
//! Unpacks tar (plain, gzip or xz) and zip archives without external tools.
//! Every entry is checked before anything is written: absolute paths, `..`
//! components, links pointing outside the destination and device or fifo
//! entries fail the whole archive. A single top-level directory shared by
//! all entries is stripped, so `php-8.3.14/configure` lands at
//! `<dest>/configure`.
//!
//! Extraction overwrites what is already there, which makes re-running after
//! an interrupted extraction safe.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tar::EntryType;
use thiserror::Error;
use tracing::debug;
use xz2::read::XzDecoder;

use crate::config::ArchiveKind;

#[derive(Debug, Error)]
pub enum ExtractError {
  #[error("failed to open {}: {source}", path.display())]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("{} is not a readable archive: {source}", path.display())]
  Corrupt {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("{} is not a readable zip archive: {source}", path.display())]
  Zip {
    path: PathBuf,
    #[source]
    source: zip::result::ZipError,
  },

  #[error("{} uses an unsupported compression format", path.display())]
  UnsupportedCompression { path: PathBuf },

  #[error("archive entry {entry:?} would be written outside the destination")]
  UnsafePath { entry: String },

  #[error("archive entry {entry:?} links to {target:?}, outside the destination")]
  EscapingLink { entry: String, target: String },

  #[error("archive entry {entry:?} has unsupported type {kind}")]
  UnsupportedEntry { entry: String, kind: String },

  #[error("failed to write {}: {source}", path.display())]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// What an extraction produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
  pub files: usize,
  pub dirs: usize,
  pub links: usize,
  /// Top-level directory that was stripped, if any.
  pub stripped_root: Option<String>,
}

/// Extract `archive` into `dest`, creating `dest` if needed.
pub fn extract(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<ExtractSummary, ExtractError> {
  fs::create_dir_all(dest).map_err(write_err(dest))?;
  let root = dunce::canonicalize(dest).map_err(write_err(dest))?;

  let summary = match kind {
    ArchiveKind::Tar => extract_tar(archive, &root)?,
    ArchiveKind::Zip => extract_zip(archive, &root)?,
  };
  debug!(
    archive = %archive.display(),
    files = summary.files,
    dirs = summary.dirs,
    links = summary.links,
    "extracted"
  );
  Ok(summary)
}

fn write_err(path: &Path) -> impl FnOnce(io::Error) -> ExtractError + '_ {
  move |source| ExtractError::Write {
    path: path.to_path_buf(),
    source,
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
  File,
  Dir,
  Symlink,
  HardLink,
}

/// An entry as seen in the validation pass.
#[derive(Debug)]
struct Planned {
  rel: PathBuf,
  kind: Kind,
  link: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Compression {
  None,
  Gzip,
  Xz,
  Unsupported,
}

fn sniff(magic: &[u8]) -> Compression {
  if magic.starts_with(&[0x1f, 0x8b]) {
    Compression::Gzip
  } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
    Compression::Xz
  } else if magic.starts_with(b"BZh") || magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
    Compression::Unsupported
  } else {
    Compression::None
  }
}

fn open_tar(path: &Path) -> Result<tar::Archive<Box<dyn Read>>, ExtractError> {
  let open_err = |source| ExtractError::Open {
    path: path.to_path_buf(),
    source,
  };

  let mut magic = Vec::with_capacity(6);
  File::open(path)
    .and_then(|f| f.take(6).read_to_end(&mut magic))
    .map_err(open_err)?;

  let reader = BufReader::new(File::open(path).map_err(open_err)?);
  let reader: Box<dyn Read> = match sniff(&magic) {
    Compression::None => Box::new(reader),
    Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
    Compression::Xz => Box::new(XzDecoder::new_multi_decoder(reader)),
    Compression::Unsupported => {
      return Err(ExtractError::UnsupportedCompression {
        path: path.to_path_buf(),
      });
    }
  };
  Ok(tar::Archive::new(reader))
}

fn tar_kind(kind: EntryType, name: &Path) -> Result<Option<Kind>, ExtractError> {
  match kind {
    EntryType::Regular | EntryType::Continuous => Ok(Some(Kind::File)),
    EntryType::Directory => Ok(Some(Kind::Dir)),
    EntryType::Symlink => Ok(Some(Kind::Symlink)),
    EntryType::Link => Ok(Some(Kind::HardLink)),
    EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName | EntryType::GNULongLink => Ok(None),
    other => Err(ExtractError::UnsupportedEntry {
      entry: name.display().to_string(),
      kind: format!("{other:?}"),
    }),
  }
}

fn extract_tar(path: &Path, root: &Path) -> Result<ExtractSummary, ExtractError> {
  let corrupt = |source| ExtractError::Corrupt {
    path: path.to_path_buf(),
    source,
  };

  let mut plan = Vec::new();
  let mut archive = open_tar(path)?;
  for entry in archive.entries().map_err(corrupt)? {
    let entry = entry.map_err(corrupt)?;
    let raw = entry.path().map_err(corrupt)?.into_owned();
    let Some(kind) = tar_kind(entry.header().entry_type(), &raw)? else {
      continue;
    };
    let link = match kind {
      Kind::Symlink | Kind::HardLink => entry.link_name().map_err(corrupt)?.map(|l| l.into_owned()),
      _ => None,
    };
    plan.push(Planned {
      rel: sanitize(&raw)?,
      kind,
      link,
    });
  }
  let strip = validate_plan(&plan)?;

  let mut writer = TreeWriter::new(root, strip);
  let mut archive = open_tar(path)?;
  for entry in archive.entries().map_err(corrupt)? {
    let mut entry = entry.map_err(corrupt)?;
    let raw = entry.path().map_err(corrupt)?.into_owned();
    let Some(kind) = tar_kind(entry.header().entry_type(), &raw)? else {
      continue;
    };
    let Some(rel) = writer.strip(&sanitize(&raw)?) else {
      continue;
    };
    let mode = entry.header().mode().ok();

    match kind {
      Kind::File => writer.write_file(&rel, &mut entry, mode)?,
      Kind::Dir => writer.make_dir(&rel, mode)?,
      Kind::Symlink | Kind::HardLink => {
        let target = entry
          .link_name()
          .map_err(corrupt)?
          .map(|l| l.into_owned())
          .unwrap_or_default();
        if kind == Kind::Symlink {
          writer.make_symlink(&rel, &target)?;
        } else {
          writer.make_hardlink(&rel, &target)?;
        }
      }
    }
  }
  Ok(writer.finish())
}

fn extract_zip(path: &Path, root: &Path) -> Result<ExtractSummary, ExtractError> {
  let file = File::open(path).map_err(|source| ExtractError::Open {
    path: path.to_path_buf(),
    source,
  })?;
  let zip_err = |source| ExtractError::Zip {
    path: path.to_path_buf(),
    source,
  };
  let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(zip_err)?;

  let mut plan = Vec::with_capacity(archive.len());
  for i in 0..archive.len() {
    let mut file = archive.by_index(i).map_err(zip_err)?;
    let enclosed = file.enclosed_name().ok_or_else(|| ExtractError::UnsafePath {
      entry: file.name().to_string(),
    })?;
    let rel = sanitize(&enclosed)?;
    let (kind, link) = if file.is_dir() {
      (Kind::Dir, None)
    } else if file.is_symlink() {
      let mut target = String::new();
      file.read_to_string(&mut target).map_err(|source| ExtractError::Corrupt {
        path: path.to_path_buf(),
        source,
      })?;
      (Kind::Symlink, Some(PathBuf::from(target)))
    } else {
      (Kind::File, None)
    };
    plan.push(Planned { rel, kind, link });
  }
  let strip = validate_plan(&plan)?;

  let mut writer = TreeWriter::new(root, strip);
  for (i, planned) in plan.iter().enumerate() {
    let Some(rel) = writer.strip(&planned.rel) else {
      continue;
    };
    match planned.kind {
      Kind::Dir => {
        let mode = archive.by_index(i).map_err(zip_err)?.unix_mode();
        writer.make_dir(&rel, mode)?;
      }
      Kind::Symlink => writer.make_symlink(&rel, planned.link.as_deref().unwrap_or(Path::new("")))?,
      Kind::File | Kind::HardLink => {
        let mut file = archive.by_index(i).map_err(zip_err)?;
        let mode = file.unix_mode();
        writer.write_file(&rel, &mut file, mode)?;
      }
    }
  }
  Ok(writer.finish())
}

/// Normalize an entry path, rejecting anything that is not plainly relative.
fn sanitize(raw: &Path) -> Result<PathBuf, ExtractError> {
  let mut out = PathBuf::new();
  for component in raw.components() {
    match component {
      Component::Normal(part) => out.push(part),
      Component::CurDir => {}
      Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
        return Err(ExtractError::UnsafePath {
          entry: raw.display().to_string(),
        });
      }
    }
  }
  Ok(out)
}

/// Check every planned entry and pick the directory to strip.
fn validate_plan(plan: &[Planned]) -> Result<Option<OsString>, ExtractError> {
  let strip = common_root(plan);

  for entry in plan {
    let Some(rel) = strip_prefix(&entry.rel, strip.as_deref()) else {
      continue;
    };
    match (entry.kind, &entry.link) {
      (Kind::Symlink, Some(target)) => {
        if escapes(rel.parent().unwrap_or(Path::new("")), target) {
          return Err(ExtractError::EscapingLink {
            entry: entry.rel.display().to_string(),
            target: target.display().to_string(),
          });
        }
      }
      (Kind::HardLink, Some(target)) => {
        let target_rel = sanitize(target).map_err(|_| ExtractError::EscapingLink {
          entry: entry.rel.display().to_string(),
          target: target.display().to_string(),
        })?;
        if strip_prefix(&target_rel, strip.as_deref()).is_none() {
          return Err(ExtractError::EscapingLink {
            entry: entry.rel.display().to_string(),
            target: target.display().to_string(),
          });
        }
      }
      (Kind::Symlink | Kind::HardLink, None) => {
        return Err(ExtractError::UnsupportedEntry {
          entry: entry.rel.display().to_string(),
          kind: "link without target".to_string(),
        });
      }
      _ => {}
    }
  }
  Ok(strip)
}

/// The single top-level directory every entry lives under, if there is one.
fn common_root(plan: &[Planned]) -> Option<OsString> {
  let mut root: Option<&std::ffi::OsStr> = None;
  let mut nested = false;

  for entry in plan {
    let mut components = entry.rel.components();
    let Some(first) = components.next() else {
      continue;
    };
    let has_more = components.next().is_some();
    if !has_more && entry.kind != Kind::Dir {
      return None;
    }
    match root {
      None => root = Some(first.as_os_str()),
      Some(r) if r != first.as_os_str() => return None,
      Some(_) => {}
    }
    nested |= has_more;
  }

  if nested { root.map(|r| r.to_os_string()) } else { None }
}

fn strip_prefix(rel: &Path, strip: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
  let stripped = match strip {
    Some(prefix) => rel.strip_prefix(prefix).ok()?.to_path_buf(),
    None => rel.to_path_buf(),
  };
  if stripped.as_os_str().is_empty() { None } else { Some(stripped) }
}

/// Whether a link in `base` (relative to the root) pointing at `target`
/// resolves outside the root.
fn escapes(base: &Path, target: &Path) -> bool {
  let mut depth: Vec<&std::ffi::OsStr> = Vec::new();
  for component in base.components() {
    if let Component::Normal(part) = component {
      depth.push(part);
    }
  }
  for component in target.components() {
    match component {
      Component::Normal(part) => depth.push(part),
      Component::CurDir => {}
      Component::ParentDir => {
        if depth.pop().is_none() {
          return true;
        }
      }
      Component::RootDir | Component::Prefix(_) => return true,
    }
  }
  false
}

const MAX_LINK_DEPTH: usize = 40;

/// Resolve `target` from the directory `base` the way the filesystem would,
/// following links already on disk. `None` if any step leaves `root`.
///
/// `base` must be canonical and inside `root`.
fn resolve_inside(root: &Path, base: PathBuf, target: &Path, depth: usize) -> Option<PathBuf> {
  let mut current = base;
  for component in target.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        if current == root {
          return None;
        }
        current.pop();
      }
      Component::RootDir | Component::Prefix(_) => return None,
      Component::Normal(part) => {
        current.push(part);
        let is_link = fs::symlink_metadata(&current)
          .map(|meta| meta.file_type().is_symlink())
          .unwrap_or(false);
        if is_link {
          let link = fs::read_link(&current).ok()?;
          current.pop();
          current = resolve_inside(root, current, &link, depth.checked_sub(1)?)?;
        }
      }
    }
  }
  Some(current)
}

/// Materializes entries below a canonical root directory.
struct TreeWriter<'a> {
  root: &'a Path,
  strip: Option<OsString>,
  dir_modes: Vec<(PathBuf, u32)>,
  summary: ExtractSummary,
}

impl<'a> TreeWriter<'a> {
  fn new(root: &'a Path, strip: Option<OsString>) -> Self {
    let summary = ExtractSummary {
      stripped_root: strip.as_ref().map(|s| s.to_string_lossy().into_owned()),
      ..ExtractSummary::default()
    };
    Self {
      root,
      strip,
      dir_modes: Vec::new(),
      summary,
    }
  }

  fn strip(&self, rel: &Path) -> Option<PathBuf> {
    strip_prefix(rel, self.strip.as_deref())
  }

  /// Create the parent directories of `rel`, refusing to follow links that
  /// leave the root.
  fn prepare_parent(&self, rel: &Path) -> Result<PathBuf, ExtractError> {
    let mut current = self.root.to_path_buf();
    if let Some(parent) = rel.parent() {
      for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
          Ok(meta) if meta.file_type().is_symlink() => {
            let resolved = dunce::canonicalize(&current).unwrap_or_default();
            if !resolved.starts_with(self.root) || !resolved.is_dir() {
              return Err(ExtractError::EscapingLink {
                entry: rel.display().to_string(),
                target: resolved.display().to_string(),
              });
            }
          }
          Ok(meta) if meta.is_dir() => {}
          Ok(_) => {
            fs::remove_file(&current).map_err(write_err(&current))?;
            fs::create_dir(&current).map_err(write_err(&current))?;
          }
          Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir(&current).map_err(write_err(&current))?;
          }
          Err(e) => return Err(write_err(&current)(e)),
        }
      }
    }
    Ok(self.root.join(rel))
  }

  /// Remove whatever is at `out` so it can be replaced.
  fn clear(out: &Path) -> Result<(), ExtractError> {
    match fs::symlink_metadata(out) {
      Ok(meta) if meta.is_dir() => fs::remove_dir_all(out).map_err(write_err(out)),
      Ok(_) => fs::remove_file(out).map_err(write_err(out)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(write_err(out)(e)),
    }
  }

  fn write_file(&mut self, rel: &Path, reader: &mut dyn Read, mode: Option<u32>) -> Result<(), ExtractError> {
    let out = self.prepare_parent(rel)?;
    Self::clear(&out)?;
    let mut file = File::create(&out).map_err(write_err(&out))?;
    io::copy(reader, &mut file).map_err(write_err(&out))?;
    drop(file);
    if let Some(mode) = mode {
      set_mode(&out, mode)?;
    }
    self.summary.files += 1;
    Ok(())
  }

  fn make_dir(&mut self, rel: &Path, mode: Option<u32>) -> Result<(), ExtractError> {
    let out = self.prepare_parent(rel)?;
    match fs::symlink_metadata(&out) {
      Ok(meta) if meta.is_dir() => {}
      Ok(_) => {
        Self::clear(&out)?;
        fs::create_dir(&out).map_err(write_err(&out))?;
      }
      Err(_) => fs::create_dir(&out).map_err(write_err(&out))?,
    }
    if let Some(mode) = mode {
      self.dir_modes.push((out, mode));
    }
    self.summary.dirs += 1;
    Ok(())
  }

  fn make_symlink(&mut self, rel: &Path, target: &Path) -> Result<(), ExtractError> {
    let out = self.prepare_parent(rel)?;
    let escaping = || ExtractError::EscapingLink {
      entry: rel.display().to_string(),
      target: target.display().to_string(),
    };
    // The parent may itself be a link written earlier, so check the target
    // from where the link really lands.
    let parent = out.parent().unwrap_or(self.root);
    let base = dunce::canonicalize(parent).map_err(write_err(parent))?;
    if !base.starts_with(self.root) || resolve_inside(self.root, base, target, MAX_LINK_DEPTH).is_none() {
      return Err(escaping());
    }
    Self::clear(&out)?;
    symlink(target, &out).map_err(write_err(&out))?;
    self.summary.links += 1;
    Ok(())
  }

  fn make_hardlink(&mut self, rel: &Path, target: &Path) -> Result<(), ExtractError> {
    let target_rel = sanitize(target)?;
    let Some(target_rel) = self.strip(&target_rel) else {
      return Err(ExtractError::EscapingLink {
        entry: rel.display().to_string(),
        target: target.display().to_string(),
      });
    };
    let source = resolve_inside(self.root, self.root.to_path_buf(), &target_rel, MAX_LINK_DEPTH).ok_or_else(|| {
      ExtractError::EscapingLink {
        entry: rel.display().to_string(),
        target: target.display().to_string(),
      }
    })?;
    let out = self.prepare_parent(rel)?;
    Self::clear(&out)?;
    fs::hard_link(&source, &out).map_err(write_err(&out))?;
    self.summary.links += 1;
    Ok(())
  }

  /// Apply directory modes deepest first, after their contents exist.
  fn finish(mut self) -> ExtractSummary {
    self.dir_modes.sort_by(|a, b| b.0.cmp(&a.0));
    for (dir, mode) in &self.dir_modes {
      if let Err(e) = set_mode(dir, *mode) {
        debug!(error = %e, "failed to set directory mode");
      }
    }
    self.summary
  }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ExtractError> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777)).map_err(write_err(path))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ExtractError> {
  Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::windows::fs::symlink_file(target, link)
}
