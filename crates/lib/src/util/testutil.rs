//! Helpers shared by the unit tests: a scripted [`CommandRunner`] and
//! in-memory archive builders.

use std::io::{Cursor, Write};
use std::sync::Mutex;

use async_trait::async_trait;
use tar::{EntryType, Header};

use crate::invoke::{CommandRunner, ProcessError, ProcessOutput, StepCommand};
use crate::job::CancelToken;
use crate::log::Reporter;

type Handler = Box<dyn Fn(&StepCommand) -> Result<ProcessOutput, ProcessError> + Send + Sync>;

/// Answers commands from a closure and records every call.
pub struct ScriptedRunner {
  handler: Handler,
  calls: Mutex<Vec<StepCommand>>,
  missing: Vec<String>,
}

impl ScriptedRunner {
  pub fn new<F>(handler: F) -> Self
  where
    F: Fn(&StepCommand) -> Result<ProcessOutput, ProcessError> + Send + Sync + 'static,
  {
    Self {
      handler: Box::new(handler),
      calls: Mutex::new(Vec::new()),
      missing: Vec::new(),
    }
  }

  /// Report `program` as not installed.
  pub fn without_program(mut self, program: &str) -> Self {
    self.missing.push(program.to_string());
    self
  }

  /// Every command exits 0.
  pub fn succeeding() -> Self {
    Self::new(|_| Ok(ProcessOutput::success()))
  }

  pub fn calls(&self) -> Vec<StepCommand> {
    self.calls.lock().unwrap().clone()
  }

  /// `program first-arg` for every call, for compact assertions.
  pub fn call_summaries(&self) -> Vec<String> {
    self
      .calls()
      .iter()
      .map(|c| match c.args.first() {
        Some(first) => format!("{} {}", c.program, first),
        None => c.program.clone(),
      })
      .collect()
  }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
  async fn run(
    &self,
    command: &StepCommand,
    reporter: &Reporter,
    cancel: &CancelToken,
  ) -> Result<ProcessOutput, ProcessError> {
    if cancel.is_cancelled() {
      return Err(ProcessError::Cancelled {
        program: command.program.clone(),
      });
    }
    self.calls.lock().unwrap().push(command.clone());
    reporter.info(format!("$ {command}"));

    let result = (self.handler)(command);
    if let Ok(output) = &result {
      for line in output.stdout_tail.iter().chain(&output.stderr_tail) {
        reporter.info(line.clone());
      }
    }
    result
  }

  fn is_available(&self, program: &str) -> bool {
    !self.missing.iter().any(|m| m == program)
  }
}

/// Uncompressed tar. Paths ending in `/` become directories.
pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
  let mut builder = tar::Builder::new(Vec::new());
  for (path, data) in entries {
    let mut header = Header::new_gnu();
    if path.ends_with('/') {
      header.set_entry_type(EntryType::Directory);
      header.set_mode(0o755);
      header.set_size(0);
      builder.append_data(&mut header, path, std::io::empty()).unwrap();
    } else {
      header.set_entry_type(EntryType::Regular);
      header.set_mode(0o644);
      header.set_size(data.len() as u64);
      builder.append_data(&mut header, path, *data).unwrap();
    }
  }
  builder.into_inner().unwrap()
}

pub fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
  let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
  encoder.write_all(&tar_bytes(entries)).unwrap();
  encoder.finish().unwrap()
}

pub fn tar_xz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
  let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 1);
  encoder.write_all(&tar_bytes(entries)).unwrap();
  encoder.finish().unwrap()
}

/// A tar holding one regular file whose name is written verbatim, bypassing
/// the path checks of `tar::Builder`.
pub fn tar_with_raw_name(name: &str, data: &[u8]) -> Vec<u8> {
  let mut header = Header::new_gnu();
  {
    let gnu = header.as_gnu_mut().unwrap();
    gnu.name[..name.len()].copy_from_slice(name.as_bytes());
  }
  header.set_entry_type(EntryType::Regular);
  header.set_mode(0o644);
  header.set_size(data.len() as u64);
  header.set_cksum();

  let mut builder = tar::Builder::new(Vec::new());
  builder.append(&header, data).unwrap();
  builder.into_inner().unwrap()
}

/// A tar holding a symlink `name -> target`, followed by `extra` regular files.
pub fn tar_with_symlink(name: &str, target: &str, extra: &[(&str, &[u8])]) -> Vec<u8> {
  let mut builder = tar::Builder::new(Vec::new());

  let mut header = Header::new_gnu();
  header.set_entry_type(EntryType::Symlink);
  header.set_mode(0o777);
  header.set_size(0);
  header.set_path(name).unwrap();
  header.set_link_name(target).unwrap();
  header.set_cksum();
  builder.append(&header, std::io::empty()).unwrap();

  for (path, data) in extra {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, *data).unwrap();
  }
  builder.into_inner().unwrap()
}

/// One entry for [`tar_items`].
pub enum TarItem<'a> {
  File(&'a [u8]),
  Symlink(&'a str),
  HardLink(&'a str),
}

/// A tar of files and links in the given order. Link targets are written
/// verbatim.
pub fn tar_items(items: &[(&str, TarItem<'_>)]) -> Vec<u8> {
  let mut builder = tar::Builder::new(Vec::new());
  for (path, item) in items {
    let mut header = Header::new_gnu();
    header.set_path(path).unwrap();
    match item {
      TarItem::File(data) => {
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder.append(&header, *data).unwrap();
        continue;
      }
      TarItem::Symlink(target) => {
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_link_name(target).unwrap();
      }
      TarItem::HardLink(target) => {
        header.set_entry_type(EntryType::Link);
        header.set_mode(0o644);
        header.set_link_name(target).unwrap();
      }
    }
    header.set_size(0);
    header.set_cksum();
    builder.append(&header, std::io::empty()).unwrap();
  }
  builder.into_inner().unwrap()
}

/// A tar holding a single entry of `kind` (e.g. a fifo).
pub fn tar_with_entry_type(name: &str, kind: EntryType) -> Vec<u8> {
  let mut builder = tar::Builder::new(Vec::new());
  let mut header = Header::new_gnu();
  header.set_entry_type(kind);
  header.set_mode(0o644);
  header.set_size(0);
  header.set_path(name).unwrap();
  header.set_cksum();
  builder.append(&header, std::io::empty()).unwrap();
  builder.into_inner().unwrap()
}

/// Zip archive. Paths ending in `/` become directories; `(path, data, mode)`.
pub fn zip_bytes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
  let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
  for (path, data, mode) in entries {
    let options = zip::write::SimpleFileOptions::default()
      .compression_method(zip::CompressionMethod::Stored)
      .unix_permissions(*mode);
    if path.ends_with('/') {
      writer.add_directory(*path, options).unwrap();
    } else {
      writer.start_file(*path, options).unwrap();
      writer.write_all(data).unwrap();
    }
  }
  writer.finish().unwrap().into_inner()
}
