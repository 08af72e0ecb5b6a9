mod build;
mod info;
mod resolve;

use std::path::Path;

use anyhow::{Context, Result};
use phpstatic_lib::config::LibraryManifest;

pub use build::{BuildArgs, cmd_build, default_clone_dir};
pub use info::cmd_info;
pub use resolve::{ResolveArgs, cmd_resolve};

/// Manifest used when `--manifest` is not given.
pub const DEFAULT_MANIFEST: &str = "config/lib.json";

fn load_manifest(path: &Path) -> Result<LibraryManifest> {
  LibraryManifest::load(path).with_context(|| format!("Failed to load manifest {}", path.display()))
}
