//! Implementation of the `phpstatic resolve` command.
//!
//! Prints the libraries and PHP extensions a build would use, without
//! touching the network or the clone directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use phpstatic_lib::BuildSelection;
use phpstatic_lib::config::LibrarySpec;
use phpstatic_lib::resolve::{php_extensions, resolve};

use super::{DEFAULT_MANIFEST, load_manifest};
use crate::output::{OutputFormat, print_json, print_stat, symbols};

#[derive(Args, Debug)]
pub struct ResolveArgs {
  /// PHP version, e.g. 8.3 or 8.3.14
  #[arg(short = 'p', long = "php")]
  pub php_version: String,

  /// Extensions or extension sets to include (comma separated or repeated)
  #[arg(short = 'e', long = "ext", value_delimiter = ',')]
  pub extensions: Vec<String>,

  /// Library manifest
  #[arg(short = 'm', long, default_value = DEFAULT_MANIFEST)]
  pub manifest: PathBuf,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveOutput<'a> {
  php_version: &'a str,
  libraries: &'a [LibrarySpec],
  extensions: &'a [String],
}

pub fn cmd_resolve(args: ResolveArgs) -> Result<()> {
  let manifest = load_manifest(&args.manifest)?;
  let selection = BuildSelection::new(".", &args.php_version, &args.extensions)?;
  let resolved = resolve(&selection, &manifest).context("Failed to resolve dependencies")?;
  let extensions = php_extensions(&selection, &manifest);

  if args.output.is_json() {
    return print_json(&ResolveOutput {
      php_version: &selection.php_version,
      libraries: resolved.libraries(),
      extensions: &extensions,
    });
  }

  println!("Libraries for PHP {}:", selection.php_version);
  for spec in &resolved {
    println!(
      "  {} {} {} {}",
      symbols::INFO,
      spec.name.if_supports_color(Stream::Stdout, |s| s.cyan()),
      spec.version,
      format!("({})", spec.archive_kind.as_str()).if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
  }
  println!();
  print_stat("Extensions", &extensions.join(","));
  Ok(())
}
