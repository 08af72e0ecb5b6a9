//! Implementation of the `phpstatic build` command.
//!
//! Starts the pipeline in the background and prints its events as they
//! arrive. Ctrl-C (or `--timeout`) cancels the build; the running external
//! process is killed and partial output stays on disk.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;
use tracing::debug;

use phpstatic_lib::config::Settings;
use phpstatic_lib::job::LibraryStatus;
use phpstatic_lib::log::{LogEvent, LogLevel, log_queue};
use phpstatic_lib::platform::paths;
use phpstatic_lib::{BuildResult, BuildSelection, ManifestSource, Pipeline};

use super::DEFAULT_MANIFEST;
use crate::output::{OutputFormat, format_duration, print_error, print_json, print_stat, print_success, print_warning};

#[derive(Args, Debug)]
pub struct BuildArgs {
  /// Directory that holds the build tool checkout, sources and output
  /// [default: <cache dir>/build]
  #[arg(short = 'd', long = "dir")]
  pub clone_dir: Option<PathBuf>,

  /// PHP version, e.g. 8.3 or 8.3.14
  #[arg(short = 'p', long = "php")]
  pub php_version: String,

  /// Extensions or extension sets to include (comma separated or repeated)
  #[arg(short = 'e', long = "ext", value_delimiter = ',')]
  pub extensions: Vec<String>,

  /// Library manifest
  #[arg(short = 'm', long, default_value = DEFAULT_MANIFEST)]
  pub manifest: PathBuf,

  /// Download every archive again even if a matching copy exists
  #[arg(long)]
  pub force_refresh: bool,

  /// Pass --debug to the build tool
  #[arg(long)]
  pub debug: bool,

  /// Cancel the build after this long (e.g. "45m", "2h")
  #[arg(long, value_parser = humantime::parse_duration)]
  pub timeout: Option<Duration>,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

#[derive(Serialize)]
struct BuildSummary<'a> {
  result: &'a BuildResult,
  libraries: Vec<LibraryLine<'a>>,
  elapsed_ms: u128,
}

#[derive(Serialize)]
struct LibraryLine<'a> {
  name: &'a str,
  status: LibraryStatus,
}

pub fn cmd_build(args: BuildArgs, verbose: bool) -> Result<()> {
  let settings = Settings::load().context("Failed to load settings")?;
  debug!(?settings, "loaded settings");
  let clone_dir = args.clone_dir.clone().unwrap_or_else(default_clone_dir);
  let clone_dir =
    std::path::absolute(&clone_dir).with_context(|| format!("Invalid clone directory {}", clone_dir.display()))?;
  let selection = BuildSelection::new(clone_dir, &args.php_version, &args.extensions)?
    .with_force_refresh(args.force_refresh)
    .with_debug(args.debug);
  let pipeline = Pipeline::for_host(settings.clone()).context("Unsupported operating system")?;
  let json = args.output.is_json();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let start = Instant::now();
  let job = rt.block_on(async {
    let (queue, mut receiver) = log_queue(settings.log_capacity);
    let handle = pipeline.start(ManifestSource::Path(args.manifest.clone()), selection, Arc::new(queue));

    let printer = tokio::spawn(async move {
      while let Some(event) = receiver.recv().await {
        print_event(&event, json, verbose);
      }
    });

    let cancel = handle.cancel_token();
    let timeout = args.timeout;
    let watchdog = tokio::spawn(async move {
      let deadline = async {
        match timeout {
          Some(limit) => tokio::time::sleep(limit).await,
          None => std::future::pending::<()>().await,
        }
      };
      tokio::select! {
        _ = tokio::signal::ctrl_c() => print_warning("Interrupted, cancelling build"),
        _ = deadline => print_warning("Timeout reached, cancelling build"),
      }
      cancel.cancel();
    });

    let job = handle.wait_job().await;
    watchdog.abort();
    let _ = printer.await;
    job
  });
  let job = job.map_err(anyhow::Error::msg)?;
  let elapsed = start.elapsed();

  let Some(result) = job.result() else {
    bail!("Build ended without a result");
  };

  if json {
    print_json(&BuildSummary {
      result,
      libraries: job
        .libraries()
        .iter()
        .map(|(name, status)| LibraryLine { name, status: *status })
        .collect(),
      elapsed_ms: elapsed.as_millis(),
    })?;
  }

  match result {
    BuildResult::Success { artifact } => {
      if !json {
        println!();
        print_success(&format!("Built {} in {}", artifact.display(), format_duration(elapsed)));
        print_stat("Libraries", &job.libraries().len().to_string());
      }
      Ok(())
    }
    BuildResult::Failure { reason, message } => {
      if !json {
        print_error(&format!("Build failed ({reason}) after {}", format_duration(elapsed)));
      }
      bail!("{message}")
    }
  }
}

pub fn default_clone_dir() -> PathBuf {
  paths::cache_dir().join("build")
}

fn print_event(event: &LogEvent, json: bool, verbose: bool) {
  if json {
    if let Ok(line) = serde_json::to_string(event) {
      println!("{line}");
    }
    return;
  }

  let stage = if verbose {
    format!("{} [{}]", event.timestamp.format("%H:%M:%S"), event.stage)
  } else {
    format!("[{}]", event.stage)
  };
  let stage = stage.if_supports_color(Stream::Stdout, |s| s.dimmed());
  match event.level {
    LogLevel::Info => println!("{stage} {}", event.message),
    LogLevel::Warn => println!(
      "{stage} {}",
      event.message.if_supports_color(Stream::Stdout, |s| s.yellow())
    ),
    LogLevel::Error => println!(
      "{stage} {}",
      event.message.if_supports_color(Stream::Stdout, |s| s.red())
    ),
  }
}
