mod cmd;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, ResolveArgs};
use output::OutputFormat;

/// phpstatic - build static PHP executables with static-php-cli
#[derive(Parser)]
#[command(name = "phpstatic")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch sources and build a static PHP executable
  Build(BuildArgs),

  /// Show which libraries and extensions a build would use
  Resolve(ResolveArgs),

  /// Show platform, settings and path information
  Info {
    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build(args) => cmd::cmd_build(args, cli.verbose),
    Commands::Resolve(args) => cmd::cmd_resolve(args),
    Commands::Info { output } => cmd::cmd_info(output),
  }
}
