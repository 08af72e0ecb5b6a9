use anyhow::Result;
use serde::Serialize;

use phpstatic_lib::config::Settings;
use phpstatic_lib::platform::{self, paths};

use super::default_clone_dir;
use crate::output::{OutputFormat, print_json, print_stat};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoOutput {
  version: &'static str,
  platform: Option<String>,
  elevated: bool,
  settings_file: String,
  default_clone_dir: String,
  settings: Settings,
}

pub fn cmd_info(output: OutputFormat) -> Result<()> {
  let settings = Settings::load()?;
  let info = InfoOutput {
    version: env!("CARGO_PKG_VERSION"),
    platform: platform::host_target(),
    elevated: platform::is_elevated(),
    settings_file: paths::settings_file().display().to_string(),
    default_clone_dir: default_clone_dir().display().to_string(),
    settings,
  };

  if output.is_json() {
    return print_json(&info);
  }

  println!("phpstatic v{}", info.version);
  print_stat("Platform", info.platform.as_deref().unwrap_or("unsupported"));
  print_stat("Elevated", if info.elevated { "yes" } else { "no" });
  print_stat("Settings", &info.settings_file);
  print_stat("Clone dir", &info.default_clone_dir);
  print_stat("Tool repo", &info.settings.tool_repository);
  print_stat("Concurrency", &info.settings.build_concurrency.to_string());
  Ok(())
}
