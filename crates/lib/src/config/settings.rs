//! Application settings.
//!
//! Settings live in `settings.json` in the per-user config directory. Every
//! field is optional; missing ones take their defaults. A few fields can be
//! overridden from the environment, which wins over the file.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ConfigError;
use crate::consts::{DEFAULT_TOOL_DIR_NAME, DEFAULT_TOOL_REPOSITORY};
use crate::platform::paths::settings_file;

pub const ENV_TOOL_REPOSITORY: &str = "PHPSTATIC_TOOL_REPOSITORY";
pub const ENV_DOWNLOAD_RETRIES: &str = "PHPSTATIC_DOWNLOAD_RETRIES";
pub const ENV_CONCURRENCY: &str = "PHPSTATIC_CONCURRENCY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
  /// Git URL of the build tool.
  pub tool_repository: String,
  /// Checkout directory name inside the clone directory.
  pub tool_dir_name: String,
  pub git_program: String,
  pub composer_program: String,
  pub php_program: String,
  /// Retries for transient download failures.
  pub download_retries: u32,
  /// Base delay before the first retry; doubled for each following one.
  pub retry_backoff_ms: u64,
  /// Download progress is reported every this many percent.
  pub progress_step_percent: u8,
  /// Exported to the build tool as `SPC_CONCURRENCY`.
  pub build_concurrency: u32,
  /// Capacity of the log queue handed to observers.
  pub log_capacity: usize,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      tool_repository: DEFAULT_TOOL_REPOSITORY.to_string(),
      tool_dir_name: DEFAULT_TOOL_DIR_NAME.to_string(),
      git_program: "git".to_string(),
      composer_program: if cfg!(windows) { "composer.bat" } else { "composer" }.to_string(),
      php_program: "php".to_string(),
      download_retries: 3,
      retry_backoff_ms: 500,
      progress_step_percent: 10,
      build_concurrency: 4,
      log_capacity: 1024,
    }
  }
}

impl Settings {
  /// Load the user settings file and apply environment overrides.
  pub fn load() -> Result<Self, ConfigError> {
    Self::load_from(&settings_file())?.with_env_overrides()
  }

  /// Load settings from `path`; a missing file yields the defaults.
  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        debug!(path = ?path, "no settings file, using defaults");
        return Ok(Self::default());
      }
      Err(source) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
    if let Some(repo) = env_value(ENV_TOOL_REPOSITORY) {
      self.tool_repository = repo;
    }
    if let Some(retries) = env_number(ENV_DOWNLOAD_RETRIES)? {
      self.download_retries = retries;
    }
    if let Some(concurrency) = env_number(ENV_CONCURRENCY)? {
      if concurrency == 0 {
        return Err(ConfigError::InvalidEnv {
          var: ENV_CONCURRENCY,
          value: "0".to_string(),
        });
      }
      self.build_concurrency = concurrency;
    }
    Ok(self)
  }

  pub fn retry_backoff(&self) -> Duration {
    Duration::from_millis(self.retry_backoff_ms)
  }
}

fn env_value(var: &str) -> Option<String> {
  std::env::var(var).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_number(var: &'static str) -> Result<Option<u32>, ConfigError> {
  match env_value(var) {
    None => Ok(None),
    Some(value) => value
      .parse::<u32>()
      .map(Some)
      .map_err(|_| ConfigError::InvalidEnv { var, value }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use tempfile::TempDir;

  #[test]
  fn missing_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::load_from(&dir.path().join("settings.json")).unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.download_retries, 3);
    assert_eq!(settings.build_concurrency, 4);
    assert_eq!(settings.retry_backoff(), Duration::from_millis(500));
  }

  #[test]
  fn partial_file_keeps_other_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    fs::write(&path, r#"{ "downloadRetries": 7, "phpProgram": "/opt/php/bin/php" }"#).unwrap();

    let settings = Settings::load_from(&path).unwrap();
    assert_eq!(settings.download_retries, 7);
    assert_eq!(settings.php_program, "/opt/php/bin/php");
    assert_eq!(settings.tool_dir_name, DEFAULT_TOOL_DIR_NAME);
  }

  #[test]
  fn malformed_file_is_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    fs::write(&path, "[1, 2").unwrap();
    assert!(matches!(Settings::load_from(&path), Err(ConfigError::Parse { .. })));
  }

  #[test]
  #[serial]
  fn env_overrides_win() {
    temp_env::with_vars(
      [
        (ENV_TOOL_REPOSITORY, Some("https://example.com/spc.git")),
        (ENV_DOWNLOAD_RETRIES, Some("5")),
        (ENV_CONCURRENCY, Some("16")),
      ],
      || {
        let settings = Settings::default().with_env_overrides().unwrap();
        assert_eq!(settings.tool_repository, "https://example.com/spc.git");
        assert_eq!(settings.download_retries, 5);
        assert_eq!(settings.build_concurrency, 16);
      },
    );
  }

  #[test]
  #[serial]
  fn invalid_env_value_is_rejected() {
    temp_env::with_var(ENV_DOWNLOAD_RETRIES, Some("lots"), || {
      let result = Settings::default().with_env_overrides();
      assert!(matches!(result, Err(ConfigError::InvalidEnv { var: ENV_DOWNLOAD_RETRIES, .. })));
    });
    temp_env::with_var(ENV_CONCURRENCY, Some("0"), || {
      assert!(Settings::default().with_env_overrides().is_err());
    });
  }

  #[test]
  #[serial]
  fn load_reads_from_config_dir() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("phpstatic");
    fs::create_dir_all(&config).unwrap();
    fs::write(config.join("settings.json"), r#"{ "logCapacity": 64 }"#).unwrap();

    let xdg = dir.path().to_str().unwrap().to_string();
    temp_env::with_vars(
      [
        ("XDG_CONFIG_HOME", Some(xdg.as_str())),
        ("APPDATA", Some(xdg.as_str())),
        (ENV_TOOL_REPOSITORY, None),
        (ENV_DOWNLOAD_RETRIES, None),
        (ENV_CONCURRENCY, None),
      ],
      || {
        let settings = Settings::load().unwrap();
        assert_eq!(settings.log_capacity, 64);
      },
    );
  }
}
