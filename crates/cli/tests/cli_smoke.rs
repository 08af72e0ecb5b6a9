//! CLI smoke tests for phpstatic.
//!
//! These run the binary against temporary manifests and settings. None of
//! them reach the network or run the build tool.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

const MANIFEST: &str = r#"{
  "libraries": [
    {"name": "php-8.3", "version": "8.3.14", "url": "https://www.php.net/distributions/php-8.3.14.tar.xz", "archiveKind": "tar"},
    {"name": "zlib", "version": "1.3.1", "url": "https://zlib.net/zlib-1.3.1.tar.gz", "archiveKind": "tar", "base": true},
    {"name": "mysql-lib", "version": "8.0.40", "url": "https://example.com/mysql-lib-8.0.40.tar.gz", "archiveKind": "tar", "extensions": ["mysql"]}
  ]
}"#;

/// A temp dir with `lib.json` and an isolated config home.
struct Env {
  temp: TempDir,
}

impl Env {
  fn new() -> Self {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("lib.json"), MANIFEST).unwrap();
    Self { temp }
  }

  fn manifest(&self) -> std::path::PathBuf {
    self.temp.path().join("lib.json")
  }

  fn cmd(&self) -> Command {
    let mut cmd = cargo_bin_cmd!("phpstatic");
    cmd
      .env("XDG_CONFIG_HOME", self.temp.path().join("config"))
      .env("XDG_CACHE_HOME", self.temp.path().join("cache"))
      .env("APPDATA", self.temp.path().join("config"))
      .env("LOCALAPPDATA", self.temp.path().join("cache"))
      .env_remove("PHPSTATIC_CONCURRENCY")
      .env_remove("PHPSTATIC_DOWNLOAD_RETRIES")
      .env_remove("RUST_LOG");
    cmd
  }
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  Env::new()
    .cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  Env::new()
    .cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("phpstatic"));
}

#[test]
fn subcommand_help_works() {
  let env = Env::new();
  for cmd in &["build", "resolve", "info"] {
    env
      .cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// resolve
// =============================================================================

#[test]
fn resolve_lists_libraries_in_manifest_order() {
  let env = Env::new();

  env
    .cmd()
    .args(["resolve", "--php", "8.3", "--ext", "mysql", "--manifest"])
    .arg(env.manifest())
    .assert()
    .success()
    .stdout(predicate::str::contains("php-8.3"))
    .stdout(predicate::str::contains("mysql-lib"))
    .stdout(predicate::str::contains("pdo_mysql"));
}

#[test]
fn resolve_json_output() {
  let env = Env::new();

  let output = env
    .cmd()
    .args(["resolve", "-p", "8.3.14", "-o", "json", "-m"])
    .arg(env.manifest())
    .output()
    .unwrap();

  assert!(output.status.success());
  let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let names: Vec<&str> = value["libraries"]
    .as_array()
    .unwrap()
    .iter()
    .map(|l| l["name"].as_str().unwrap())
    .collect();
  assert_eq!(names, vec!["php-8.3", "zlib"]);
  assert_eq!(value["phpVersion"], "8.3.14");
}

#[test]
fn resolve_unknown_extension_fails() {
  let env = Env::new();

  env
    .cmd()
    .args(["resolve", "--php", "8.3", "--ext", "imaginary", "--manifest"])
    .arg(env.manifest())
    .assert()
    .failure()
    .stderr(predicate::str::contains("imaginary"));
}

#[test]
fn resolve_missing_manifest_fails() {
  let env = Env::new();

  env
    .cmd()
    .args(["resolve", "--php", "8.3", "--manifest"])
    .arg(env.temp.path().join("nope.json"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("manifest not found"));
}

// =============================================================================
// build
// =============================================================================

#[test]
fn build_rejects_invalid_php_version() {
  let env = Env::new();

  env
    .cmd()
    .args(["build", "--php", "eight", "--dir"])
    .arg(env.temp.path().join("clone"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid PHP version"));

  assert!(!env.temp.path().join("clone").exists());
}

#[test]
fn build_with_missing_manifest_fails_as_config_error() {
  let env = Env::new();

  env
    .cmd()
    .args(["build", "--php", "8.3", "--dir"])
    .arg(env.temp.path().join("clone"))
    .arg("--manifest")
    .arg(env.temp.path().join("missing.json"))
    .assert()
    .failure()
    .stdout(predicate::str::contains("configuration error"))
    .stderr(predicate::str::contains("manifest not found"));
}

#[test]
fn build_rejects_zero_concurrency_override() {
  let env = Env::new();

  env
    .cmd()
    .env("PHPSTATIC_CONCURRENCY", "0")
    .args(["build", "--php", "8.3", "--dir"])
    .arg(env.temp.path().join("clone"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("PHPSTATIC_CONCURRENCY"));
}

// =============================================================================
// info
// =============================================================================

#[test]
fn info_shows_settings() {
  let env = Env::new();

  env
    .cmd()
    .arg("info")
    .assert()
    .success()
    .stdout(predicate::str::contains("Tool repo"));
}

#[test]
fn info_json_reads_settings_file() {
  let env = Env::new();
  let config_dir = env.temp.path().join("config").join("phpstatic");
  std::fs::create_dir_all(&config_dir).unwrap();
  std::fs::write(config_dir.join("settings.json"), r#"{"buildConcurrency": 12}"#).unwrap();

  let output = env.cmd().args(["info", "--output", "json"]).output().unwrap();

  assert!(output.status.success());
  let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(value["settings"]["buildConcurrency"], 12);
  assert!(value["settingsFile"].as_str().unwrap().ends_with("settings.json"));
}
