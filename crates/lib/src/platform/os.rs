use std::fmt;

/// Operating system families the pipeline distinguishes.
///
/// Only the Windows/POSIX split matters for privilege handling and the
/// artifact name; the finer variants are kept for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
  Linux,
  MacOs,
  Windows,
}

impl Os {
  /// Detect the current operating system at runtime
  pub fn current() -> Option<Self> {
    match std::env::consts::OS {
      "linux" => Some(Self::Linux),
      "macos" => Some(Self::MacOs),
      "windows" => Some(Self::Windows),
      _ => None,
    }
  }

  /// Returns the lowercase string identifier for this OS
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::MacOs => "darwin",
      Self::Windows => "windows",
    }
  }

  pub fn is_windows(&self) -> bool {
    matches!(self, Self::Windows)
  }

  /// File name of the PHP executable produced by static-php-cli.
  pub fn php_binary_name(&self) -> &'static str {
    match self {
      Self::Windows => "php.exe",
      Self::Linux | Self::MacOs => "php",
    }
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn current_returns_supported_os() {
    assert!(Os::current().is_some(), "Current OS should be supported");
  }

  #[test]
  fn php_binary_name_follows_platform() {
    assert_eq!(Os::Windows.php_binary_name(), "php.exe");
    assert_eq!(Os::Linux.php_binary_name(), "php");
    assert_eq!(Os::MacOs.php_binary_name(), "php");
  }
}
