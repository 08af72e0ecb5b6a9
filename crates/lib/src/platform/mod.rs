//! Host detection: operating system, CPU target and elevation.

pub mod os;
pub mod paths;

use os::Os;

/// CPU architectures static-php-cli produces binaries for.
const SUPPORTED_ARCHES: &[&str] = &["x86_64", "aarch64"];

/// Target string of the host, e.g. `x86_64-linux` or `aarch64-darwin`.
///
/// `None` when static-php-cli cannot build for this host.
pub fn host_target() -> Option<String> {
  let os = Os::current()?;
  target_for(std::env::consts::ARCH, os)
}

fn target_for(arch: &str, os: Os) -> Option<String> {
  SUPPORTED_ARCHES.contains(&arch).then(|| format!("{arch}-{os}"))
}

/// Whether the current process runs with elevated privileges
/// (root on POSIX, an elevated token on Windows).
#[cfg(unix)]
pub fn is_elevated() -> bool {
  rustix::process::geteuid().is_root()
}

#[cfg(windows)]
pub fn is_elevated() -> bool {
  use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
  use windows_sys::Win32::Security::{GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation};
  use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

  // SAFETY: the token handle is only used after OpenProcessToken succeeded and is
  // closed before returning. TOKEN_ELEVATION is a plain data struct.
  unsafe {
    let mut token: HANDLE = std::ptr::null_mut();
    if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
      return false;
    }
    let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
    let mut size = 0u32;
    let ok = GetTokenInformation(
      token,
      TokenElevation,
      &mut elevation as *mut TOKEN_ELEVATION as *mut _,
      std::mem::size_of::<TOKEN_ELEVATION>() as u32,
      &mut size,
    );
    CloseHandle(token);
    ok != 0 && elevation.TokenIsElevated != 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn target_names_arch_and_os() {
    assert_eq!(target_for("aarch64", Os::MacOs).as_deref(), Some("aarch64-darwin"));
    assert_eq!(target_for("x86_64", Os::Windows).as_deref(), Some("x86_64-windows"));
    assert_eq!(target_for("riscv64", Os::Linux), None);
  }
}
