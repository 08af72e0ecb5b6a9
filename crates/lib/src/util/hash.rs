//! SHA-256 helpers for download verification.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A full 64-character SHA256 hash, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// Compare against a hash written by a human, ignoring case and surrounding whitespace.
  pub fn matches(&self, expected: &str) -> bool {
    self.0.eq_ignore_ascii_case(expected.trim())
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Hash a file's contents without loading it into memory.
pub fn hash_file(path: &Path) -> io::Result<ContentHash> {
  let mut file = fs::File::open(path)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 64 * 1024];

  loop {
    let bytes_read = file.read(&mut buffer)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}

/// Hash a file on the blocking pool.
pub async fn hash_file_async(path: &Path) -> io::Result<ContentHash> {
  let path = path.to_path_buf();
  tokio::task::spawn_blocking(move || hash_file(&path))
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

  #[test]
  fn hash_bytes_of_empty_input() {
    assert_eq!(hash_bytes(b"").0, EMPTY_SHA256);
  }

  #[test]
  fn hash_file_matches_hash_bytes() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("test.txt");
    fs::write(&file_path, "hello world").unwrap();

    let hash = hash_file(&file_path).unwrap();
    assert_eq!(hash, hash_bytes(b"hello world"));
    assert_eq!(hash.0.len(), 64);
  }

  #[test]
  fn matches_ignores_case_and_whitespace() {
    let hash = hash_bytes(b"");
    assert!(hash.matches(&format!("  {}\n", EMPTY_SHA256.to_uppercase())));
    assert!(!hash.matches("deadbeef"));
  }

  #[test]
  fn hash_file_missing_is_error() {
    let temp = tempdir().unwrap();
    assert!(hash_file(&temp.path().join("missing")).is_err());
  }

  #[tokio::test]
  async fn hash_file_async_agrees_with_sync() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("data.bin");
    fs::write(&file_path, vec![7u8; 200_000]).unwrap();

    assert_eq!(hash_file_async(&file_path).await.unwrap(), hash_file(&file_path).unwrap());
  }
}
