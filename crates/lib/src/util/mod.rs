//! Shared utilities.
//!
//! Hashing plus test helpers for faking external tools.

pub mod hash;

#[cfg(test)]
pub mod testutil;
