//! phpstatic-lib: orchestration core for static PHP builds.
//!
//! Drives the static-php-cli build tool end to end:
//! - `config`: library manifest and application settings
//! - `resolve`: which libraries a PHP version and extension selection needs
//! - `fetch`: archive downloads and the build tool checkout
//! - `extract`: safe tar/zip extraction
//! - `invoke`: composer and `spc build`, with platform privilege handling
//! - `pipeline`: runs the stages in order and reports through a `LogSink`

pub mod config;
pub mod consts;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod invoke;
pub mod job;
pub mod layout;
pub mod lock;
pub mod log;
pub mod pipeline;
pub mod platform;
pub mod resolve;
pub mod util;

pub use error::BuildError;
pub use job::{BuildResult, BuildSelection, CancelToken, FailureReason};
pub use pipeline::{BuildHandle, ManifestSource, Pipeline};
