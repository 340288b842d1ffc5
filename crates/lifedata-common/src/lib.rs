//! lifedata common library
//!
//! Shared utilities for the lifedata workspace members:
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Time**: capture-timestamp parsing used by record validation and
//!   landing-file naming
//! - **Checksums**: SHA-256 digests for landing-file provenance
//!
//! # Example
//!
//! ```no_run
//! use lifedata_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod time;

pub use error::{CommonError, Result};
