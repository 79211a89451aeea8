//! xmlstage common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the xmlstage workspace members:
//!
//! - **Error Handling**: the [`CommonError`] type and [`Result`] alias
//! - **Environment**: typed, strict readers for configuration variables
//! - **Logging**: tracing subscriber setup for console, file or both
//!
//! # Example
//!
//! ```no_run
//! use xmlstage_common::env;
//! use xmlstage_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     let workers: usize = env::parse_or("XMLSTAGE_WORKERS", 4)?;
//!     tracing::info!(workers, "configured");
//!     Ok(())
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
