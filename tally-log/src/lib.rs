//! Error reporting and logging for tally.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with [`LogConfig`] and [`SentryConfig`]. The
//! configuration implements `serde` traits, so it can be obtained from the YAML configuration
//! file:
//!
//! ```yaml
//! logging:
//!   level: debug
//!   format: json
//! sentry:
//!   enabled: true
//!   dsn: "https://public@sentry.example.com/1"
//! ```
//!
//! # Logging
//!
//! The basic use of the log crate is through the five logging macros: [`error!`], [`warn!`],
//! [`info!`], [`debug!`] and [`trace!`]. Messages are lowercase and carry no trailing
//! punctuation:
//!
//! ```
//! tally_log::info!("flushed {} metrics", 42);
//! ```
//!
//! To log an error with its full chain of causes, wrap it in [`LogError`]:
//!
//! ```
//! use tally_log::LogError;
//!
//! if let Err(error) = std::env::var("FOO") {
//!     tally_log::error!("env failed: {}", LogError(&error));
//! }
//! ```
//!
//! # Testing
//!
//! For unit testing, there is a separate initialization macro [`init_test!`] that should be called
//! at the beginning of the test method. It enables test mode of the logger and customizes log
//! levels for the current crate.

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{debug, error, info, trace, warn};
// Expose the minimal error reporting API.
#[doc(inline)]
pub use sentry_core::{Hub, capture_error, configure_scope, protocol, with_scope};
