//! Configuration for the tally CLI and server.
//!
//! The configuration is a single YAML file. Every section is optional and falls back to its
//! defaults, so tally also runs without any file. Selected values can be overridden from the
//! command line or the environment through [`OverridableConfig`].
//!
//! ```yaml
//! listen:
//!   statsd: ["127.0.0.1:8125"]
//! aggregator:
//!   flush_interval: 10
//! sinks:
//!   - name: console
//!     type: log
//! ```

#![warn(missing_docs)]

mod config;
mod sink;

pub use self::config::*;
pub use self::sink::*;
