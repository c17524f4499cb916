//! Foundational system components for tally's services.
//!
//! Services are long-running tasks that own their state and receive messages through an
//! unbounded inbox. See [`Service`] for how to define one, and [`Controller`] for graceful
//! shutdown.

#![warn(missing_docs)]

mod controller;
mod service;
mod statsd;

pub use self::controller::*;
pub use self::service::*;
