//! Common functionality shared by the tally crates.

#![warn(missing_docs)]

mod retry;
mod time;

pub use self::retry::*;
pub use self::time::*;
