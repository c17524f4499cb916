//! The tally agent binary.
//!
//! Tally receives metrics from applications on the same host in the statsd line protocol,
//! aggregates them over fixed flush intervals and delivers one batch per interval to each
//! configured sink. Run `tally --help` for a list of commands.
//!
//! ```text
//! tally run --config tally.yml
//! tally config show --format json
//! tally healthcheck --addr 127.0.0.1:8126
//! ```

mod cli;
mod cliapp;
mod healthcheck;
mod setup;

use std::process;

use tally_log::Hub;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tally_log::ensure_error(&err);
            1
        }
    };

    Hub::current().client().map(|x| x.close(None));
    process::exit(exit_code);
}
