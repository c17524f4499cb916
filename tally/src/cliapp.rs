//! This module implements the definition of the command line app.

use std::net::SocketAddr;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};

pub static ABOUT: &str = "The tally agent aggregates host-local metrics and delivers them to sinks.";

pub fn make_app() -> Command {
    Command::new("tally")
        .max_term_width(79)
        .propagate_version(true)
        .version(env!("CARGO_PKG_VERSION"))
        .about(ABOUT)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .env("TALLY_CONFIG")
                .help("The path to the config file."),
        )
        .subcommand(
            Command::new("run")
                .about("Run the tally agent")
                .after_help(
                    "This runs tally in the foreground until it's shut down. It will bind \
                     to the statsd and HTTP addresses of the config file.",
                )
                .arg(
                    Arg::new("statsd_addr")
                        .value_name("ADDR")
                        .long("statsd-addr")
                        .env("TALLY_STATSD_ADDR")
                        .help("The UDP address on which to receive statsd metrics."),
                )
                .arg(
                    Arg::new("http_addr")
                        .value_name("ADDR")
                        .long("http-addr")
                        .env("TALLY_HTTP_ADDR")
                        .help("The address of the HTTP API."),
                )
                .arg(
                    Arg::new("log_level")
                        .value_name("LEVEL")
                        .long("log-level")
                        .env("TALLY_LOG_LEVEL")
                        .help("The log level: off, error, warn, info, debug or trace."),
                )
                .arg(
                    Arg::new("log_format")
                        .value_name("FORMAT")
                        .long("log-format")
                        .env("TALLY_LOG_FORMAT")
                        .help("The log format: auto, pretty, simplified or json."),
                )
                .arg(
                    Arg::new("flush_interval")
                        .value_name("SECONDS")
                        .long("flush-interval")
                        .env("TALLY_FLUSH_INTERVAL")
                        .help("The length of a flush interval in seconds."),
                )
                .arg(
                    Arg::new("shards")
                        .value_name("COUNT")
                        .long("shards")
                        .env("TALLY_SHARDS")
                        .help("The number of aggregation shards."),
                )
                .arg(
                    Arg::new("global")
                        .long("global")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("no_global")
                        .help("Forward histograms and timers to their global owner."),
                )
                .arg(
                    Arg::new("no_global")
                        .long("no-global")
                        .action(ArgAction::SetTrue)
                        .help("Aggregate all metrics locally, overriding the config file."),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the tally config")
                .after_help(
                    "This command provides basic config management. It can be \
                     used primarily to inspect the effective configuration.",
                )
                .subcommand_required(true)
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("show")
                        .about("Show the entire config out for debugging purposes")
                        .arg(
                            Arg::new("format")
                                .short('f')
                                .long("format")
                                .default_value("yaml")
                                .value_parser(["yaml", "json"])
                                .help("The output format"),
                        ),
                ),
        )
        .subcommand(
            Command::new("healthcheck")
                .about("Perform a healthcheck against the HTTP API of a running agent")
                .after_help(
                    "This command checks the health of a tally agent by sending a request \
                     to its healthcheck endpoint. It exits with 0 if the agent is healthy.",
                )
                .arg(
                    Arg::new("addr")
                        .long("addr")
                        .value_parser(value_parser!(SocketAddr))
                        .help("The address of the agent. Defaults to the configured HTTP address."),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("5")
                        .value_parser(value_parser!(u64))
                        .help("Request timeout in seconds"),
                ),
        )
}

/// Returns the string value of `name` if it was passed or set in the environment.
pub fn get_string(matches: &ArgMatches, name: &str) -> Option<String> {
    matches.get_one::<String>(name).cloned()
}
