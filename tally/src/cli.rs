use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::ArgMatches;
use tally_config::{Config, OverridableConfig};

use crate::cliapp::{get_string, make_app};
use crate::{healthcheck, setup};

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("failed to load config file {path}"))?,
        None => Config::default(),
    };

    if let Some(matches) = matches.subcommand_matches("run") {
        config.apply_override(extract_config_args(matches))?;
    }

    tally_log::init(config.logging(), config.sentry());

    if let Some(matches) = matches.subcommand_matches("config") {
        manage_config(&config, matches)
    } else if let Some(matches) = matches.subcommand_matches("healthcheck") {
        healthcheck::healthcheck(&config, matches)
    } else if matches.subcommand_matches("run").is_some() {
        run(config)
    } else {
        unreachable!();
    }
}

/// Extracts config overrides of the `run` command from the command line and the environment.
pub fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    let global = if matches.get_flag("global") {
        Some("true".to_owned())
    } else if matches.get_flag("no_global") {
        Some("false".to_owned())
    } else {
        None
    };

    OverridableConfig {
        statsd_addr: get_string(matches, "statsd_addr"),
        http_addr: get_string(matches, "http_addr"),
        log_level: get_string(matches, "log_level"),
        log_format: get_string(matches, "log_format"),
        flush_interval: get_string(matches, "flush_interval"),
        shards: get_string(matches, "shards"),
        global,
    }
}

pub fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    if let Some(matches) = matches.subcommand_matches("show") {
        dump_config(config, matches)
    } else {
        unreachable!();
    }
}

pub fn dump_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    let output = match matches.get_one::<String>("format").map(String::as_str) {
        Some("json") => config.to_json_string()?,
        _ => config.to_yaml_string()?,
    };

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", output.trim_end())?;
    Ok(())
}

pub fn run(config: Config) -> Result<()> {
    setup::check_config(&config)?;
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config)?;
    tally_server::run(config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_overrides() {
        let matches = make_app().get_matches_from([
            "tally",
            "run",
            "--statsd-addr",
            "127.0.0.1:9125",
            "--shards",
            "8",
            "--no-global",
        ]);
        let run = matches.subcommand_matches("run").unwrap();

        let mut config = Config::default();
        config.apply_override(extract_config_args(run)).unwrap();

        assert_eq!(
            config.statsd_addrs(),
            vec!["127.0.0.1:9125".parse().unwrap()]
        );
        assert_eq!(config.aggregator().shards, 8);
        assert!(!config.global_enabled());
    }

    #[test]
    fn test_invalid_override() {
        let matches = make_app().get_matches_from(["tally", "run", "--shards", "many"]);
        let run = matches.subcommand_matches("run").unwrap();

        let mut config = Config::default();
        assert!(config.apply_override(extract_config_args(run)).is_err());
    }

    #[test]
    fn test_config_format() {
        let matches = make_app().get_matches_from(["tally", "config", "show", "-f", "json"]);
        let show = matches
            .subcommand_matches("config")
            .and_then(|m| m.subcommand_matches("show"))
            .unwrap();

        assert_eq!(show.get_one::<String>("format").unwrap(), "json");
    }

    #[test]
    fn test_app_definition() {
        make_app().debug_assert();
    }
}
