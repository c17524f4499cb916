use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, format_err};
use clap::ArgMatches;
use reqwest::blocking::Client;
use tally_config::Config;

pub fn healthcheck(config: &Config, matches: &ArgMatches) -> Result<()> {
    let timeout = matches.get_one::<u64>("timeout").copied().unwrap_or(5);

    let addr = matches
        .get_one::<SocketAddr>("addr")
        .copied()
        .or_else(|| config.http_addr())
        .ok_or_else(|| format_err!("no HTTP address configured, pass one with --addr"))?;

    let client = Client::builder()
        .timeout(Some(Duration::from_secs(timeout)))
        .build()
        .unwrap_or_default();

    let response = client.get(format!("http://{addr}/api/healthcheck")).send();

    match response {
        Ok(response) => {
            if response.status().is_success() {
                Ok(())
            } else {
                tally_log::error!("Tally is unhealthy. Status code: {}", response.status());
                Err(format_err!(
                    "Tally is unhealthy. Status code: {}",
                    response.status()
                ))
            }
        }
        Err(err) => {
            tally_log::error!("Tally is unhealthy. Error: {err}");
            Err(err.into())
        }
    }
}
