use anyhow::Result;
use tally_config::Config;
use tally_statsd::MetricsConfig;

pub fn check_config(config: &Config) -> Result<()> {
    if config.statsd_addrs().is_empty() && config.http_addr().is_none() {
        anyhow::bail!("tally has nothing to listen on, configure a statsd or HTTP address");
    }

    if config.global_enabled() && config.http_addr().is_none() {
        anyhow::bail!("global mode requires the HTTP API to receive metrics from peers");
    }

    if config.sinks().is_empty() {
        tally_log::warn!("no sinks configured, aggregated metrics will be discarded");
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        tally_log::info!("launching tally without config file");
    } else {
        tally_log::info!(
            "launching tally from config file {}",
            config.path().display()
        );
    }

    let aggregator = config.aggregator();
    tally_log::info!("  flush interval: {}s", aggregator.flush_interval);
    tally_log::info!("  shards: {}", aggregator.shards);
    tally_log::info!("  sinks: {}", config.sinks().len());

    let global = config.global();
    match global.node_id.as_deref() {
        Some(node) if global.enabled => {
            tally_log::info!("  global node: {node} ({} peers)", global.peers.len())
        }
        _ => tally_log::info!("  global node: -"),
    }
    tally_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(host) = config.statsd_addr() else {
        return Ok(());
    };

    let mut default_tags = config.metrics_default_tags().clone();
    if let Some(hostname_tag) = config.metrics_hostname_tag()
        && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
    {
        default_tags.insert(hostname_tag.to_owned(), hostname);
    }
    tally_statsd::init(MetricsConfig {
        prefix: config.metrics_prefix().to_owned(),
        host: host.to_owned(),
        buffer_size: config.statsd_buffer_size(),
        default_tags,
        sample_rate: config.metrics_sample_rate(),
    })?;

    Ok(())
}
