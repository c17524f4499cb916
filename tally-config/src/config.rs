use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_log::{Level, LogConfig, LogFormat, SentryConfig};
use tally_metrics::AggregatorConfig;
use tally_metrics::ring::DEFAULT_VIRTUAL_NODES;

use crate::sink::{SinkConfig, validate_sinks};

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field, either in the file or in an override.
    Field(&'static str),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::Field(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(kind)
        }
    }

    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::Field(name);
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to serialize the configuration.
    #[error("could not serialize config")]
    CouldNotSerialize,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// A listen address that cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid socket address {0:?}")]
pub struct InvalidAddress(String);

fn parse_addr(addr: &str) -> Result<SocketAddr, InvalidAddress> {
    addr.parse().map_err(|_| InvalidAddress(addr.to_owned()))
}

/// A required value is missing.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MissingValue(&'static str);

/// Addresses tally listens on.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Listen {
    /// UDP addresses receiving the statsd line protocol.
    pub statsd: Vec<String>,
    /// Address of the HTTP API with the healthcheck and the import endpoint for global peers.
    ///
    /// Defaults to `None`, which disables the API.
    pub http: Option<String>,
    /// Maximum size of a statsd datagram in bytes.
    pub max_packet_size: usize,
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            statsd: vec!["127.0.0.1:8125".to_owned()],
            http: None,
            max_packet_size: 8192,
        }
    }
}

/// Global aggregation of percentiles.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Enables routing of histograms and timers to their owner in the global ring.
    pub enabled: bool,
    /// The identity of this agent in the ring, the `host:port` of its HTTP API.
    pub node_id: Option<String>,
    /// All global aggregators, identified by the `host:port` of their HTTP API.
    pub peers: Vec<String>,
    /// Positions each peer occupies on the ring.
    pub virtual_nodes: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            peers: Vec::new(),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

/// Forwarding of metrics to global aggregators.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Interval in milliseconds at which buffered metrics are sent.
    pub flush_interval_ms: u64,
    /// Number of buffered metrics for one peer that triggers an immediate send.
    pub max_batch_size: usize,
    /// Maximum number of metrics buffered across all peers. Excess metrics are dropped.
    pub max_buffered: usize,
    /// Timeout in milliseconds of a single request to a peer.
    pub timeout_ms: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
            max_batch_size: 1000,
            max_buffered: 100_000,
            timeout_ms: 5000,
        }
    }
}

impl ForwardConfig {
    /// Returns the interval at which buffered metrics are sent.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Returns the timeout of a single request to a peer.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Control the metrics tally reports about itself.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables internal metrics.
    pub statsd: Option<String>,
    /// Common prefix that is prepended to all metric names.
    pub prefix: String,
    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// Size of the buffer used for sending metrics in bytes.
    pub buffer_size: Option<usize>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    pub sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "tally".to_owned(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
            buffer_size: None,
            sample_rate: 1.0,
        }
    }
}

/// Process limits.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    /// Seconds to wait for pending work on a graceful shutdown.
    pub shutdown_timeout: u64,
    /// Number of worker threads of the runtime. Defaults to the number of CPUs.
    pub max_thread_count: Option<usize>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            shutdown_timeout: 10,
            max_thread_count: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigValues {
    listen: Listen,
    aggregator: AggregatorConfig,
    sinks: Vec<SinkConfig>,
    global: GlobalConfig,
    forward: ForwardConfig,
    logging: LogConfig,
    sentry: SentryConfig,
    metrics: Metrics,
    limits: Limits,
}

/// Configuration values overridden from the command line or the environment.
///
/// All values are kept as strings and parsed when they are applied with
/// [`Config::apply_override`].
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The UDP address of the statsd listener.
    pub statsd_addr: Option<String>,
    /// The address of the HTTP API.
    pub http_addr: Option<String>,
    /// The log level.
    pub log_level: Option<String>,
    /// The log format.
    pub log_format: Option<String>,
    /// The flush interval in seconds.
    pub flush_interval: Option<String>,
    /// The number of shards.
    pub shards: Option<String>,
    /// `"true"` to enable global mode, `"false"` to disable it.
    pub global: Option<String>,
}

/// Tally's configuration and access functions.
#[derive(Clone, Debug, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl Config {
    /// Loads the configuration from a YAML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let file = fs::File::open(path).map_err(|error| {
            ConfigError::wrap(error, ConfigErrorKind::CouldNotOpenFile).file(path)
        })?;

        let values = serde_yaml::from_reader(io::BufReader::new(file))
            .map_err(|error| ConfigError::wrap(error, ConfigErrorKind::BadYaml).file(path))?;

        let config = Config {
            values,
            path: path.to_path_buf(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let values = serde_json::from_value(value)
            .map_err(|error| ConfigError::wrap(error, ConfigErrorKind::BadJson))?;

        let config = Config {
            values,
            path: PathBuf::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(addr) = overrides.statsd_addr {
            parse_addr(&addr).map_err(|e| ConfigError::for_field(e, "statsd_addr"))?;
            self.values.listen.statsd = vec![addr];
        }

        if let Some(addr) = overrides.http_addr {
            parse_addr(&addr).map_err(|e| ConfigError::for_field(e, "http_addr"))?;
            self.values.listen.http = Some(addr);
        }

        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<Level>()
                .map_err(|e| ConfigError::for_field(e, "log_level"))?;
        }

        if let Some(format) = overrides.log_format {
            self.values.logging.format = format
                .parse::<LogFormat>()
                .map_err(|e| ConfigError::for_field(e, "log_format"))?;
        }

        if let Some(interval) = overrides.flush_interval {
            self.values.aggregator.flush_interval = interval
                .parse()
                .map_err(|e| ConfigError::for_field(e, "flush_interval"))?;
        }

        if let Some(shards) = overrides.shards {
            self.values.aggregator.shards = shards
                .parse()
                .map_err(|e| ConfigError::for_field(e, "shards"))?;
        }

        if let Some(global) = overrides.global {
            self.values.global.enabled = global
                .parse()
                .map_err(|e| ConfigError::for_field(e, "global"))?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks the configuration for values that cannot be run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let values = &self.values;

        for addr in &values.listen.statsd {
            parse_addr(addr).map_err(|e| ConfigError::for_field(e, "listen.statsd"))?;
        }
        if let Some(addr) = &values.listen.http {
            parse_addr(addr).map_err(|e| ConfigError::for_field(e, "listen.http"))?;
        }

        values
            .aggregator
            .validate()
            .map_err(|e| ConfigError::for_field(e, "aggregator"))?;

        validate_sinks(&values.sinks).map_err(|e| ConfigError::for_field(e, "sinks"))?;

        if values.global.enabled && values.global.node_id.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::for_field(
                MissingValue("global mode requires a node_id"),
                "global.node_id",
            ));
        }

        Ok(())
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|error| ConfigError::wrap(error, ConfigErrorKind::CouldNotSerialize))
    }

    /// Serializes the configuration to pretty printed JSON.
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(&self.values)
            .map_err(|error| ConfigError::wrap(error, ConfigErrorKind::CouldNotSerialize))
    }

    /// Returns the path of the config file, or an empty path without a file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the UDP addresses of the statsd listeners.
    pub fn statsd_addrs(&self) -> Vec<SocketAddr> {
        // Addresses are validated when the config is loaded.
        let addrs = &self.values.listen.statsd;
        addrs.iter().filter_map(|addr| addr.parse().ok()).collect()
    }

    /// Returns the address of the HTTP API, if enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.values.listen.http.as_deref()?.parse().ok()
    }

    /// Returns the maximum size of a statsd datagram.
    pub fn max_packet_size(&self) -> usize {
        self.values.listen.max_packet_size
    }

    /// Returns the aggregator configuration.
    pub fn aggregator(&self) -> &AggregatorConfig {
        &self.values.aggregator
    }

    /// Returns the configured sinks.
    pub fn sinks(&self) -> &[SinkConfig] {
        &self.values.sinks
    }

    /// Returns `true` if percentile metrics are routed to global aggregators.
    pub fn global_enabled(&self) -> bool {
        self.values.global.enabled
    }

    /// Returns the global mode configuration.
    pub fn global(&self) -> &GlobalConfig {
        &self.values.global
    }

    /// Returns the forwarding configuration.
    pub fn forward(&self) -> &ForwardConfig {
        &self.values.forward
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the Sentry configuration.
    pub fn sentry(&self) -> &SentryConfig {
        &self.values.sentry
    }

    /// Returns the address of the statsd server for internal metrics.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix of internal metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags of internal metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the name of the tag reporting the hostname, if any.
    pub fn metrics_hostname_tag(&self) -> Option<&str> {
        self.values.metrics.hostname_tag.as_deref()
    }

    /// Returns the send buffer size of internal metrics.
    pub fn statsd_buffer_size(&self) -> Option<usize> {
        self.values.metrics.buffer_size
    }

    /// Returns the sample rate of internal metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }

    /// Returns the time to wait for pending work on a graceful shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }

    /// Returns the number of runtime worker threads, if limited.
    pub fn max_thread_count(&self) -> Option<usize> {
        self.values.limits.max_thread_count
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use insta::assert_json_snapshot;
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::sink::SinkKind;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(
            config.statsd_addrs(),
            vec!["127.0.0.1:8125".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(config.http_addr(), None);
        assert!(config.sinks().is_empty());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));

        assert_json_snapshot!(config.values, @r#"
        {
          "listen": {
            "statsd": [
              "127.0.0.1:8125"
            ],
            "http": null,
            "max_packet_size": 8192
          },
          "aggregator": {
            "flush_interval": 10,
            "align_to_interval": true,
            "shards": 4,
            "shard_queue_size": 8192,
            "enqueue_timeout_ms": 0,
            "rotation_timeout_ms": 1000,
            "percentiles": [
              0.5,
              0.75,
              0.9,
              0.99
            ],
            "sketch_accuracy": 0.01
          },
          "sinks": [],
          "global": {
            "enabled": false,
            "node_id": null,
            "peers": [],
            "virtual_nodes": 128
          },
          "forward": {
            "flush_interval_ms": 1000,
            "max_batch_size": 1000,
            "max_buffered": 100000,
            "timeout_ms": 5000
          },
          "logging": {
            "level": "info",
            "format": "auto",
            "enable_backtraces": false
          },
          "sentry": {
            "dsn": null,
            "enabled": false,
            "environment": null,
            "server_name": null
          },
          "metrics": {
            "statsd": null,
            "prefix": "tally",
            "default_tags": {},
            "hostname_tag": null,
            "buffer_size": null,
            "sample_rate": 1.0
          },
          "limits": {
            "shutdown_timeout": 10,
            "max_thread_count": null
          }
        }
        "#);
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen:
  statsd: ["0.0.0.0:9125", "127.0.0.1:9126"]
  http: "127.0.0.1:8127"
aggregator:
  flush_interval: 30
sinks:
  - name: console
    type: log
  - name: backend
    type: http
    url: "http://collector:8080/metrics"
    max_in_flight: 1
logging:
  level: debug
  format: text
"#
        )
        .unwrap();

        let config = Config::from_path(file.path()).unwrap();

        assert_eq!(config.path(), file.path());
        assert_eq!(config.statsd_addrs().len(), 2);
        assert_eq!(config.http_addr(), "127.0.0.1:8127".parse::<SocketAddr>().ok());
        assert_eq!(config.aggregator().flush_interval, 30);
        assert_eq!(config.aggregator().shards, 4);
        assert_eq!(config.sinks().len(), 2);
        assert_eq!(config.sinks()[0].kind, SinkKind::Log);
        assert_eq!(config.sinks()[1].max_in_flight, 1);
        assert_eq!(config.logging().level, Level::Debug);
        assert_eq!(config.logging().format, LogFormat::Simplified);
    }

    #[test]
    fn test_missing_file() {
        let error = Config::from_path("/does/not/exist/tally.yml").unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
        assert_eq!(
            error.to_string(),
            "could not open config file (file /does/not/exist/tally.yml)"
        );
        assert!(error.source().is_some());
    }

    #[test]
    fn test_bad_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logging:\n  format: xml").unwrap();

        let error = Config::from_path(file.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            (json!({"aggregator": {"shards": 0}}), "aggregator"),
            (json!({"aggregator": {"percentiles": [0.0]}}), "aggregator"),
            (json!({"listen": {"statsd": ["localhost"]}}), "listen.statsd"),
            (json!({"listen": {"http": "nope"}}), "listen.http"),
            (json!({"sinks": [{"name": "h", "type": "http", "url": "not a url"}]}), "sinks"),
            (json!({"global": {"enabled": true}}), "global.node_id"),
        ];

        for (value, field) in cases {
            let error = Config::from_json_value(value.clone()).unwrap_err();
            assert_eq!(error.kind(), ConfigErrorKind::InvalidValue, "{value}");
            assert_eq!(
                error.to_string(),
                format!("invalid config value (field {field})"),
                "{value}"
            );
        }
    }

    #[test]
    fn test_global_without_peers_is_valid() {
        let config = Config::from_json_value(json!({
            "global": {"enabled": true, "node_id": "10.0.0.1:8127"}
        }))
        .unwrap();

        assert!(config.global_enabled());
        assert!(config.global().peers.is_empty());
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                statsd_addr: Some("0.0.0.0:9000".to_owned()),
                http_addr: Some("127.0.0.1:9001".to_owned()),
                log_level: Some("TRACE".to_owned()),
                log_format: Some("json".to_owned()),
                flush_interval: Some("5".to_owned()),
                shards: Some("16".to_owned()),
                global: None,
            })
            .unwrap();

        assert_eq!(
            config.statsd_addrs(),
            vec!["0.0.0.0:9000".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(config.http_addr(), "127.0.0.1:9001".parse::<SocketAddr>().ok());
        assert_eq!(config.logging().level, Level::Trace);
        assert_eq!(config.logging().format, LogFormat::Json);
        assert_eq!(config.aggregator().flush_interval, 5);
        assert_eq!(config.aggregator().shards, 16);
        assert!(!config.global_enabled());
    }

    #[test]
    fn test_apply_override_errors() {
        let error = Config::default()
            .apply_override(OverridableConfig {
                log_format: Some("xml".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(error.to_string(), "invalid config value (field log_format)");

        let error = Config::default()
            .apply_override(OverridableConfig {
                shards: Some("many".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(error.to_string(), "invalid config value (field shards)");

        // Overrides are validated together with the rest of the config.
        let error = Config::default()
            .apply_override(OverridableConfig {
                global: Some("true".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(error.to_string(), "invalid config value (field global.node_id)");
    }

    #[test]
    fn test_yaml_roundtrip_of_sinks() {
        let config = Config::from_json_value(json!({
            "sinks": [{"name": "backend", "type": "http", "url": "https://example.com/m"}]
        }))
        .unwrap();

        let yaml = config.to_yaml_string().unwrap();
        assert!(yaml.contains("type: http"));
        assert!(yaml.contains("url: https://example.com/m"));
    }
}
