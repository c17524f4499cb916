use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// An invalid sink definition.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InvalidSinkConfig {
    /// The sink has no name.
    #[error("sink name must not be empty")]
    EmptyName,
    /// Two sinks share a name.
    #[error("sink name {0:?} is used more than once")]
    DuplicateName(String),
    /// The sink would never attempt a delivery.
    #[error("sink {0:?} must allow at least one attempt")]
    ZeroAttempts(String),
    /// The sink would never have a delivery in flight.
    #[error("sink {0:?} must allow at least one delivery in flight")]
    ZeroInFlight(String),
    /// The URL of an HTTP sink cannot be parsed or is not HTTP.
    #[error("sink {0:?} has an invalid url")]
    InvalidUrl(String),
}

/// The backend of a sink and its specific options.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkKind {
    /// Discards all batches.
    Blackhole,
    /// Logs every record at info level.
    Log,
    /// Posts batches as JSON.
    Http {
        /// The endpoint receiving batches.
        url: String,
    },
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_in_flight() -> usize {
    2
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

/// A downstream backend receiving flushed batches.
///
/// The delivery options apply to every kind of sink.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SinkConfig {
    /// Unique name of the sink, used in logs and internal metrics.
    pub name: String,

    /// The backend.
    #[serde(flatten)]
    pub kind: SinkKind,

    /// Time in milliseconds a single delivery attempt may take.
    ///
    /// Defaults to `5000`.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum number of attempts per batch, including the first one.
    ///
    /// Defaults to `3`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Maximum number of batches delivered concurrently.
    ///
    /// Defaults to `2`. When exceeded, the newest batch is dropped.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Initial backoff in milliseconds between attempts.
    ///
    /// Defaults to `100`. The backoff grows exponentially up to `max_backoff_ms`.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds between attempts.
    ///
    /// Defaults to `2000`.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Maximum number of records per delivery.
    ///
    /// Defaults to `0`, which delivers the whole batch at once.
    #[serde(default)]
    pub max_batch_size: usize,
}

impl SinkConfig {
    /// Creates a sink with default delivery options.
    pub fn new(name: impl Into<String>, kind: SinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            max_in_flight: default_max_in_flight(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_batch_size: 0,
        }
    }

    /// Returns the timeout of a single attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns the initial backoff between attempts.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Returns the maximum backoff between attempts.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Returns the parsed URL of an HTTP sink.
    pub fn url(&self) -> Option<Url> {
        match &self.kind {
            SinkKind::Http { url } => Url::parse(url)
                .ok()
                .filter(|url| matches!(url.scheme(), "http" | "https")),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), InvalidSinkConfig> {
        if self.name.is_empty() {
            return Err(InvalidSinkConfig::EmptyName);
        }
        if self.max_attempts == 0 {
            return Err(InvalidSinkConfig::ZeroAttempts(self.name.clone()));
        }
        if self.max_in_flight == 0 {
            return Err(InvalidSinkConfig::ZeroInFlight(self.name.clone()));
        }
        if matches!(self.kind, SinkKind::Http { .. }) && self.url().is_none() {
            return Err(InvalidSinkConfig::InvalidUrl(self.name.clone()));
        }

        Ok(())
    }
}

/// Validates every sink and the uniqueness of their names.
pub(crate) fn validate_sinks(sinks: &[SinkConfig]) -> Result<(), InvalidSinkConfig> {
    for (index, sink) in sinks.iter().enumerate() {
        sink.validate()?;

        if sinks[..index].iter().any(|other| other.name == sink.name) {
            return Err(InvalidSinkConfig::DuplicateName(sink.name.clone()));
        }
    }

    Ok(())
}
