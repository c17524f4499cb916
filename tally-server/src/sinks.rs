//! Downstream backends receiving flushed batches.

use std::time::Duration;

use tally_config::{InvalidSinkConfig, SinkConfig, SinkKind};
use tally_metrics::SinkBatch;
use url::Url;

/// An error returned by a single delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The attempt did not complete within the sink timeout.
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    /// The request could not be sent or its response not be read.
    #[error("failed to send request")]
    Request(#[from] reqwest::Error),
    /// The backend responded with a status other than success.
    #[error("backend responded with status {0}")]
    Status(reqwest::StatusCode),
    #[cfg(test)]
    #[error("batch rejected")]
    Rejected,
}

/// A configured backend.
#[derive(Clone, Debug)]
pub enum Sink {
    /// Discards every batch.
    Blackhole,
    /// Logs every record.
    Log,
    /// Posts batches as JSON.
    Http {
        /// The shared HTTP client.
        client: reqwest::Client,
        /// The endpoint receiving batches.
        url: Url,
    },
    #[cfg(test)]
    Test(self::test::TestSink),
}

impl Sink {
    /// Creates the backend of a sink definition.
    pub fn from_config(
        config: &SinkConfig,
        client: &reqwest::Client,
    ) -> Result<Self, InvalidSinkConfig> {
        Ok(match config.kind {
            SinkKind::Blackhole => Self::Blackhole,
            SinkKind::Log => Self::Log,
            SinkKind::Http { .. } => Self::Http {
                client: client.clone(),
                url: config
                    .url()
                    .ok_or_else(|| InvalidSinkConfig::InvalidUrl(config.name.clone()))?,
            },
        })
    }

    /// Delivers a batch to the backend in a single attempt.
    pub async fn flush(&self, batch: &SinkBatch) -> Result<(), SinkError> {
        match self {
            Self::Blackhole => Ok(()),
            Self::Log => {
                let generation = batch.interval().generation;
                for metric in batch.metrics() {
                    tally_log::info!(
                        generation,
                        tags = ?metric.tags,
                        value = ?metric.value,
                        "{}",
                        metric.name,
                    );
                }
                Ok(())
            }
            Self::Http { client, url } => {
                let response = client.post(url.clone()).json(batch).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(SinkError::Status(status));
                }
                Ok(())
            }
            #[cfg(test)]
            Self::Test(sink) => sink.flush(batch).await,
        }
    }
}
