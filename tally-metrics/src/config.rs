use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An invalid value in the [`AggregatorConfig`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum InvalidAggregatorConfig {
    /// The flush interval is zero.
    #[error("flush interval must be positive")]
    ZeroFlushInterval,
    /// The shard count is zero.
    #[error("the number of shards must be positive")]
    ZeroShards,
    /// The shard queue cannot hold any samples.
    #[error("the shard queue size must be positive")]
    ZeroQueueSize,
    /// A requested percentile is outside of `(0, 1]`.
    #[error("percentile {0} is not within (0, 1]")]
    InvalidPercentile(f64),
    /// The sketch accuracy is outside of `(0, 1)`.
    #[error("sketch accuracy {0} is not within (0, 1)")]
    InvalidAccuracy(f64),
}

/// Parameters of the aggregation pipeline.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// The length of a flush interval in seconds.
    ///
    /// Defaults to `10` seconds. All samples received within one interval are aggregated into a
    /// single value per metric key.
    pub flush_interval: u64,

    /// Aligns flushes to multiples of the interval since the UNIX epoch.
    ///
    /// Defaults to `true`, which makes windows comparable across hosts. Otherwise, the first
    /// interval starts when the agent starts.
    pub align_to_interval: bool,

    /// The number of shards partitioning the metric keyspace.
    ///
    /// Defaults to `4`. This cannot change while the agent is running.
    pub shards: usize,

    /// The number of samples each shard can queue before samples are dropped.
    ///
    /// Defaults to `8192`.
    pub shard_queue_size: usize,

    /// Time in milliseconds to wait for space in a full shard queue before dropping a sample.
    ///
    /// Defaults to `0`, which drops immediately.
    pub enqueue_timeout_ms: u64,

    /// Time in milliseconds the flush waits for each shard to rotate.
    ///
    /// Defaults to `1000`. Shards that do not respond in time contribute their samples to the
    /// next interval instead.
    pub rotation_timeout_ms: u64,

    /// Quantiles reported for histograms and timers, each within `(0, 1]`.
    ///
    /// Defaults to `[0.5, 0.75, 0.9, 0.99]`.
    pub percentiles: Vec<f64>,

    /// Relative accuracy of histogram and timer sketches, within `(0, 1)`.
    ///
    /// Defaults to `0.01`, meaning that every reported quantile is within 1% of an observed value.
    pub sketch_accuracy: f64,
}

impl AggregatorConfig {
    /// Returns the flush interval as duration.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    /// Returns the number of shards, or `None` if it is zero.
    pub fn shard_count(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.shards)
    }

    /// Returns the time to wait for a full shard queue.
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    /// Returns the time to wait for each shard to rotate.
    pub fn rotation_timeout(&self) -> Duration {
        Duration::from_millis(self.rotation_timeout_ms)
    }

    /// Checks that all values are within their valid ranges.
    pub fn validate(&self) -> Result<(), InvalidAggregatorConfig> {
        if self.flush_interval == 0 {
            return Err(InvalidAggregatorConfig::ZeroFlushInterval);
        }
        if self.shards == 0 {
            return Err(InvalidAggregatorConfig::ZeroShards);
        }
        if self.shard_queue_size == 0 {
            return Err(InvalidAggregatorConfig::ZeroQueueSize);
        }
        if let Some(&p) = self.percentiles.iter().find(|&&p| !(p > 0.0 && p <= 1.0)) {
            return Err(InvalidAggregatorConfig::InvalidPercentile(p));
        }
        if !(self.sketch_accuracy > 0.0 && self.sketch_accuracy < 1.0) {
            return Err(InvalidAggregatorConfig::InvalidAccuracy(
                self.sketch_accuracy,
            ));
        }

        Ok(())
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval: 10,
            align_to_interval: true,
            shards: 4,
            shard_queue_size: 8192,
            enqueue_timeout_ms: 0,
            rotation_timeout_ms: 1000,
            percentiles: vec![0.5, 0.75, 0.9, 0.99],
            sketch_accuracy: 0.01,
        }
    }
}
