use tally_statsd::{CounterMetric, GaugeMetric};

/// Counter metrics for tally metrics.
pub enum MetricCounters {
    /// Number of samples applied to a shard during one generation.
    ///
    /// Emitted when the shard rotates. Tagged by `shard`.
    SamplesIngested,

    /// Incremented for every sample with a sample rate outside of `(0, 1]`.
    ///
    /// Such samples are applied without scaling. Emitted when the shard rotates. Tagged by
    /// `shard`.
    InvalidSampleRate,

    /// Incremented every time a shard merges a closed map back into its active generation.
    ///
    /// This happens when a shard finishes rotating after the flush coordinator stopped waiting
    /// for it. The samples are reported with the next generation. Tagged by `shard`.
    StragglerRestored,

    /// Incremented when the global ring cannot be built from the configured peers.
    ///
    /// While this happens, the agent treats itself as the owner of all metrics.
    RingFallback,
}

impl CounterMetric for MetricCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::SamplesIngested => "metrics.shard.samples",
            Self::InvalidSampleRate => "metrics.shard.invalid_sample_rate",
            Self::StragglerRestored => "metrics.shard.straggler_restored",
            Self::RingFallback => "metrics.ring.fallback",
        }
    }
}

/// Gauge metrics for tally metrics.
pub enum MetricGauges {
    /// Number of keys in a shard's map when it is closed.
    ///
    /// Tagged by `shard`.
    ShardKeys,

    /// Number of nodes in the global ring after it was rebuilt.
    RingNodes,
}

impl GaugeMetric for MetricGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::ShardKeys => "metrics.shard.keys",
            Self::RingNodes => "metrics.ring.nodes",
        }
    }
}
