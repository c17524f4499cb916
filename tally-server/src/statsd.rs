use tally_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Gauge metrics used by the tally server.
pub enum ServerGauges {
    /// Number of records in the batch of the last flush generation.
    FlushRecords,
    /// Number of metrics waiting to be forwarded to a global aggregator.
    ///
    /// This metric is tagged with:
    /// - `node`: the destination node.
    ForwardBuffered,
}

impl GaugeMetric for ServerGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::FlushRecords => "flush.records",
            Self::ForwardBuffered => "forward.buffered",
        }
    }
}

/// Timer metrics used by the tally server.
pub enum ServerTimers {
    /// Time from signaling all shards to receiving the last closed map or giving up.
    FlushRotation,
    /// Total time of a flush cycle, from rotation until the batch is handed to the dispatcher.
    FlushDuration,
    /// Time to deliver a batch to a sink, including retries and backoff.
    ///
    /// This metric is tagged with:
    /// - `sink`: the name of the sink.
    /// - `outcome`: `delivered` or `failed`.
    SinkDelivery,
    /// Time of a request to a global aggregator.
    ///
    /// This metric is tagged with:
    /// - `node`: the destination node.
    ForwardRequest,
}

impl TimerMetric for ServerTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::FlushRotation => "flush.rotation",
            Self::FlushDuration => "flush.duration",
            Self::SinkDelivery => "sink.delivery",
            Self::ForwardRequest => "forward.request",
        }
    }
}

/// Counter metrics used by the tally server.
pub enum ServerCounters {
    /// Number of times the HTTP server has started.
    ServerStarting,
    /// Number of statsd datagrams received.
    PacketsReceived,
    /// Number of statsd lines that could not be parsed.
    ///
    /// This metric is tagged with:
    /// - `error`: the kind of parse error.
    ParseFailed,
    /// Number of samples dropped because a shard queue was full.
    ///
    /// This metric is tagged with:
    /// - `shard`: the shard that rejected the sample.
    SamplesDropped,
    /// Number of shards that did not rotate within the rotation timeout.
    ///
    /// Their samples are reported with the next generation.
    ///
    /// This metric is tagged with:
    /// - `shard`: the slow shard.
    ShardStraggler,
    /// Number of failed attempts that are retried after a backoff.
    ///
    /// This metric is tagged with:
    /// - `sink`: the name of the sink.
    SinkRetry,
    /// Number of batches given up after the last attempt.
    ///
    /// This metric is tagged with:
    /// - `sink`: the name of the sink.
    SinkFailed,
    /// Number of batches dropped because the sink had too many deliveries in flight.
    ///
    /// This metric is tagged with:
    /// - `sink`: the name of the sink.
    SinkShed,
    /// Number of metrics sent to the global aggregator owning them.
    MetricsForwarded,
    /// Number of metrics dropped because the forward buffer of a node was full.
    ///
    /// This metric is tagged with:
    /// - `node`: the destination node.
    ForwardDropped,
    /// Number of metrics lost in failed requests to global aggregators.
    ///
    /// This metric is tagged with:
    /// - `node`: the destination node.
    ForwardFailed,
    /// Number of imported metrics that this node does not own on the ring.
    ///
    /// They are aggregated regardless.
    ImportMisrouted,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::ServerStarting => "server.starting",
            Self::PacketsReceived => "listener.packets",
            Self::ParseFailed => "listener.parse_failed",
            Self::SamplesDropped => "shard.samples_dropped",
            Self::ShardStraggler => "flush.straggler",
            Self::SinkRetry => "sink.retry",
            Self::SinkFailed => "sink.failed",
            Self::SinkShed => "sink.shed",
            Self::MetricsForwarded => "forward.metrics",
            Self::ForwardDropped => "forward.dropped",
            Self::ForwardFailed => "forward.failed",
            Self::ImportMisrouted => "import.misrouted",
        }
    }
}
