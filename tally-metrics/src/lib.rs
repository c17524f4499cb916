//! Metrics protocol, aggregation and routing for tally.
//!
//! Instrumented applications send samples of counters, gauges, histograms, timers and sets. Tally
//! folds all samples of a metric key within a flush interval into a single aggregate, and hands
//! the aggregates of each interval to sinks as a [`SinkBatch`].
//!
//! # Protocol
//!
//! Samples are received in the statsd line protocol:
//!
//! ```text
//! endpoint.hits:1|c|@0.5|#route:index,env:prod
//! endpoint.response_time:57|ms
//! ```
//!
//! | Type | Kind | Aggregation |
//! |------|------|-------------|
//! | `c` | [`Counter`](MetricKind::Counter) | Sum, scaled by the inverse sample rate |
//! | `g` | [`Gauge`](MetricKind::Gauge) | Last value |
//! | `h`, `d` | [`Histogram`](MetricKind::Histogram) | Quantile sketch |
//! | `ms` | [`Timer`](MetricKind::Timer) | Quantile sketch |
//! | `s` | [`Set`](MetricKind::Set) | Number of unique members |
//!
//! Global aggregators exchange samples as JSON, see [`Metric`].
//!
//! # Sharding
//!
//! The keyspace is partitioned into [`Shard`]s by the [`ShardRouter`]. Every shard is owned by a
//! single task, so aggregation never takes a lock. Once per interval, each shard is rotated into
//! a [`ClosedShard`], and the closed shards of all tasks are assembled with
//! [`SinkBatch::collect`].
//!
//! # Global Mode
//!
//! Percentiles cannot be merged across hosts after the fact. In global mode, histograms and
//! timers are therefore routed to a single owner per key with a consistent hash ring, see
//! [`GlobalRouter`].

#![warn(missing_docs)]

mod aggregation;
mod config;
mod flush;
mod parse;
mod protocol;
mod routing;
mod shard;
mod sketch;
mod statsd;

pub mod ring;

pub use self::aggregation::*;
pub use self::config::*;
pub use self::flush::*;
pub use self::parse::*;
pub use self::protocol::*;
pub use self::ring::{GlobalRouter, HashRing, NodeId, Owner, RingError};
pub use self::routing::*;
pub use self::shard::*;
pub use self::sketch::*;
pub use tally_common::UnixTimestamp;
