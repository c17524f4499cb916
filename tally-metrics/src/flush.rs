use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_common::UnixTimestamp;

use crate::protocol::{MetricKey, MetricKind};
use crate::shard::ClosedShard;
use crate::sketch::HistogramSummary;

/// A closed time window of aggregation.
///
/// Generations increase strictly with every rotation and never overlap.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FlushInterval {
    /// Monotonically increasing number of this window, starting at `1`.
    pub generation: u64,
    /// Start of the window, inclusive.
    pub start: UnixTimestamp,
    /// End of the window, exclusive.
    pub end: UnixTimestamp,
}

/// The aggregated value of one metric key as delivered to sinks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FlushedValue {
    /// Sum of all scaled increments.
    Counter(f64),
    /// The last written value.
    Gauge(f64),
    /// Number of distinct members.
    Set(u64),
    /// Distribution summary of a histogram.
    Histogram(HistogramSummary),
    /// Distribution summary of a timer.
    Timer(HistogramSummary),
}

impl FlushedValue {
    /// Returns the kind of the metric this value was aggregated from.
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Set(_) => MetricKind::Set,
            Self::Histogram(_) => MetricKind::Histogram,
            Self::Timer(_) => MetricKind::Timer,
        }
    }
}

/// One record of a [`SinkBatch`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlushedMetric {
    /// The name of the metric.
    pub name: String,
    /// Sorted tags of the metric.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// The aggregated value.
    #[serde(flatten)]
    pub value: FlushedValue,
}

impl FlushedMetric {
    /// Returns the kind of this metric.
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}

/// The read-only result of one flush generation, ordered by metric key.
///
/// The records are shared by reference counting, so cloning a batch or splitting it into
/// [`chunks`](Self::chunks) never copies them.
///
/// A batch serializes as `{"interval": {...}, "metrics": [...]}` with only the records of its
/// range.
#[derive(Clone, Debug)]
pub struct SinkBatch {
    interval: FlushInterval,
    metrics: Arc<[FlushedMetric]>,
    range: Range<usize>,
}

impl SinkBatch {
    /// Creates a batch from records that are already ordered.
    pub fn new(interval: FlushInterval, metrics: Vec<FlushedMetric>) -> Self {
        let range = 0..metrics.len();
        Self {
            interval,
            metrics: metrics.into(),
            range,
        }
    }

    /// Assembles the batch of a generation from the closed maps of all shards.
    ///
    /// Histograms and timers report the given quantiles.
    ///
    /// # Panics
    ///
    /// Panics if a shard was closed for a different generation, or if two shards hold state for
    /// the same metric key. Both indicate a broken routing or rotation.
    pub fn collect(interval: FlushInterval, shards: Vec<ClosedShard>, percentiles: &[f64]) -> Self {
        let total = shards.iter().map(|shard| shard.len()).sum();
        let mut entries = Vec::with_capacity(total);

        for shard in shards {
            assert_eq!(
                shard.interval.generation, interval.generation,
                "shard {} closed generation {} while collecting generation {}",
                shard.shard_id, shard.interval.generation, interval.generation,
            );
            entries.extend(shard.into_aggregates());
        }

        entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

        if let Some(pair) = entries.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            panic!("two shards claim the same key {}", pair[0].0);
        }

        let metrics = entries
            .into_iter()
            .map(|(MetricKey { name, tags, .. }, aggregate)| FlushedMetric {
                name,
                tags,
                value: aggregate.flush(percentiles),
            })
            .collect();

        Self::new(interval, metrics)
    }

    /// Returns the flush interval of this batch.
    pub fn interval(&self) -> FlushInterval {
        self.interval
    }

    /// Returns the records of this batch.
    pub fn metrics(&self) -> &[FlushedMetric] {
        &self.metrics[self.range.clone()]
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Returns `true` if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Splits the batch into contiguous chunks of at most `max_size` records.
    ///
    /// A `max_size` of zero yields the whole batch as one chunk. An empty batch yields no chunks.
    pub fn chunks(&self, max_size: usize) -> impl Iterator<Item = SinkBatch> + '_ {
        let step = if max_size == 0 {
            self.len().max(1)
        } else {
            max_size
        };

        self.range.clone().step_by(step).map(move |start| Self {
            interval: self.interval,
            metrics: Arc::clone(&self.metrics),
            range: start..(start + step).min(self.range.end),
        })
    }
}

impl Serialize for SinkBatch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Payload<'a> {
            interval: &'a FlushInterval,
            metrics: &'a [FlushedMetric],
        }

        Payload {
            interval: &self.interval,
            metrics: self.metrics(),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::protocol::{Metric, MetricValue};
    use crate::shard::Shard;

    fn interval(generation: u64) -> FlushInterval {
        FlushInterval {
            generation,
            start: UnixTimestamp::from_secs(1_700_000_000),
            end: UnixTimestamp::from_secs(1_700_000_010),
        }
    }

    fn counter(name: &str, value: f64) -> Metric {
        Metric::new(
            name,
            MetricValue::Counter(value),
            UnixTimestamp::from_secs(1_700_000_005),
        )
    }

    fn names(batch: &SinkBatch) -> Vec<&str> {
        batch.metrics().iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn test_collect_orders_by_key() {
        let mut first = Shard::new(0, 0.01);
        let mut second = Shard::new(1, 0.01);
        first.ingest(counter("zeta", 1.0));
        second.ingest(counter("alpha", 2.0));
        first.ingest(counter("mid", 3.0));

        let batch = SinkBatch::collect(
            interval(1),
            vec![first.rotate(interval(1)), second.rotate(interval(1))],
            &[],
        );

        assert_eq!(names(&batch), ["alpha", "mid", "zeta"]);
    }

    #[test]
    #[should_panic(expected = "two shards claim the same key")]
    fn test_collect_duplicate_key() {
        let mut first = Shard::new(0, 0.01);
        let mut second = Shard::new(1, 0.01);
        first.ingest(counter("requests", 1.0));
        second.ingest(counter("requests", 1.0));

        SinkBatch::collect(
            interval(1),
            vec![first.rotate(interval(1)), second.rotate(interval(1))],
            &[],
        );
    }

    #[test]
    #[should_panic(expected = "while collecting generation 2")]
    fn test_collect_wrong_generation() {
        let mut shard = Shard::new(0, 0.01);
        SinkBatch::collect(interval(2), vec![shard.rotate(interval(1))], &[]);
    }

    #[test]
    fn test_chunks() {
        let metrics = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|name| FlushedMetric {
                name: name.to_owned(),
                tags: BTreeSet::new(),
                value: FlushedValue::Counter(1.0),
            })
            .collect();
        let batch = SinkBatch::new(interval(1), metrics);

        let chunks: Vec<_> = batch.chunks(2).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(names(&chunks[0]), ["a", "b"]);
        assert_eq!(names(&chunks[2]), ["e"]);

        let nested: Vec<_> = chunks[1].chunks(1).collect();
        assert_eq!(names(&nested[0]), ["c"]);
        assert_eq!(names(&nested[1]), ["d"]);

        assert_eq!(batch.chunks(0).count(), 1);
        assert_eq!(batch.chunks(100).next().map(|c| c.len()), Some(5));

        let empty = SinkBatch::new(interval(1), Vec::new());
        assert_eq!(empty.chunks(0).count(), 0);
        assert_eq!(empty.chunks(3).count(), 0);
    }

    #[test]
    fn test_serialize_batch() {
        let mut shard = Shard::new(0, 0.01);
        shard.ingest(counter("requests", 2.0).with_tag("route:index"));
        shard.ingest(Metric::new(
            "temperature",
            MetricValue::Gauge(21.5),
            UnixTimestamp::from_secs(1_700_000_005),
        ));
        shard.ingest(Metric::new(
            "users",
            MetricValue::Set("alice".to_owned()),
            UnixTimestamp::from_secs(1_700_000_005),
        ));
        shard.ingest(Metric::new(
            "latency",
            MetricValue::Timer(8.0),
            UnixTimestamp::from_secs(1_700_000_005),
        ));

        let batch = SinkBatch::collect(interval(1), vec![shard.rotate(interval(1))], &[0.5]);

        assert_json_snapshot!(batch, @r#"
        {
          "interval": {
            "generation": 1,
            "start": 1700000000,
            "end": 1700000010
          },
          "metrics": [
            {
              "name": "latency",
              "type": "timer",
              "value": {
                "count": 1.0,
                "sum": 8.0,
                "min": 8.0,
                "max": 8.0,
                "percentiles": [
                  {
                    "quantile": 0.5,
                    "value": 8.0
                  }
                ]
              }
            },
            {
              "name": "requests",
              "tags": [
                "route:index"
              ],
              "type": "counter",
              "value": 2.0
            },
            {
              "name": "temperature",
              "type": "gauge",
              "value": 21.5
            },
            {
              "name": "users",
              "type": "set",
              "value": 1
            }
          ]
        }
        "#);
    }
}
