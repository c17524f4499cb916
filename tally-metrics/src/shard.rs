use std::mem;

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use tally_statsd::metric;

use crate::aggregation::Aggregate;
use crate::flush::FlushInterval;
use crate::protocol::{Metric, MetricKey};
use crate::statsd::{MetricCounters, MetricGauges};

/// Counters describing the samples a shard received in one generation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ShardStats {
    /// Number of samples applied.
    pub samples: u64,
    /// Number of samples with a sample rate outside of `(0, 1]`.
    pub invalid_sample_rates: u64,
}

/// The aggregation state of one partition of the metric keyspace.
///
/// A shard is owned by exactly one task, which applies samples in arrival order. It holds a
/// single active map for the current generation. [`rotate`](Self::rotate) moves the map out
/// without copying and leaves an empty one behind.
#[derive(Debug)]
pub struct Shard {
    id: usize,
    accuracy: f64,
    generation: u64,
    active: HashMap<MetricKey, Aggregate>,
    stats: ShardStats,
}

impl Shard {
    /// Creates an empty shard.
    ///
    /// `accuracy` is the relative accuracy of histogram and timer sketches.
    pub fn new(id: usize, accuracy: f64) -> Self {
        Self {
            id,
            accuracy,
            generation: 0,
            active: HashMap::new(),
            stats: ShardStats::default(),
        }
    }

    /// Returns the index of this shard in its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the generation that was closed last, or `0` before the first rotation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the number of keys in the active map.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Returns `true` if the active map is empty.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Returns the counters of the active generation.
    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    /// Applies a sample to the active generation.
    ///
    /// A sample rate outside of `(0, 1]`, including NaN, is treated as `1` and counted.
    pub fn ingest(&mut self, metric: Metric) {
        let weight = if metric.sample_rate > 0.0 && metric.sample_rate <= 1.0 {
            1.0 / metric.sample_rate
        } else {
            self.stats.invalid_sample_rates += 1;
            1.0
        };

        self.stats.samples += 1;
        let key = metric.key();

        match self.active.entry(key) {
            Entry::Occupied(mut entry) => {
                let aggregate = entry.get_mut();
                if let Err(value) = aggregate.insert(metric.value, weight, metric.timestamp) {
                    panic!("key {} holds a {} aggregate", entry.key(), value.kind());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Aggregate::new(
                    metric.value,
                    weight,
                    metric.timestamp,
                    self.accuracy,
                ));
            }
        }
    }

    /// Closes the active generation and starts a new, empty one.
    ///
    /// # Panics
    ///
    /// Panics if the generation of `interval` does not exceed the last closed generation.
    pub fn rotate(&mut self, interval: FlushInterval) -> ClosedShard {
        assert!(
            interval.generation > self.generation,
            "shard {} rotated to generation {} after generation {}",
            self.id,
            interval.generation,
            self.generation,
        );

        self.generation = interval.generation;
        let aggregates = mem::take(&mut self.active);
        let stats = mem::take(&mut self.stats);

        let shard = self.id.to_string();
        metric!(
            gauge(MetricGauges::ShardKeys) = aggregates.len() as u64,
            shard = &shard
        );
        metric!(
            counter(MetricCounters::SamplesIngested) += stats.samples as i64,
            shard = &shard
        );
        metric!(
            counter(MetricCounters::InvalidSampleRate) += stats.invalid_sample_rates as i64,
            shard = &shard
        );

        ClosedShard {
            shard_id: self.id,
            interval,
            aggregates,
            stats,
        }
    }

    /// Merges a closed map back into the active generation as older state.
    ///
    /// This is used when a closed map could not be delivered. Counters add up, set members are
    /// joined, sketches merge, and gauges keep whichever write is newer, preferring the active
    /// value on ties.
    pub fn restore(&mut self, closed: ClosedShard) {
        for (key, older) in closed.aggregates {
            match self.active.entry(key) {
                Entry::Occupied(mut entry) => {
                    let newer = mem::replace(entry.get_mut(), older);
                    if entry.get_mut().merge(newer).is_err() {
                        panic!("key {} restored with a mismatching aggregate", entry.key());
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(older);
                }
            }
        }

        self.stats.samples += closed.stats.samples;
        self.stats.invalid_sample_rates += closed.stats.invalid_sample_rates;

        metric!(
            counter(MetricCounters::StragglerRestored) += 1,
            shard = &self.id.to_string()
        );
    }
}

/// The immutable aggregation state of a closed generation of one shard.
#[derive(Debug)]
pub struct ClosedShard {
    /// The shard that produced this state.
    pub shard_id: usize,
    /// The generation that was closed.
    pub interval: FlushInterval,
    aggregates: HashMap<MetricKey, Aggregate>,
    stats: ShardStats,
}

impl ClosedShard {
    /// Returns the number of keys.
    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    /// Returns `true` if no samples were received in this generation.
    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    /// Returns the counters of the closed generation.
    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    /// Returns the aggregate of a key.
    pub fn get(&self, key: &MetricKey) -> Option<&Aggregate> {
        self.aggregates.get(key)
    }

    /// Consumes the closed state into its keys and aggregates, in no particular order.
    pub fn into_aggregates(self) -> impl Iterator<Item = (MetricKey, Aggregate)> {
        self.aggregates.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tally_common::UnixTimestamp;

    use super::*;
    use crate::flush::FlushedValue;
    use crate::protocol::MetricValue;

    fn interval(generation: u64) -> FlushInterval {
        FlushInterval {
            generation,
            start: UnixTimestamp::from_secs(generation * 10),
            end: UnixTimestamp::from_secs(generation * 10 + 10),
        }
    }

    fn sample(name: &str, value: MetricValue, secs: u64) -> Metric {
        Metric::new(name, value, UnixTimestamp::from_secs(secs))
    }

    fn flushed(closed: &ClosedShard, metric: &Metric) -> FlushedValue {
        closed.get(&metric.key()).unwrap().flush(&[0.5])
    }

    #[test]
    fn test_counter_correctness() {
        let mut shard = Shard::new(0, 0.01);
        for value in [5.0, 3.0, 2.0] {
            shard.ingest(sample("requests", MetricValue::Counter(value), 1));
        }

        let closed = shard.rotate(interval(1));
        let probe = sample("requests", MetricValue::Counter(0.0), 1);
        assert_eq!(flushed(&closed, &probe), FlushedValue::Counter(10.0));
        assert_eq!(closed.len(), 1);
    }

    #[test]
    fn test_sample_rate_scaling() {
        let mut shard = Shard::new(0, 0.01);
        let mut metric = sample("requests", MetricValue::Counter(1.0), 1);
        metric.sample_rate = 0.1;
        shard.ingest(metric.clone());

        let closed = shard.rotate(interval(1));
        let FlushedValue::Counter(sum) = flushed(&closed, &metric) else {
            panic!("expected a counter");
        };
        assert!((sum - 10.0).abs() < 1e-9);
        assert_eq!(closed.stats().invalid_sample_rates, 0);
    }

    #[test]
    fn test_invalid_sample_rate() {
        let mut shard = Shard::new(0, 0.01);
        for rate in [0.0, -1.0, 2.0, f64::NAN] {
            let mut metric = sample("requests", MetricValue::Counter(1.0), 1);
            metric.sample_rate = rate;
            shard.ingest(metric);
        }

        let closed = shard.rotate(interval(1));
        let probe = sample("requests", MetricValue::Counter(0.0), 1);
        assert_eq!(flushed(&closed, &probe), FlushedValue::Counter(4.0));
        assert_eq!(
            closed.stats(),
            ShardStats {
                samples: 4,
                invalid_sample_rates: 4,
            }
        );
    }

    #[test]
    fn test_gauge_last_write_wins() {
        let mut shard = Shard::new(0, 0.01);
        for value in [1.0, 7.0, 3.0] {
            shard.ingest(sample("temperature", MetricValue::Gauge(value), 1));
        }

        let closed = shard.rotate(interval(1));
        let probe = sample("temperature", MetricValue::Gauge(0.0), 1);
        assert_eq!(flushed(&closed, &probe), FlushedValue::Gauge(3.0));
    }

    #[test]
    fn test_set_cardinality() {
        let mut shard = Shard::new(0, 0.01);
        for member in ["a", "a", "b"] {
            shard.ingest(sample("users", MetricValue::Set(member.to_owned()), 1));
        }

        let closed = shard.rotate(interval(1));
        let probe = sample("users", MetricValue::Set(String::new()), 1);
        assert_eq!(flushed(&closed, &probe), FlushedValue::Set(2));
    }

    #[test]
    fn test_no_cross_generation_leakage() {
        let mut shard = Shard::new(0, 0.01);
        let probe = sample("requests", MetricValue::Counter(1.0), 1);
        shard.ingest(probe.clone());

        let closed = shard.rotate(interval(1));
        assert!(shard.is_empty());

        shard.ingest(probe.clone());
        shard.ingest(probe.clone());

        assert_eq!(flushed(&closed, &probe), FlushedValue::Counter(1.0));
        let next = shard.rotate(interval(2));
        assert_eq!(flushed(&next, &probe), FlushedValue::Counter(2.0));
    }

    #[test]
    #[should_panic(expected = "rotated to generation 1 after generation 1")]
    fn test_rotate_non_increasing_generation() {
        let mut shard = Shard::new(3, 0.01);
        shard.rotate(interval(1));
        shard.rotate(interval(1));
    }

    #[test]
    fn test_restore_merges_older_state() {
        let mut shard = Shard::new(0, 0.01);
        shard.ingest(sample("requests", MetricValue::Counter(2.0), 1));
        shard.ingest(sample("temperature", MetricValue::Gauge(5.0), 8));
        shard.ingest(sample("users", MetricValue::Set("a".to_owned()), 1));
        shard.ingest(sample("stale", MetricValue::Gauge(1.0), 9));

        let closed = shard.rotate(interval(1));

        shard.ingest(sample("requests", MetricValue::Counter(3.0), 12));
        shard.ingest(sample("temperature", MetricValue::Gauge(6.0), 12));
        shard.ingest(sample("users", MetricValue::Set("b".to_owned()), 12));

        shard.restore(closed);
        assert_eq!(shard.stats().samples, 7);

        let next = shard.rotate(interval(2));
        let get = |name: &str, value: MetricValue| flushed(&next, &sample(name, value, 0));

        assert_eq!(
            get("requests", MetricValue::Counter(0.0)),
            FlushedValue::Counter(5.0)
        );
        assert_eq!(
            get("temperature", MetricValue::Gauge(0.0)),
            FlushedValue::Gauge(6.0)
        );
        assert_eq!(
            get("users", MetricValue::Set(String::new())),
            FlushedValue::Set(2)
        );
        assert_eq!(
            get("stale", MetricValue::Gauge(0.0)),
            FlushedValue::Gauge(1.0)
        );
    }

    #[test]
    fn test_restore_gauge_tie_keeps_active() {
        let mut shard = Shard::new(0, 0.01);
        shard.ingest(sample("temperature", MetricValue::Gauge(1.0), 10));
        let closed = shard.rotate(interval(1));

        shard.ingest(sample("temperature", MetricValue::Gauge(2.0), 10));
        shard.restore(closed);

        let next = shard.rotate(interval(2));
        let probe = sample("temperature", MetricValue::Gauge(0.0), 0);
        assert_eq!(flushed(&next, &probe), FlushedValue::Gauge(2.0));
    }

    #[test]
    fn test_rotate_emits_stats() {
        let captures = tally_statsd::with_capturing_test_client(|| {
            let mut shard = Shard::new(2, 0.01);
            shard.ingest(sample("requests", MetricValue::Counter(1.0), 1));
            shard.rotate(interval(1));
        });

        assert_eq!(
            captures,
            [
                "metrics.shard.keys:1|g|#shard:2",
                "metrics.shard.samples:1|c|#shard:2",
            ]
        );
    }
}
