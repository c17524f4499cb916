use hashbrown::HashSet;
use tally_common::UnixTimestamp;

use crate::flush::FlushedValue;
use crate::protocol::{MetricKind, MetricValue};
use crate::sketch::LogSketch;

/// The last value written to a gauge.
#[derive(Clone, Debug, PartialEq)]
pub struct GaugeValue {
    /// The most recent value.
    pub value: f64,
    /// When the most recent value was received.
    pub updated: UnixTimestamp,
}

/// The aggregation state of one metric key within one flush interval.
///
/// An aggregate is created lazily by the first sample of a key and folds every following sample
/// in place. Aggregates of the same kind can be merged, which is associative and commutative for
/// all kinds except gauges, where the more recent write wins.
#[derive(Clone, Debug, PartialEq)]
pub enum Aggregate {
    /// Running sum of scaled counter increments.
    Counter(f64),
    /// Last written gauge value.
    Gauge(GaugeValue),
    /// Distinct set members.
    Set(HashSet<String>),
    /// Sketch of histogram observations.
    Histogram(LogSketch),
    /// Sketch of timer observations.
    Timer(LogSketch),
}

impl Aggregate {
    /// Creates an aggregate from a first sample.
    ///
    /// `weight` is the inverse of the sample rate, and `accuracy` the relative accuracy of
    /// histogram and timer sketches.
    pub fn new(value: MetricValue, weight: f64, timestamp: UnixTimestamp, accuracy: f64) -> Self {
        match value {
            MetricValue::Counter(value) => Self::Counter(value * weight),
            MetricValue::Gauge(value) => Self::Gauge(GaugeValue {
                value,
                updated: timestamp,
            }),
            MetricValue::Set(member) => Self::Set(HashSet::from_iter([member])),
            MetricValue::Histogram(value) => {
                let mut sketch = LogSketch::new(accuracy);
                sketch.insert(value, weight);
                Self::Histogram(sketch)
            }
            MetricValue::Timer(value) => {
                let mut sketch = LogSketch::new(accuracy);
                sketch.insert(value, weight);
                Self::Timer(sketch)
            }
        }
    }

    /// Returns the kind of metric this aggregate holds.
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Set(_) => MetricKind::Set,
            Self::Histogram(_) => MetricKind::Histogram,
            Self::Timer(_) => MetricKind::Timer,
        }
    }

    /// Applies a sample to this aggregate.
    ///
    /// Gauges always take the inserted value, since samples within a shard are applied in arrival
    /// order. Returns the value back if its kind does not match.
    pub fn insert(
        &mut self,
        value: MetricValue,
        weight: f64,
        timestamp: UnixTimestamp,
    ) -> Result<(), MetricValue> {
        match (self, value) {
            (Self::Counter(sum), MetricValue::Counter(value)) => *sum += value * weight,
            (Self::Gauge(gauge), MetricValue::Gauge(value)) => {
                *gauge = GaugeValue {
                    value,
                    updated: timestamp,
                }
            }
            (Self::Set(set), MetricValue::Set(member)) => {
                set.insert(member);
            }
            (Self::Histogram(sketch), MetricValue::Histogram(value)) => {
                sketch.insert(value, weight)
            }
            (Self::Timer(sketch), MetricValue::Timer(value)) => sketch.insert(value, weight),
            (_, value) => return Err(value),
        }

        Ok(())
    }

    /// Merges another aggregate of the same kind into this one.
    ///
    /// For gauges, the value with the newer timestamp wins, and `other` wins ties. Returns `other`
    /// back if its kind does not match.
    pub fn merge(&mut self, other: Self) -> Result<(), Self> {
        match (self, other) {
            (Self::Counter(sum), Self::Counter(other)) => *sum += other,
            (Self::Gauge(gauge), Self::Gauge(other)) => {
                if other.updated >= gauge.updated {
                    *gauge = other;
                }
            }
            (Self::Set(set), Self::Set(other)) => set.extend(other),
            (Self::Histogram(sketch), Self::Histogram(other)) => sketch.merge(&other),
            (Self::Timer(sketch), Self::Timer(other)) => sketch.merge(&other),
            (_, other) => return Err(other),
        }

        Ok(())
    }

    /// Converts the aggregate into its flushed form.
    pub fn flush(&self, percentiles: &[f64]) -> FlushedValue {
        match self {
            Self::Counter(sum) => FlushedValue::Counter(*sum),
            Self::Gauge(gauge) => FlushedValue::Gauge(gauge.value),
            Self::Set(set) => FlushedValue::Set(set.len() as u64),
            Self::Histogram(sketch) => FlushedValue::Histogram(sketch.summary(percentiles)),
            Self::Timer(sketch) => FlushedValue::Timer(sketch.summary(percentiles)),
        }
    }
}
