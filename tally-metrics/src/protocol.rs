use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tally_common::UnixTimestamp;

/// Tag that forces a metric to be aggregated on the receiving agent.
pub const LOCAL_ONLY_TAG: &str = "tally.local_only";

/// Tag that forces a metric through the global ring regardless of its kind.
pub const GLOBAL_ONLY_TAG: &str = "tally.global_only";

/// The type of a [`Metric`], determining its aggregation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Sums up all values within an interval.
    Counter,
    /// Keeps the last value written within an interval.
    Gauge,
    /// Approximates the distribution of values within an interval.
    Histogram,
    /// Like [`Histogram`](Self::Histogram), for durations in milliseconds.
    Timer,
    /// Counts unique values within an interval.
    Set,
}

impl MetricKind {
    /// Returns the name of this kind as used in JSON payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Timer => "timer",
            MetricKind::Set => "set",
        }
    }

    /// Returns the statsd type identifier of this kind.
    pub fn statsd_type(&self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Gauge => "g",
            MetricKind::Histogram => "h",
            MetricKind::Timer => "ms",
            MetricKind::Set => "s",
        }
    }

    /// Returns `true` for kinds whose percentiles are skewed by per-host aggregation.
    pub fn is_percentile(&self) -> bool {
        matches!(self, MetricKind::Histogram | MetricKind::Timer)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single sample value together with its kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MetricValue {
    /// A counter increment.
    Counter(f64),
    /// The new value of a gauge.
    Gauge(f64),
    /// A histogram observation.
    Histogram(f64),
    /// A duration in milliseconds.
    Timer(f64),
    /// A set member. Numeric members keep their textual form.
    Set(String),
}

impl MetricValue {
    /// Returns the kind of this value.
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Histogram(_) => MetricKind::Histogram,
            MetricValue::Timer(_) => MetricKind::Timer,
            MetricValue::Set(_) => MetricKind::Set,
        }
    }
}

fn default_sample_rate() -> f64 {
    1.0
}

/// A single metric sample, as received from an instrumented application.
///
/// Samples are aggregated by their [`MetricKey`], which is the name, the tags and the kind. Two
/// samples that share a name but differ in kind are separate metrics.
///
/// In JSON, the value is flattened into the sample:
///
/// ```json
/// {"name": "requests", "tags": ["route:index"], "type": "counter", "value": 1.0}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// The name of the metric, without its kind.
    pub name: String,
    /// Deduplicated tags, kept in sorted order.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// The kind and value of the sample.
    #[serde(flatten)]
    pub value: MetricValue,
    /// The client side sample rate, expected within `(0, 1]`.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// The time the sample was received.
    pub timestamp: UnixTimestamp,
}

impl Metric {
    /// Creates a sample with a sample rate of `1`.
    pub fn new(name: impl Into<String>, value: MetricValue, timestamp: UnixTimestamp) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
            value,
            sample_rate: 1.0,
            timestamp,
        }
    }

    /// Adds a tag to this sample.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Returns the kind of this sample.
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Returns the aggregation key of this sample.
    pub fn key(&self) -> MetricKey {
        MetricKey {
            name: self.name.clone(),
            tags: self.tags.clone(),
            kind: self.kind(),
        }
    }

    /// Removes scope tags from this sample and returns the resulting scope.
    ///
    /// If both scope tags are present, local scope wins.
    pub fn take_scope(&mut self) -> MetricScope {
        let local = self.tags.remove(LOCAL_ONLY_TAG);
        let global = self.tags.remove(GLOBAL_ONLY_TAG);

        match (local, global) {
            (true, _) => MetricScope::Local,
            (false, true) => MetricScope::Global,
            (false, false) => MetricScope::Mixed,
        }
    }
}

/// Where a metric is aggregated in a global deployment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MetricScope {
    /// Percentile kinds go to their global owner, everything else stays local.
    #[default]
    Mixed,
    /// Always aggregated on the receiving agent.
    Local,
    /// Always aggregated on the global owner.
    Global,
}

impl MetricScope {
    /// Returns `true` if a metric of the given kind in this scope belongs to a global owner.
    pub fn requires_global(self, kind: MetricKind) -> bool {
        match self {
            MetricScope::Mixed => kind.is_percentile(),
            MetricScope::Local => false,
            MetricScope::Global => true,
        }
    }
}

/// The identity of a metric for aggregation: name, sorted tags and kind.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    /// The name of the metric.
    pub name: String,
    /// Sorted, deduplicated tags.
    pub tags: BTreeSet<String>,
    /// The metric kind.
    pub kind: MetricKind,
}

impl MetricKey {
    /// Writes the canonical byte encoding of this key.
    ///
    /// The encoding is independent of the process and platform. It is the name, a zero byte, the
    /// tags separated by commas, a zero byte, and the statsd type of the kind.
    pub fn write_bytes(&self, mut write: impl FnMut(&[u8])) {
        write(self.name.as_bytes());
        write(&[0]);
        for (index, tag) in self.tags.iter().enumerate() {
            if index > 0 {
                write(b",");
            }
            write(tag.as_bytes());
        }
        write(&[0]);
        write(self.kind.statsd_type().as_bytes());
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.name, self.kind.statsd_type())?;
        if !self.tags.is_empty() {
            f.write_str("|#")?;
            for (index, tag) in self.tags.iter().enumerate() {
                if index > 0 {
                    f.write_str(",")?;
                }
                f.write_str(tag)?;
            }
        }
        Ok(())
    }
}
