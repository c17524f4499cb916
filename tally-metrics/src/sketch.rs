use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Values with a smaller magnitude than this are counted as zero.
const MIN_INDEXABLE: f64 = 1e-9;

/// A mergeable quantile sketch with a relative error guarantee.
///
/// Values are assigned to logarithmically sized bins. For a relative accuracy `alpha`, every bin
/// spans `(gamma^(i-1), gamma^i]` with `gamma = (1 + alpha) / (1 - alpha)`, so that any quantile
/// estimate is within `alpha` of a value that was actually inserted at that rank.
///
/// Bins of two sketches with the same accuracy line up, so merging is a plain sum of bin weights.
/// This makes merging associative and commutative.
///
/// Every insert carries a weight to account for client side sampling. `count` and `sum` are
/// weighted, `min` and `max` are not.
#[derive(Clone, Debug, PartialEq)]
pub struct LogSketch {
    gamma: f64,
    ln_gamma: f64,
    positive: BTreeMap<i32, f64>,
    negative: BTreeMap<i32, f64>,
    zero: f64,
    count: f64,
    sum: f64,
    min: f64,
    max: f64,
}

impl LogSketch {
    /// Creates an empty sketch with the given relative accuracy.
    ///
    /// The accuracy must be in the open interval `(0, 1)`, which is checked when loading the
    /// aggregator configuration.
    pub fn new(accuracy: f64) -> Self {
        let gamma = (1.0 + accuracy) / (1.0 - accuracy);
        Self {
            gamma,
            ln_gamma: gamma.ln(),
            positive: BTreeMap::new(),
            negative: BTreeMap::new(),
            zero: 0.0,
            count: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Inserts a value with the given weight.
    pub fn insert(&mut self, value: f64, weight: f64) {
        if value.abs() < MIN_INDEXABLE {
            self.zero += weight;
        } else if value > 0.0 {
            *self.positive.entry(self.index(value)).or_default() += weight;
        } else {
            *self.negative.entry(self.index(-value)).or_default() += weight;
        }

        self.count += weight;
        self.sum += value * weight;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Merges another sketch into this one.
    ///
    /// Both sketches must have been created with the same accuracy.
    pub fn merge(&mut self, other: &Self) {
        debug_assert_eq!(self.gamma, other.gamma, "merging sketches of different accuracy");

        for (&index, &weight) in &other.positive {
            *self.positive.entry(index).or_default() += weight;
        }
        for (&index, &weight) in &other.negative {
            *self.negative.entry(index).or_default() += weight;
        }

        self.zero += other.zero;
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Returns the weighted number of inserted values.
    pub fn count(&self) -> f64 {
        self.count
    }

    /// Returns the weighted sum of inserted values.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Returns the smallest inserted value, if any.
    pub fn min(&self) -> Option<f64> {
        self.min.is_finite().then_some(self.min)
    }

    /// Returns the largest inserted value, if any.
    pub fn max(&self) -> Option<f64> {
        self.max.is_finite().then_some(self.max)
    }

    /// Returns `true` if nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.count <= 0.0
    }

    /// Returns the number of occupied bins.
    pub fn bin_count(&self) -> usize {
        self.positive.len() + self.negative.len() + usize::from(self.zero > 0.0)
    }

    /// Estimates the value at quantile `q`, where `q` is in `[0, 1]`.
    ///
    /// Returns `None` for an empty sketch.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        if q <= 0.0 {
            return self.min();
        }
        if q >= 1.0 {
            return self.max();
        }

        let rank = q * self.count;
        let mut seen = 0.0;

        // Ascending order: large negative magnitudes first, then zero, then positive values.
        for (&index, &weight) in self.negative.iter().rev() {
            seen += weight;
            if seen >= rank {
                return Some(self.clamp(-self.bin_value(index)));
            }
        }

        seen += self.zero;
        if self.zero > 0.0 && seen >= rank {
            return Some(self.clamp(0.0));
        }

        for (&index, &weight) in &self.positive {
            seen += weight;
            if seen >= rank {
                return Some(self.clamp(self.bin_value(index)));
            }
        }

        self.max()
    }

    /// Computes the flushed summary with the requested quantiles.
    pub fn summary(&self, quantiles: &[f64]) -> HistogramSummary {
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            min: self.min().unwrap_or_default(),
            max: self.max().unwrap_or_default(),
            percentiles: quantiles
                .iter()
                .map(|&quantile| Percentile {
                    quantile,
                    value: self.quantile(quantile).unwrap_or_default(),
                })
                .collect(),
        }
    }

    fn index(&self, magnitude: f64) -> i32 {
        (magnitude.ln() / self.ln_gamma).ceil() as i32
    }

    fn bin_value(&self, index: i32) -> f64 {
        2.0 * self.gamma.powi(index) / (self.gamma + 1.0)
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// The flushed form of a histogram or timer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Weighted number of samples.
    pub count: f64,
    /// Weighted sum of samples.
    pub sum: f64,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Estimated values at the configured quantiles.
    pub percentiles: Vec<Percentile>,
}

impl HistogramSummary {
    /// Returns the estimate for quantile `q` if it was requested.
    pub fn percentile(&self, q: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|p| p.quantile == q)
            .map(|p| p.value)
    }
}

/// An estimated quantile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    /// The quantile in `(0, 1]`.
    pub quantile: f64,
    /// The estimated value.
    pub value: f64,
}
