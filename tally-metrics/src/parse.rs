//! Parsing of the statsd line protocol.

use std::iter::FusedIterator;

use tally_common::UnixTimestamp;

use crate::protocol::{Metric, MetricValue};

/// An error returned when a statsd line cannot be parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseMetricError {
    /// The line is not valid UTF-8.
    #[error("metric is not valid utf-8")]
    InvalidUtf8,
    /// The name is empty or contains reserved characters.
    #[error("invalid metric name")]
    InvalidName,
    /// The line has no value or no type.
    #[error("missing metric value or type")]
    Incomplete,
    /// The type is not one of `c`, `g`, `h`, `d`, `ms` or `s`.
    #[error("unknown metric type")]
    InvalidType,
    /// The value is not a finite number.
    #[error("invalid metric value")]
    InvalidValue,
    /// The sample rate is not a number.
    #[error("invalid sample rate")]
    InvalidSampleRate,
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ':' | '|' | '@' | '#'))
}

fn parse_number(string: &str) -> Result<f64, ParseMetricError> {
    string
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or(ParseMetricError::InvalidValue)
}

fn parse_value(string: &str, ty: &str) -> Result<MetricValue, ParseMetricError> {
    Ok(match ty {
        "c" => MetricValue::Counter(parse_number(string)?),
        "g" => MetricValue::Gauge(parse_number(string)?),
        "h" | "d" => MetricValue::Histogram(parse_number(string)?),
        "ms" => MetricValue::Timer(parse_number(string)?),
        "s" if !string.is_empty() => MetricValue::Set(string.to_owned()),
        "s" => return Err(ParseMetricError::InvalidValue),
        _ => return Err(ParseMetricError::InvalidType),
    })
}

impl Metric {
    /// Parses a single statsd line.
    ///
    /// ```text
    /// <name>:<value>|<type>[|@<sample_rate>][|#<tag>,<tag>]
    /// ```
    ///
    /// Tags are kept verbatim, so `key:value` tags and plain tags are both supported. Empty tags
    /// are skipped. Unknown trailing sections are ignored.
    fn parse_str(string: &str, timestamp: UnixTimestamp) -> Result<Self, ParseMetricError> {
        let mut components = string.split('|');

        let (name, value) = components
            .next()
            .and_then(|head| head.rsplit_once(':'))
            .ok_or(ParseMetricError::Incomplete)?;
        let ty = components.next().ok_or(ParseMetricError::Incomplete)?;

        if !is_valid_name(name) {
            return Err(ParseMetricError::InvalidName);
        }

        let mut metric = Metric::new(name, parse_value(value, ty)?, timestamp);

        for component in components {
            if let Some(rate) = component.strip_prefix('@') {
                // Out of range rates are accepted here and neutralized during aggregation.
                metric.sample_rate = rate
                    .parse()
                    .map_err(|_| ParseMetricError::InvalidSampleRate)?;
            } else if let Some(tags) = component.strip_prefix('#') {
                metric.tags.extend(
                    tags.split(',')
                        .filter(|tag| !tag.is_empty())
                        .map(str::to_owned),
                );
            }
        }

        Ok(metric)
    }

    /// Parses a single metric from the statsd line protocol.
    ///
    /// `timestamp` is the receive time recorded on the metric.
    ///
    /// # Example
    ///
    /// ```
    /// use tally_common::UnixTimestamp;
    /// use tally_metrics::Metric;
    ///
    /// let metric = Metric::parse(b"response_time:57|ms|#route:index", UnixTimestamp::now())
    ///     .expect("metric should parse");
    /// ```
    pub fn parse(slice: &[u8], timestamp: UnixTimestamp) -> Result<Self, ParseMetricError> {
        let string = std::str::from_utf8(slice).map_err(|_| ParseMetricError::InvalidUtf8)?;
        Self::parse_str(string, timestamp)
    }

    /// Parses all metrics of a statsd payload.
    ///
    /// Returns a result for each line in `slice`, ignoring empty lines. Both UNIX newlines (`\n`)
    /// and Windows newlines (`\r\n`) are supported. The iterator can be consumed further after it
    /// yielded an error.
    ///
    /// # Example
    ///
    /// ```
    /// use tally_common::UnixTimestamp;
    /// use tally_metrics::Metric;
    ///
    /// let data = b"endpoint.response_time:57|ms\nendpoint.hits:1|c|@0.5\n";
    ///
    /// for result in Metric::parse_all(data, UnixTimestamp::now()) {
    ///     let metric = result.expect("metric should parse");
    ///     println!("Metric {}: {:?}", metric.name, metric.value);
    /// }
    /// ```
    pub fn parse_all(slice: &[u8], timestamp: UnixTimestamp) -> ParseMetrics<'_> {
        ParseMetrics { slice, timestamp }
    }
}

/// Iterator over parsed metrics returned from [`Metric::parse_all`].
#[derive(Clone, Debug)]
pub struct ParseMetrics<'a> {
    slice: &'a [u8],
    timestamp: UnixTimestamp,
}

impl Iterator for ParseMetrics<'_> {
    type Item = Result<Metric, ParseMetricError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.slice.is_empty() {
                return None;
            }

            let mut split = self.slice.splitn(2, |&b| b == b'\n');
            let current = split.next()?;
            self.slice = split.next().unwrap_or_default();

            let string = match std::str::from_utf8(current) {
                Ok(string) => string.strip_suffix('\r').unwrap_or(string),
                Err(_) => return Some(Err(ParseMetricError::InvalidUtf8)),
            };

            if !string.is_empty() {
                return Some(Metric::parse_str(string, self.timestamp));
            }
        }
    }
}

impl FusedIterator for ParseMetrics<'_> {}
