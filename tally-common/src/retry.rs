use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;

/// Backoff multiplier (1.5 which is 50% increase per backoff).
const DEFAULT_MULTIPLIER: f64 = 1.5;
/// Randomization factor (0 which is no randomization).
const DEFAULT_RANDOMIZATION: f64 = 0.0;

/// A retry interval generator that increases timeouts with exponential backoff.
#[derive(Debug)]
pub struct RetryBackoff {
    backoff: ExponentialBackoff,
    attempt: usize,
}

impl RetryBackoff {
    /// Creates a new retry backoff starting at `initial_interval` and capped at `max_interval`.
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        let backoff = ExponentialBackoff {
            current_interval: initial_interval,
            initial_interval,
            randomization_factor: DEFAULT_RANDOMIZATION,
            multiplier: DEFAULT_MULTIPLIER,
            max_interval: max_interval.max(initial_interval),
            max_elapsed_time: None,
            ..Default::default()
        };

        RetryBackoff {
            backoff,
            attempt: 0,
        }
    }

    /// Resets this backoff to its initial state.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempt = 0;
    }

    /// Indicates whether a backoff attempt has been made.
    pub fn started(&self) -> bool {
        self.attempt > 0
    }

    /// Returns the number of the retry attempt.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Returns the next backoff duration.
    ///
    /// The first attempt has no delay. Every following attempt grows the delay by the
    /// multiplier, up to the configured maximum.
    pub fn next_backoff(&mut self) -> Duration {
        let duration = match self.attempt {
            0 => Duration::ZERO,
            _ => self
                .backoff
                .next_backoff()
                .unwrap_or(self.backoff.max_interval),
        };

        self.attempt += 1;
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_until_capped() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_millis(200));
        assert!(!backoff.started());

        assert_eq!(backoff.next_backoff(), Duration::ZERO);
        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(150));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(200));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(200));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_reset() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        backoff.next_backoff();
        backoff.next_backoff();
        assert!(backoff.started());

        backoff.reset();
        assert!(!backoff.started());
        assert_eq!(backoff.next_backoff(), Duration::ZERO);
        assert_eq!(backoff.next_backoff(), Duration::from_millis(10));
    }
}
