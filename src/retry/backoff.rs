//! Exponential backoff delay strategy.

use std::time::Duration;

use rand::Rng;
use serde_json::json;

use crate::error::Error;
use crate::introspect::{Meta, MetaKind};
use crate::response::Response;
use crate::retry::DelayStrategy;

/// `delay = min(max, initial * multiplier^attempt)`, optionally jittered by a
/// uniform factor in `[0.5, 1.5)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Defaults: `initial = 200 ms`, `multiplier = 2`, `max = 10 s`,
    /// `jitter = true`.
    pub fn new() -> Self {
        Self {
            initial: Duration::from_millis(200),
            multiplier: 2.0,
            max: Duration::from_secs(10),
            jitter: true,
        }
    }

    /// Base delay for the first retry.
    pub fn initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    /// Growth factor per attempt.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Upper bound on a single delay.
    pub fn max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Enables or disables jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn compute(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max.as_millis() as f64);
        let millis = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            capped
        };
        Duration::from_millis(millis.round() as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayStrategy for ExponentialBackoff {
    fn delay(
        &self,
        _response: Option<&Response>,
        _error: Option<&Error>,
        attempt: u32,
    ) -> Option<Duration> {
        Some(self.compute(attempt))
    }

    fn meta(&self) -> Meta {
        Meta::new("exponential-backoff", MetaKind::Strategy)
            .with_option("initial_ms", json!(self.initial.as_millis() as u64))
            .with_option("multiplier", json!(self.multiplier))
            .with_option("max_ms", json!(self.max.as_millis() as u64))
            .with_option("jitter", json!(self.jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let backoff = ExponentialBackoff::new()
            .initial(Duration::from_millis(100))
            .max(Duration::from_millis(350))
            .jitter(false);
        assert_eq!(backoff.compute(0), Duration::from_millis(100));
        assert_eq!(backoff.compute(1), Duration::from_millis(200));
        assert_eq!(backoff.compute(2), Duration::from_millis(350));
        assert_eq!(backoff.compute(9), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let backoff = ExponentialBackoff::new()
            .initial(Duration::from_millis(200))
            .jitter(true);
        for _ in 0..64 {
            let delay = backoff.compute(0).as_millis() as u64;
            assert!((100..300).contains(&delay), "delay {delay} out of range");
        }
    }
}
