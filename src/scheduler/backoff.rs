//! Exponential backoff with jitter.
//!
//! `delay = initialDelay * backoffFactor^retryCount`, clamped to
//! `maxDelay`, with uniform jitter of `+-jitter * delay / 2` applied on
//! top. This differs from a plain power-of-two doubling scheme by
//! taking a configurable factor and an explicit jitter fraction rather
//! than a fixed shift.

use crate::config::UploaderConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(retry_count as i32);
        let clamped = base.min(self.max_delay.as_millis() as f64);
        let jittered = apply_jitter(clamped, self.jitter);
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

impl From<&UploaderConfig> for BackoffPolicy {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            initial_delay: config.retry_delay,
            backoff_factor: config.backoff_factor,
            max_delay: config.max_retry_delay,
            jitter: config.jitter,
        }
    }
}

fn apply_jitter(value: f64, jitter: f64) -> f64 {
    if jitter <= 0.0 {
        return value;
    }
    let spread = jitter * value / 2.0;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    value + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_before_clamp() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn clamps_to_max_delay() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 3.0,
            max_delay: Duration::from_millis(2000),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(10), Duration::from_millis(2000));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        };
        for _ in 0..50 {
            let d = policy.delay_for(0).as_millis() as f64;
            assert!(d >= 900.0 && d <= 1100.0, "delay {} out of jitter bound", d);
        }
    }
}
