//! Exponential backoff with jitter for retriable broker calls.

use std::time::Duration;

use rand::Rng;

/// Retry schedule applied to broker placement. All attempts reuse the same
/// `client_order_id`, so a retry can never duplicate a broker order.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), jittered.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay.as_millis() as f64);
        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stay_clamped() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::default();
        for attempt in 0..4 {
            let nominal = policy.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
            let nominal = nominal.min(policy.max_delay.as_millis() as f64);
            let delay = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!(delay >= nominal * 0.69 && delay <= nominal * 1.31, "{delay}");
        }
    }
}
