//! Exponential backoff with jitter, external to the pipeline (spec.md §7
//! "Retry (external)"): the core only classifies errors; this module
//! consumes that classification to compute the next delay.
//!
//! Grounded in the distilled `retry_policy.ExponentialBackOffWithJitter`.
//! Two source bugs are called out in spec.md §9 and fixed here rather than
//! reproduced: config merging uses explicit "provided-or-default", not
//! bitwise-or, and the random factor uses `1 + jitter_up` as the comment in
//! the original intended, not `initial * (1 - jitter_up)`.

use std::time::Duration;

/// Parameters for [`next_delay`]. `immediate_first_retry` makes the very
/// first non-throttled retry (`n == 0`) fire with no delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub initial_throttled: Duration,
    pub min: Duration,
    pub min_throttled: Duration,
    pub max: Duration,
    pub max_throttled: Duration,
    pub jitter_up: f64,
    pub jitter_down: f64,
    pub immediate_first_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial: Duration::from_millis(100),
            initial_throttled: Duration::from_secs(5),
            min: Duration::from_millis(100),
            min_throttled: Duration::from_secs(10),
            max: Duration::from_secs(10),
            max_throttled: Duration::from_secs(60),
            jitter_up: 0.25,
            jitter_down: 0.5,
            immediate_first_retry: true,
        }
    }
}

impl RetryPolicy {
    /// Merge user-provided overrides onto the defaults. Each field is taken
    /// from `overrides` when present, otherwise from `self`/defaults — an
    /// explicit "provided-or-default" merge, per spec.md §9's correction of
    /// the source's bitwise-or bug.
    pub fn merged_with(self, overrides: RetryPolicyOverrides) -> RetryPolicy {
        RetryPolicy {
            initial: overrides.initial.unwrap_or(self.initial),
            initial_throttled: overrides.initial_throttled.unwrap_or(self.initial_throttled),
            min: overrides.min.unwrap_or(self.min),
            min_throttled: overrides.min_throttled.unwrap_or(self.min_throttled),
            max: overrides.max.unwrap_or(self.max),
            max_throttled: overrides.max_throttled.unwrap_or(self.max_throttled),
            jitter_up: overrides.jitter_up.unwrap_or(self.jitter_up),
            jitter_down: overrides.jitter_down.unwrap_or(self.jitter_down),
            immediate_first_retry: overrides
                .immediate_first_retry
                .unwrap_or(self.immediate_first_retry),
        }
    }

    /// `next_delay(n, throttled) = min(c_min + (2^(n-1) - 1) * U(c*(1-J_d), c*(1+J_u)), c_max)`.
    ///
    /// `rand_unit` must return a value in `[0, 1)`; callers pass a real RNG,
    /// tests pass a fixed value to make the formula deterministic.
    pub fn next_delay(&self, n: u32, throttled: bool, rand_unit: f64) -> Duration {
        if n == 0 && !throttled && self.immediate_first_retry {
            return Duration::ZERO;
        }

        let (c, c_min, c_max) = if throttled {
            (self.initial_throttled, self.min_throttled, self.max_throttled)
        } else {
            (self.initial, self.min, self.max)
        };

        let c = c.as_secs_f64();
        let c_min = c_min.as_secs_f64();
        let c_max = c_max.as_secs_f64();

        let exponent = if n == 0 { 0 } else { n - 1 };
        let growth = 2f64.powi(exponent as i32) - 1.0;

        let low = c * (1.0 - self.jitter_down);
        let high = c * (1.0 + self.jitter_up);
        let random_term = low + rand_unit.clamp(0.0, 1.0) * (high - low);

        let delay = (c_min + growth * random_term).min(c_max).max(0.0);
        Duration::from_secs_f64(delay)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicyOverrides {
    pub initial: Option<Duration>,
    pub initial_throttled: Option<Duration>,
    pub min: Option<Duration>,
    pub min_throttled: Option<Duration>,
    pub max: Option<Duration>,
    pub max_throttled: Option<Duration>,
    pub jitter_up: Option<f64>,
    pub jitter_down: Option<f64>,
    pub immediate_first_retry: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_first_retry_returns_zero() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(0, false, 0.5), Duration::ZERO);
    }

    #[test]
    fn without_immediate_first_retry_first_attempt_still_waits() {
        let mut policy = RetryPolicy::default();
        policy.immediate_first_retry = false;
        assert!(policy.next_delay(0, false, 0.0) > Duration::ZERO);
    }

    #[test]
    fn delay_never_exceeds_max() {
        let policy = RetryPolicy::default();
        for n in 1..20 {
            let delay = policy.next_delay(n, false, 1.0);
            assert!(delay <= policy.max, "n={n} delay={delay:?}");
        }
    }

    #[test]
    fn throttled_uses_throttled_bounds() {
        let policy = RetryPolicy::default();
        let delay = policy.next_delay(1, true, 0.0);
        assert!(delay >= policy.min_throttled);
        assert!(delay <= policy.max_throttled);
    }

    #[test]
    fn merge_prefers_overrides_then_defaults() {
        let overrides = RetryPolicyOverrides {
            max: Some(Duration::from_secs(20)),
            ..Default::default()
        };
        let merged = RetryPolicy::default().merged_with(overrides);
        assert_eq!(merged.max, Duration::from_secs(20));
        assert_eq!(merged.min, RetryPolicy::default().min);
    }
}
