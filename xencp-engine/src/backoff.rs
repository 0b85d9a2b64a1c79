//! Exponential backoff shared by session login, transient-call retries,
//! task polling and post-condition re-reads.

use std::time::Duration;

/// Exponential backoff policy.
///
/// The first delay is `initial`, every following delay is the previous one
/// times `multiplier`, never exceeding `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Retry budget for bounded sequences.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, multiplier: f64, max_interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            multiplier,
            max_interval,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.initial.as_millis() as f64 * factor;
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Bounded sequence of `max_attempts` delays.
    pub fn delays(&self) -> Delays {
        Delays {
            policy: self.clone(),
            attempt: 0,
            limit: Some(self.max_attempts),
        }
    }

    /// Unbounded sequence of delays; growth stops at `max_interval`.
    pub fn intervals(&self) -> Delays {
        Delays {
            policy: self.clone(),
            attempt: 0,
            limit: None,
        }
    }
}

impl Default for BackoffPolicy {
    /// 1s initial, doubling, capped at 10s, 5 retries.
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

/// Iterator over backoff delays.
#[derive(Debug, Clone)]
pub struct Delays {
    policy: BackoffPolicy,
    attempt: u32,
    limit: Option<u32>,
}

impl Delays {
    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(limit) = self.limit
            && self.attempt >= limit
        {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(500),
            2.0,
            Duration::from_secs(3),
            6,
        );
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
    }

    #[test]
    fn test_bounded_sequence_exhausts() {
        let policy = BackoffPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let mut delays = policy.delays();
        assert!(delays.next().is_some());
        assert!(delays.next().is_some());
        assert!(delays.next().is_none());
        assert_eq!(delays.attempts(), 2);
    }

    #[test]
    fn test_intervals_unbounded() {
        let policy = BackoffPolicy {
            max_attempts: 1,
            ..Default::default()
        };
        let last = policy.intervals().nth(50);
        assert_eq!(last, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_multiplier_below_one_is_constant() {
        let policy = BackoffPolicy::new(Duration::from_millis(200), 0.5, Duration::from_secs(1), 3);
        assert!(policy.delays().all(|d| d == Duration::from_millis(200)));
    }
}
