//! Reconnect policies for socket channels.

use std::time::Duration;

use rand::Rng;

/// How a channel reattempts a lost connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Single attempt; failure marks the channel `Failed`.
    None,

    /// Reattempt on a fixed interval.
    Fixed {
        /// Delay between attempts.
        interval: Duration,
        /// Maximum attempts; `0` means unlimited.
        max_attempts: u32,
    },

    /// Reattempt with exponential backoff and jitter.
    ///
    /// Delay before attempt `n` is
    /// `min(initial · multiplier^(n-1), max)` scaled by a uniform factor
    /// in `[1 - jitter, 1 + jitter]`.
    ExponentialBackoff {
        /// First delay.
        initial: Duration,
        /// Ceiling on the delay.
        max: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
        /// Jitter fraction in `[0, 1]`.
        jitter: f64,
        /// Maximum attempts; `0` means unlimited.
        max_attempts: u32,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay to sleep before reconnect attempt `attempt`
    /// (1-based), or `None` when the policy is exhausted.
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,

            Self::Fixed {
                interval,
                max_attempts,
            } => {
                if *max_attempts != 0 && attempt > *max_attempts {
                    None
                } else {
                    Some(*interval)
                }
            }

            Self::ExponentialBackoff {
                initial,
                max,
                multiplier,
                jitter,
                max_attempts,
            } => {
                if *max_attempts != 0 && attempt > *max_attempts {
                    return None;
                }
                let exponent = attempt.saturating_sub(1).min(63);
                let raw = initial.as_secs_f64() * multiplier.powi(exponent as i32);
                let capped = raw.min(max.as_secs_f64());
                let factor = if *jitter > 0.0 {
                    rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
                } else {
                    1.0
                };
                Some(Duration::from_secs_f64((capped * factor).max(0.0)))
            }
        }
    }

    /// Maximum attempts allowed, `None` when unlimited.
    #[must_use]
    pub fn attempt_limit(&self) -> Option<u32> {
        match self {
            Self::None => Some(1),
            Self::Fixed { max_attempts, .. } | Self::ExponentialBackoff { max_attempts, .. } => {
                if *max_attempts == 0 {
                    None
                } else {
                    Some(*max_attempts)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_retries() {
        let policy = ReconnectPolicy::None;
        assert_eq!(policy.delay_before(1), None);
        assert_eq!(policy.attempt_limit(), Some(1));
    }

    #[test]
    fn fixed_respects_attempt_cap() {
        let policy = ReconnectPolicy::Fixed {
            interval: Duration::from_millis(100),
            max_attempts: 3,
        };
        assert_eq!(policy.delay_before(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_before(3), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_before(4), None);
    }

    #[test]
    fn fixed_zero_means_unlimited() {
        let policy = ReconnectPolicy::Fixed {
            interval: Duration::from_millis(50),
            max_attempts: 0,
        };
        assert!(policy.delay_before(10_000).is_some());
        assert_eq!(policy.attempt_limit(), None);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy::ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 0,
        };

        assert_eq!(policy.delay_before(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_before(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_before(3), Some(Duration::from_millis(400)));
        // Capped at max from attempt 5 onwards.
        assert_eq!(policy.delay_before(5), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_before(40), Some(Duration::from_secs(1)));
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let policy = ReconnectPolicy::ExponentialBackoff {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            multiplier: 1.0,
            jitter: 0.25,
            max_attempts: 0,
        };

        for _ in 0..100 {
            let delay = policy.delay_before(1).unwrap();
            assert!(delay >= Duration::from_millis(750), "delay {delay:?} below band");
            assert!(delay <= Duration::from_millis(1250), "delay {delay:?} above band");
        }
    }

    #[test]
    fn backoff_exhausts_after_limit() {
        let policy = ReconnectPolicy::ExponentialBackoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 2,
        };
        assert!(policy.delay_before(2).is_some());
        assert_eq!(policy.delay_before(3), None);
    }
}
