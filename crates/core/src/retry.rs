use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::outcome::FailureClass;

/// What the worker should do with a failed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt at the given instant.
    RetryAt(DateTime<Utc>),
    /// Park for manual inspection.
    Suspend,
    /// Retry budget exhausted or unrecoverable; dead-letter.
    DeadLetter,
}

/// Backoff shape and per-class retry budget.
///
/// The delay curve is `min(base * multiplier^(attempt-1), cap)` scaled by a
/// uniform jitter factor in `1 ± jitter`, where `attempt` is the one-based
/// count of failed attempts so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial delay in seconds before the first retry.
    pub base_seconds: u64,
    /// Factor applied on each successive attempt.
    pub multiplier: f64,
    /// Uniform jitter fraction; 0.2 spreads delays across ±20%.
    pub jitter: f64,
    /// Upper bound on the computed delay in seconds.
    pub cap_seconds: u64,
    /// Attempts allowed for `Transient` failures before dead-lettering.
    pub max_transient_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 60,
            multiplier: 2.0,
            jitter: 0.2,
            cap_seconds: 3_600,
            max_transient_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay for the one-based `attempt` number.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::thread_rng().gen_range(-1.0..=1.0))
    }

    /// Deterministic form of [`delay_for`](Self::delay_for): `unit` in
    /// `[-1, 1]` selects the point inside the jitter band. Exposed so tests
    /// can pin the draw.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let attempt = attempt.max(1);
        // attempt is a small retry count; the wrap cannot occur.
        #[allow(clippy::cast_possible_wrap)]
        let raw = self.base_seconds as f64 * self.multiplier.powi(attempt as i32 - 1);
        let capped = raw.min(self.cap_seconds as f64);
        let scaled = capped * (1.0 + self.jitter * unit.clamp(-1.0, 1.0));
        Duration::milliseconds((scaled * 1_000.0) as i64)
    }

    /// Decide the follow-up transition for a failure of `class` after
    /// `attempt_count` failed attempts (already incremented for the failure
    /// being decided). `rate_limit_reset` is the reset instant for
    /// `RateLimit` failures; absent a hint, the base delay applies.
    #[must_use]
    pub fn decide(
        &self,
        class: FailureClass,
        attempt_count: u32,
        now: DateTime<Utc>,
        rate_limit_reset: Option<DateTime<Utc>>,
    ) -> RetryDecision {
        match class {
            FailureClass::Transient => {
                if attempt_count >= self.max_transient_attempts {
                    RetryDecision::DeadLetter
                } else {
                    RetryDecision::RetryAt(now + self.delay_for(attempt_count))
                }
            }
            FailureClass::RateLimit => {
                let at = rate_limit_reset
                    .unwrap_or_else(|| now + Duration::seconds(self.base_seconds.cast_signed()));
                RetryDecision::RetryAt(at)
            }
            FailureClass::Validation => RetryDecision::Suspend,
            FailureClass::Fatal => RetryDecision::DeadLetter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn backoff_curve_without_jitter() {
        let p = policy();
        assert_eq!(p.delay_with_jitter(1, 0.0), Duration::seconds(60));
        assert_eq!(p.delay_with_jitter(2, 0.0), Duration::seconds(120));
        assert_eq!(p.delay_with_jitter(3, 0.0), Duration::seconds(240));
    }

    #[test]
    fn backoff_clamped_to_cap() {
        let p = policy();
        // 60 * 2^9 = 30720s, far past the one-hour cap.
        assert_eq!(p.delay_with_jitter(10, 0.0), Duration::seconds(3_600));
    }

    #[test]
    fn jitter_band_is_plus_minus_twenty_percent() {
        let p = policy();
        assert_eq!(p.delay_with_jitter(1, -1.0), Duration::seconds(48));
        assert_eq!(p.delay_with_jitter(1, 1.0), Duration::seconds(72));
        // Random draws stay inside the band.
        for _ in 0..100 {
            let d = p.delay_for(1);
            assert!(d >= Duration::seconds(48) && d <= Duration::seconds(72));
        }
    }

    #[test]
    fn transient_within_budget_schedules_retry() {
        let now = Utc::now();
        match policy().decide(FailureClass::Transient, 1, now, None) {
            RetryDecision::RetryAt(at) => {
                assert!(at >= now + Duration::seconds(48));
                assert!(at <= now + Duration::seconds(72));
            }
            other => panic!("expected RetryAt, got {other:?}"),
        }
    }

    #[test]
    fn transient_exhaustion_dead_letters() {
        let now = Utc::now();
        assert_eq!(
            policy().decide(FailureClass::Transient, 3, now, None),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn rate_limit_uses_reset_and_keeps_budget() {
        let now = Utc::now();
        let reset = now + Duration::minutes(5);
        assert_eq!(
            policy().decide(FailureClass::RateLimit, 0, now, Some(reset)),
            RetryDecision::RetryAt(reset)
        );
        // Even at a large attempt count, rate limits never dead-letter.
        assert_eq!(
            policy().decide(FailureClass::RateLimit, 99, now, Some(reset)),
            RetryDecision::RetryAt(reset)
        );
    }

    #[test]
    fn validation_suspends_fatal_dead_letters() {
        let now = Utc::now();
        assert_eq!(
            policy().decide(FailureClass::Validation, 0, now, None),
            RetryDecision::Suspend
        );
        assert_eq!(
            policy().decide(FailureClass::Fatal, 0, now, None),
            RetryDecision::DeadLetter
        );
    }
}
