//! Retry/backoff policy shared by every stage.
//!
//! The job state machine records one attempt per stage invocation on the job
//! record and asks [`RetryPolicy::decide`] what to do with a failure. The
//! counter lives on the record, so a retry loop is always bounded, including
//! across redeliveries.
//!
//! Delay for attempt `n` (1-based, the attempt that just failed):
//!
//! ```text
//! base_delay_ms * 2^(n-1), capped at max_delay_ms, then jittered into [d/2, d]
//! ```

use crate::error::ErrorKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do after a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-invoke the same stage after `delay`.
    Retry { delay: Duration },
    /// Transition the job to `FAILED`.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum invocations of one stage, first attempt included. Default: 3.
    pub max_attempts: u32,
    /// Delay before the first retry. Default: 500 ms.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay. Default: 30 s.
    pub max_delay_ms: u64,
    /// Parse attempts allowed when the model answers with the wrong shape.
    /// Default: 2. Never more than `max_attempts`.
    pub malformed_output_attempts: u32,
    /// Randomise delays so concurrent workers do not retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            malformed_output_attempts: 2,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Decide whether a stage that has now been attempted `attempts` times
    /// may run again after failing with an error of `kind`.
    pub fn decide(&self, kind: ErrorKind, attempts: u32) -> RetryDecision {
        let budget = match kind {
            ErrorKind::Transient => self.max_attempts,
            ErrorKind::Malformed => self.malformed_output_attempts.min(self.max_attempts),
            ErrorKind::Validation | ErrorKind::Permanent | ErrorKind::Cancelled => {
                return RetryDecision::GiveUp
            }
        };
        if attempts >= budget {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempts),
        }
    }

    /// Backoff delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_delay_ms);
        if !self.jitter || capped < 2 {
            return Duration::from_millis(capped);
        }
        let half = capped / 2;
        let jittered = half + rand::thread_rng().gen_range(0..=capped - half);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn transient_retries_until_budget() {
        let p = fixed();
        assert!(matches!(
            p.decide(ErrorKind::Transient, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            p.decide(ErrorKind::Transient, 2),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(p.decide(ErrorKind::Transient, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn validation_and_permanent_never_retry() {
        let p = fixed();
        assert_eq!(p.decide(ErrorKind::Validation, 1), RetryDecision::GiveUp);
        assert_eq!(p.decide(ErrorKind::Permanent, 1), RetryDecision::GiveUp);
        assert_eq!(p.decide(ErrorKind::Cancelled, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn malformed_output_has_its_own_budget() {
        let p = fixed();
        assert!(matches!(
            p.decide(ErrorKind::Malformed, 1),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(p.decide(ErrorKind::Malformed, 2), RetryDecision::GiveUp);
    }

    #[test]
    fn malformed_budget_never_exceeds_max_attempts() {
        let p = RetryPolicy {
            max_attempts: 1,
            malformed_output_attempts: 5,
            ..fixed()
        };
        assert_eq!(p.decide(ErrorKind::Malformed, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let p = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..fixed()
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let p = RetryPolicy {
            base_delay_ms: 400,
            max_delay_ms: 10_000,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let d = p.delay_for(2).as_millis() as u64;
            assert!((400..=800).contains(&d), "got {d}");
        }
    }
}
