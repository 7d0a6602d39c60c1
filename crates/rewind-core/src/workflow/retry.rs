//! Retry state machine for step attempts.
//!
//! One `RetryTracker` lives for the duration of a step run. It moves
//! `Idle -> Running -> BackingOff -> Running ... -> Succeeded | Exhausted`
//! and hands out the bounded backoff delay computed by the step's
//! `RetryPolicy`.

use std::time::Duration;

use rewind_types::workflow::RetryPolicy;

// ---------------------------------------------------------------------------
// RetryState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// No attempt has started yet.
    Idle,
    /// Attempt `attempt` (1-based) is in flight.
    Running { attempt: u32 },
    /// Attempt `attempt` failed; waiting `delay` before the next one.
    BackingOff { attempt: u32, delay: Duration },
    /// An attempt succeeded.
    Succeeded { attempts: u32 },
    /// No attempts remain, or the failure was not retryable.
    Exhausted { attempts: u32 },
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    state: RetryState,
}

impl RetryTracker {
    /// A tracker for a step; no policy means a single attempt.
    pub fn new(policy: Option<&RetryPolicy>) -> Self {
        Self {
            policy: policy.cloned().unwrap_or_default(),
            state: RetryState::Idle,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        match self.state {
            RetryState::Idle => 0,
            RetryState::Running { attempt } | RetryState::BackingOff { attempt, .. } => attempt,
            RetryState::Succeeded { attempts } | RetryState::Exhausted { attempts } => attempts,
        }
    }

    /// Start the next attempt and return its 1-based number.
    ///
    /// Only valid from `Idle` or `BackingOff`; elsewhere the state is left
    /// unchanged and the current attempt number is returned.
    pub fn begin_attempt(&mut self) -> u32 {
        let next = match self.state {
            RetryState::Idle => 1,
            RetryState::BackingOff { attempt, .. } => attempt + 1,
            _ => {
                debug_assert!(false, "begin_attempt from {:?}", self.state);
                return self.attempts();
            }
        };
        self.state = RetryState::Running { attempt: next };
        next
    }

    pub fn record_success(&mut self) {
        self.state = RetryState::Succeeded {
            attempts: self.attempts(),
        };
    }

    /// Record a failed attempt and decide whether another one follows.
    pub fn record_failure(&mut self, retryable: bool) -> RetryDecision {
        let attempt = self.attempts();
        if retryable && attempt < self.policy.max_attempts() {
            let delay = self.policy.delay_for(attempt);
            self.state = RetryState::BackingOff { attempt, delay };
            RetryDecision::Retry { delay }
        } else {
            self.state = RetryState::Exhausted { attempts: attempt };
            RetryDecision::GiveUp
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_types::workflow::{BackoffPolicy, BackoffShape};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            BackoffPolicy {
                shape: BackoffShape::Linear,
                initial_delay_ms: 10,
                max_delay_ms: 100,
                multiplier: 2.0,
            },
        )
    }

    #[test]
    fn test_no_policy_means_single_attempt() {
        let mut tracker = RetryTracker::new(None);
        assert_eq!(tracker.begin_attempt(), 1);
        assert_eq!(tracker.record_failure(true), RetryDecision::GiveUp);
        assert_eq!(tracker.state(), RetryState::Exhausted { attempts: 1 });
    }

    #[test]
    fn test_two_retries_allow_three_attempts() {
        let policy = policy(2);
        let mut tracker = RetryTracker::new(Some(&policy));

        assert_eq!(tracker.begin_attempt(), 1);
        assert_eq!(
            tracker.record_failure(true),
            RetryDecision::Retry { delay: Duration::from_millis(10) }
        );
        assert!(matches!(tracker.state(), RetryState::BackingOff { attempt: 1, .. }));

        assert_eq!(tracker.begin_attempt(), 2);
        assert_eq!(
            tracker.record_failure(true),
            RetryDecision::Retry { delay: Duration::from_millis(20) }
        );

        assert_eq!(tracker.begin_attempt(), 3);
        assert_eq!(tracker.record_failure(true), RetryDecision::GiveUp);
        assert_eq!(tracker.attempts(), 3);
    }

    #[test]
    fn test_success_after_retry() {
        let policy = policy(2);
        let mut tracker = RetryTracker::new(Some(&policy));
        tracker.begin_attempt();
        tracker.record_failure(true);
        tracker.begin_attempt();
        tracker.record_success();
        assert_eq!(tracker.state(), RetryState::Succeeded { attempts: 2 });
    }

    #[test]
    fn test_non_retryable_failure_gives_up_immediately() {
        let policy = policy(5);
        let mut tracker = RetryTracker::new(Some(&policy));
        tracker.begin_attempt();
        assert_eq!(tracker.record_failure(false), RetryDecision::GiveUp);
        assert_eq!(tracker.state(), RetryState::Exhausted { attempts: 1 });
    }
}
