//! Bounded-backoff retry scheduling shared by the device link and backend
//! client. Delays are constant per failure class, not exponential.

use std::time::Duration;

/// One policy per retryable operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` means unbounded.
    pub limit: Option<u32>,
}

impl RetryPolicy {
    pub const fn unbounded(delay: Duration) -> Self {
        Self { delay, limit: None }
    }

    pub const fn bounded(delay: Duration, limit: u32) -> Self {
        Self {
            delay,
            limit: Some(limit),
        }
    }

    /// Constant interval regardless of how many attempts failed already.
    pub fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Per-operation counter: reset on any success, incremented on failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
}

impl RetryState {
    pub fn record_failure(&mut self) {
        self.attempt += 1;
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// False once the attempt counter reaches a finite limit. The caller is
    /// responsible for surfacing a terminal error and ceasing the operation.
    pub fn should_retry(&self, policy: &RetryPolicy) -> bool {
        match policy.limit {
            None => true,
            Some(limit) => self.attempt < limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_policy_gives_up_at_the_limit() {
        let policy = RetryPolicy::bounded(Duration::from_millis(500), 8);
        let mut state = RetryState::default();
        for _ in 0..7 {
            state.record_failure();
            assert!(state.should_retry(&policy));
        }
        state.record_failure();
        assert_eq!(state.attempt, 8);
        assert!(!state.should_retry(&policy));
    }

    #[test]
    fn unbounded_policy_always_retries() {
        let policy = RetryPolicy::unbounded(Duration::from_secs(3));
        let mut state = RetryState::default();
        for _ in 0..1000 {
            state.record_failure();
        }
        assert!(state.should_retry(&policy));
    }

    #[test]
    fn delay_is_constant_per_class() {
        let policy = RetryPolicy::bounded(Duration::from_millis(500), 8);
        assert_eq!(policy.next_delay(0), policy.next_delay(7));
    }

    #[test]
    fn success_resets_the_counter() {
        let policy = RetryPolicy::bounded(Duration::from_millis(500), 2);
        let mut state = RetryState::default();
        state.record_failure();
        state.record_failure();
        assert!(!state.should_retry(&policy));
        state.reset();
        assert!(state.should_retry(&policy));
    }
}
