//! Backoff policy for retryable provider errors.

use std::time::Duration;

use rand::Rng;

use crate::error::LlmError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` to give up.
    pub fn backoff(&self, attempt: u32, error: &LlmError) -> Option<Duration> {
        if attempt > self.max_retries || !error.is_retryable() {
            return None;
        }
        if let LlmError::RateLimited {
            retry_after: Some(after),
            ..
        } = error
        {
            return Some((*after).min(self.max_delay));
        }
        let exp = self
            .base_delay
            .saturating_mul(1 << (attempt - 1).min(16))
            .min(self.max_delay);
        // Up to 25% jitter so concurrent jobs don't retry in lockstep.
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 4);
        Some(exp + Duration::from_millis(jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> LlmError {
        LlmError::RequestFailed {
            provider: "p".into(),
            reason: "reset".into(),
        }
    }

    #[test]
    fn gives_up_after_max_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff(1, &transient()).is_some());
        assert!(policy.backoff(2, &transient()).is_some());
        assert!(policy.backoff(3, &transient()).is_none());
    }

    #[test]
    fn never_retries_fatal_errors() {
        let policy = RetryPolicy::default();
        let err = LlmError::AuthFailed {
            provider: "p".into(),
        };
        assert!(policy.backoff(1, &err).is_none());
        assert!(RetryPolicy::none().backoff(1, &transient()).is_none());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };
        let first = policy.backoff(1, &transient()).unwrap();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let late = policy.backoff(8, &transient()).unwrap();
        assert!(late <= Duration::from_millis(500));
    }

    #[test]
    fn honors_retry_after() {
        let policy = RetryPolicy::default();
        let err = LlmError::RateLimited {
            provider: "p".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(policy.backoff(1, &err), Some(Duration::from_secs(3)));
    }
}
