//! Retry loop for transient failures
//!
//! Only the retryable codes (network, timeout, connection loss, file I/O)
//! are re-attempted; everything else surfaces immediately. Sleeps between
//! attempts are plain wall-clock waits, uninterruptible by design.

use std::time::Duration;

use tracing::warn;

use crate::status::{Error, ErrorCode, Result};

/// Bounds for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-attempts after the initial try.
    pub max_retries: u32,
    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            interval: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }
}

/// Where a retry context currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryState {
    /// No operation in flight.
    #[default]
    Idle,
    /// An operation is being attempted.
    Retrying,
    /// The last operation succeeded.
    Succeeded,
    /// The last operation failed for good.
    Failed,
}

/// Tracks attempts and the last failure across one retried operation.
#[derive(Debug)]
pub struct RetryContext {
    policy: RetryPolicy,
    state: RetryState,
    retries: u32,
    last_error: Option<Error>,
}

impl RetryContext {
    /// Create a context with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Idle,
            retries: 0,
            last_error: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Retries consumed by the most recent [`RetryContext::run`].
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Last error observed, if any.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Forget the last error and return to idle.
    pub fn reset(&mut self) {
        self.state = RetryState::Idle;
        self.retries = 0;
        self.last_error = None;
    }

    /// Run `op`, retrying transient failures up to the policy's bound.
    ///
    /// Returns `RetryExhausted` once the bound is hit; non-retryable errors
    /// are returned as-is on the first occurrence.
    pub fn run<T>(&mut self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        self.state = RetryState::Retrying;
        self.retries = 0;
        loop {
            match op() {
                Ok(value) => {
                    self.state = RetryState::Succeeded;
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    self.last_error = Some(err.clone());
                    if !retryable {
                        self.state = RetryState::Failed;
                        return Err(err);
                    }
                    if self.retries >= self.policy.max_retries {
                        self.state = RetryState::Failed;
                        return Err(Error::new(
                            ErrorCode::RetryExhausted,
                            format!("gave up after {} retries: {err}", self.retries),
                        ));
                    }
                    self.retries += 1;
                    warn!(
                        attempt = self.retries,
                        max = self.policy.max_retries,
                        error = %err,
                        "retrying after transient failure"
                    );
                    if !self.policy.interval.is_zero() {
                        std::thread::sleep(self.policy.interval);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_wait(max_retries: u32) -> RetryContext {
        RetryContext::new(RetryPolicy::new(max_retries, Duration::ZERO))
    }

    #[test]
    fn first_try_success_uses_no_retries() {
        let mut ctx = no_wait(3);
        let result: Result<u32> = ctx.run(|| Ok(7));
        assert_eq!(result.unwrap(), 7);
        assert_eq!(ctx.state(), RetryState::Succeeded);
        assert_eq!(ctx.retries(), 0);
    }

    #[test]
    fn non_retryable_fails_immediately() {
        let mut ctx = no_wait(3);
        let mut calls = 0;
        let result: Result<()> = ctx.run(|| {
            calls += 1;
            Err(Error::from_code(ErrorCode::InvalidParam))
        });
        assert_eq!(result.unwrap_err().code(), ErrorCode::InvalidParam);
        assert_eq!(calls, 1);
        assert_eq!(ctx.retries(), 0);
        assert_eq!(ctx.state(), RetryState::Failed);
    }

    #[test]
    fn persistent_transient_failure_exhausts() {
        let mut ctx = no_wait(3);
        let mut calls = 0;
        let result: Result<()> = ctx.run(|| {
            calls += 1;
            Err(Error::from_code(ErrorCode::Network))
        });
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RetryExhausted);
        assert_eq!(ctx.retries(), 3);
        assert_eq!(calls, 4); // initial try + 3 retries
        assert_eq!(
            ctx.last_error().map(|e| e.code()),
            Some(ErrorCode::Network)
        );
    }

    #[test]
    fn recovers_midway() {
        let mut ctx = no_wait(5);
        let mut calls = 0;
        let result: Result<&str> = ctx.run(|| {
            calls += 1;
            if calls < 3 {
                Err(Error::from_code(ErrorCode::Timeout))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(ctx.retries(), 2);
        assert_eq!(ctx.state(), RetryState::Succeeded);
    }
}
