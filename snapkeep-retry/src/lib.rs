//! Deadline-bounded polling with backoff for snapkeep
//!
//! Callers that have to wait on a contended resource (the process lock being
//! the main one) poll it through this crate, sleeping between attempts on an
//! exponential schedule and giving up once the deadline has passed.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' still pending after {waited:?} ({attempts} attempts)")]
    DeadlineExceeded {
        operation: &'static str,
        attempts: usize,
        waited: Duration,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Outcome of a single polling attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// The operation completed
    Ready(T),
    /// The resource is contended, try again later
    Pending,
    /// The operation failed and retrying will not help
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

/// Poll `f` until it is ready, fails, or `timeout` elapses, using the default
/// lock-wait backoff schedule.
///
/// `f` is always invoked at least once, even with a zero timeout.
pub fn poll_until<F, T>(op_name: &'static str, timeout: Duration, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> Attempt<T>,
{
    poll_with_policy(op_name, timeout, lock_wait_policy(), f)
}

/// Poll `f` with a custom backoff policy.
///
/// The policy only controls the delay between attempts; the deadline is
/// enforced here so the total wait never exceeds `timeout`.
pub fn poll_with_policy<F, T>(
    op_name: &'static str,
    timeout: Duration,
    mut policy: ExponentialBackoff,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> Attempt<T>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    policy.reset();
    let mut attempt = 1;

    loop {
        debug!("Polling '{}' (attempt {})", op_name, attempt);

        match f(attempt) {
            Attempt::Ready(value) => {
                if attempt > 1 {
                    debug!("'{}' became ready after {} attempts", op_name, attempt);
                }
                return Ok(value);
            }
            Attempt::Failed(source) => {
                warn!("'{}' failed permanently on attempt {}", op_name, attempt);
                return Err(RetryError::Permanent {
                    operation: op_name,
                    source,
                });
            }
            Attempt::Pending => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(RetryError::DeadlineExceeded {
                        operation: op_name,
                        attempts: attempt,
                        waited: now - started,
                    });
                }

                let remaining = deadline - now;
                let delay = policy.next_backoff().unwrap_or(remaining).min(remaining);
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Backoff schedule for waiting on a held process lock
pub fn lock_wait_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(25))
        .with_max_interval(Duration::from_millis(500))
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_on_first_attempt() {
        let result = poll_until("test_op", Duration::from_millis(100), |_| Attempt::Ready(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_pending_then_ready() {
        let result = poll_until("test_op", Duration::from_secs(5), |attempt| {
            if attempt < 3 {
                Attempt::Pending
            } else {
                Attempt::Ready(attempt)
            }
        });

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_zero_timeout_polls_exactly_once() {
        let mut calls = 0;
        let result: RetryResult<()> = poll_until("test_op", Duration::ZERO, |_| {
            calls += 1;
            Attempt::Pending
        });

        assert_eq!(calls, 1);
        assert!(matches!(
            result,
            Err(RetryError::DeadlineExceeded { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_deadline_bounds_total_wait() {
        let started = Instant::now();
        let result: RetryResult<()> =
            poll_until("test_op", Duration::from_millis(120), |_| Attempt::Pending);

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_permanent_failure_stops_polling() {
        let mut calls = 0;
        let result: RetryResult<()> = poll_until("test_op", Duration::from_secs(5), |_| {
            calls += 1;
            Attempt::Failed(Box::new(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "permission denied",
            )))
        });

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(RetryError::Permanent { .. })));
    }
}
