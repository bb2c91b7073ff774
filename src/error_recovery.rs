//! Retry policies for operations that may fail transiently.
//!
//! Instrument faults are absorbed by degrading the instrument, so the only retried
//! operation is writing the run file at the end of a run (a network share that is
//! briefly unavailable, a file held open by an editor).

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::AppResult;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// Returns the last error when every attempt fails. `what` names the operation
/// in log output.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    what, attempt, attempts, e
                );
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("{} failed after {} attempt(s): {}", what, attempts, e);
                return Err(e);
            }
        }
    }
}

/// Blocking variant of [`retry_with_policy`] for synchronous file I/O.
///
/// The operation runs on tokio's blocking pool so the caller's task is not
/// stalled by a slow disk.
pub async fn retry_blocking<T, F>(policy: &RetryPolicy, what: &str, op: F) -> AppResult<T>
where
    T: Send + 'static,
    F: Fn() -> AppResult<T> + Send + Sync + 'static,
{
    let op = std::sync::Arc::new(op);
    retry_with_policy(policy, what, || {
        let op = op.clone();
        async move {
            tokio::task::spawn_blocking(move || op())
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing_until(counter: Arc<AtomicU32>, succeed_on: u32) -> impl Fn() -> AppResult<u32> {
        move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= succeed_on {
                Ok(attempt)
            } else {
                Err(DaqError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "file locked",
                )))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_succeeds() {
        let counter = Arc::new(AtomicU32::new(0));
        let op = failing_until(counter.clone(), 2);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result = retry_with_policy(&policy, "save", || async { op() }).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_fails() {
        let counter = Arc::new(AtomicU32::new(0));
        let op = failing_until(counter.clone(), 4);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result = retry_with_policy(&policy, "save", || async { op() }).await;
        assert!(matches!(result, Err(DaqError::Io(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn blocking_retry_runs_on_blocking_pool() {
        let counter = Arc::new(AtomicU32::new(0));
        let op = failing_until(counter.clone(), 1);
        let result = retry_blocking(&RetryPolicy::default(), "save", op).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn once_policy_makes_a_single_attempt() {
        assert_eq!(RetryPolicy::once().max_attempts, 1);
    }
}
