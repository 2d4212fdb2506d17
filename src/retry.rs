//! Retry policy applied around every oracle call.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(20);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often and how patiently an oracle call is retried.
///
/// Every failure is retried: transport errors, timeouts and unparseable output alike.
/// A timed-out attempt consumes one attempt of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttemptFailure<E> {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(E),
}

#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {last}")]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: AttemptFailure<E>,
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Runs `op` until it succeeds or the attempt budget is spent.
    /// `op` receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let total = self.total_attempts();
        let mut attempt = 0;
        loop {
            let failure = match tokio::time::timeout(self.attempt_timeout, op(attempt)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => AttemptFailure::Failed(e),
                Err(_) => AttemptFailure::Timeout(self.attempt_timeout),
            };

            attempt += 1;
            if attempt >= total {
                return Err(RetryError {
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = self.backoff(attempt - 1);
            debug!(
                label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying after failed attempt"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Equal jitter backoff: base/2 + rand(0, base/2), base doubling per attempt up to `max_backoff`.
    fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as u64;
        let cap = self.max_backoff.as_millis() as u64;
        let base = initial.saturating_mul(2u64.saturating_pow(attempt)).min(cap);
        let half = base / 2;
        Duration::from_millis(half + fastrand::u64(..half.max(1)))
    }
}

#[cfg(test)]
pub(crate) fn instant_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
    }
}
