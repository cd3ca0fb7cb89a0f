use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{SpaceError, SpaceResult};

/// Bounded exponential backoff. Only transient errors are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// One attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(16);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> SpaceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SpaceResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match cancellable(cancel, attempt_fn()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        target = "space_client::retry",
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; retrying"
                    );
                    sleep_cancellable(cancel, delay).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_secs(4))
    }
}

/// Races `future` against `cancel`; a cancelled token wins even if both are ready.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = SpaceResult<T>>,
) -> SpaceResult<T> {
    if cancel.is_cancelled() {
        return Err(SpaceError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SpaceError::Cancelled),
        result = future => result,
    }
}

pub(crate) async fn sleep_cancellable(
    cancel: &CancellationToken,
    delay: Duration,
) -> SpaceResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SpaceError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
