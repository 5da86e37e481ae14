//! Exponential backoff with a ceiling, shared by the HTTP retry loop and the
//! job requeue path. Only the constants differ between the two uses.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Default ceiling for job-level requeue delays.
pub const JOB_BACKOFF_CEILING: Duration = Duration::from_secs(15 * 60);

/// Doubling delay: `min(ceiling, base * 2^(attempt - 1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub ceiling: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }

    /// Requeue delay after a failed publish: 30s doubling up to 15 minutes.
    pub const fn job_default() -> Self {
        Self::new(Duration::from_secs(30), JOB_BACKOFF_CEILING)
    }

    /// Inter-attempt delay for transient HTTP failures: 300ms doubling up to 5s.
    pub const fn http_default() -> Self {
        Self::new(Duration::from_millis(300), Duration::from_secs(5))
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::job_default()
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Local retry budget for a single remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Retries after the first attempt; total calls are `max_retries + 1`.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::http_default(),
            max_retries: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const fn none() -> Self {
        Self {
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO),
            max_retries: 0,
        }
    }

    /// Run `op`, retrying transient failures with backoff.
    ///
    /// Terminal errors are returned immediately. When the budget is spent the
    /// last transient error is returned.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!(operation, retries, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && retries < self.max_retries => {
                    retries += 1;
                    let delay = self.backoff.delay(retries);
                    warn!(
                        operation,
                        retry = retries,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(operation, retries, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
