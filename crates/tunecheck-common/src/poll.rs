//! Bounded polling for values that become consistent asynchronously.
//!
//! Sysfs files and rollout conditions have no notification channel, so every
//! wait in the suite goes through [`Poller::poll`]. A probe returns:
//!
//! - `Ok(Some(value))`: done, return the value
//! - `Ok(None)`: not yet, poll again after `interval`
//! - `Err(e)` with [`Error::is_transient`]: not yet, poll again
//! - any other `Err(e)`: abort immediately with `e`
//!
//! The wait ends with [`Error::Timeout`] once `timeout` has elapsed. Each
//! attempt and each sleep is bounded by the remaining budget and by the
//! cancellation token, so a hung probe cannot hold the wait past its deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Result type for a single probe attempt
pub type PollResult<T> = Result<Option<T>>;

/// Interval, timeout and cancellation for one kind of wait
#[derive(Clone, Debug)]
pub struct Poller {
    interval: Duration,
    timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl Poller {
    /// Create a poller with the given spacing and deadline
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            cancel: None,
        }
    }

    /// Abort waits when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Same interval and cancellation, different deadline
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    /// Drop the cancellation token (used for best-effort cleanup after a
    /// scenario was cancelled)
    pub fn uncancellable(&self) -> Self {
        Self {
            cancel: None,
            ..self.clone()
        }
    }

    /// Spacing between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Deadline for one wait
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate `probe` until it reports done, fails fatally, the deadline
    /// passes, or the wait is cancelled.
    pub async fn poll<T, F, Fut>(&self, description: &str, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PollResult<T>>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempt = 0u32;

        loop {
            self.check_cancelled(description)?;
            attempt += 1;

            match self.attempt(deadline, description, probe()).await {
                Ok(Some(value)) => {
                    debug!(
                        wait = %description,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Wait satisfied"
                    );
                    return Ok(value);
                }
                Ok(None) => {
                    trace!(wait = %description, attempt, "Condition not met yet");
                }
                Err(e) if e.is_transient() => {
                    debug!(wait = %description, attempt, error = %e, "Transient probe error, retrying");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::timeout(description, start.elapsed()));
            }
            self.pause((deadline - now).min(self.interval), description)
                .await?;
        }
    }

    /// Run one attempt, giving up at `deadline` or on cancellation
    async fn attempt<T, Fut>(
        &self,
        deadline: Instant,
        description: &str,
        attempt: Fut,
    ) -> PollResult<T>
    where
        Fut: Future<Output = PollResult<T>>,
    {
        let started = Instant::now();
        let bounded = timeout(deadline.saturating_duration_since(started), attempt);
        let outcome = match self.cancel {
            Some(ref token) => tokio::select! {
                _ = token.cancelled() => return Err(Error::cancelled(description)),
                outcome = bounded => outcome,
            },
            None => bounded.await,
        };
        outcome.map_err(|_| {
            debug!(wait = %description, "Attempt outlived the wait deadline");
            Error::timeout(description, self.timeout)
        })?
    }

    fn check_cancelled(&self, description: &str) -> Result<()> {
        match self.cancel {
            Some(ref token) if token.is_cancelled() => Err(Error::cancelled(description)),
            _ => Ok(()),
        }
    }

    async fn pause(&self, duration: Duration, description: &str) -> Result<()> {
        match self.cancel {
            Some(ref token) => tokio::select! {
                _ = token.cancelled() => Err(Error::cancelled(description)),
                _ = sleep(duration) => Ok(()),
            },
            None => {
                sleep(duration).await;
                Ok(())
            }
        }
    }
}
