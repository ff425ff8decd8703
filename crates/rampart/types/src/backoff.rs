//! Exponential backoff shared by race retries and service retries.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential backoff policy.
///
/// Attempts are numbered from 1. The delay after attempt `n` is
/// `initial * multiplier^(n-1)`, capped at `max_backoff_ms`. No further
/// attempt is made once `n >= max_retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Upper bound on any single delay, in milliseconds.
    pub max_backoff_ms: u64,

    /// Attempt number at which retrying stops.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_backoff: Duration, multiplier: f64, max_retries: u32) -> Self {
        Self {
            initial_backoff_ms: initial_backoff.as_millis() as u64,
            multiplier,
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff_ms = max_backoff.as_millis() as u64;
        self
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay to wait after `attempt` failed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }

    /// Decide what to do after `attempt` failed.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if self.is_exhausted(attempt) {
            RetryDecision {
                should_retry: false,
                backoff: Duration::ZERO,
            }
        } else {
            RetryDecision {
                should_retry: true,
                backoff: self.backoff_delay(attempt),
            }
        }
    }
}

/// Outcome of consulting a [`BackoffPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub backoff: Duration,
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retry cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Cancelled { attempts } | RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. Delays never block the runtime
/// and are abandoned as soon as the token is cancelled.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }

        attempt += 1;
        let last = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let decision = policy.decide(attempt);
        if !decision.should_retry {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last,
            });
        }

        debug!(
            attempt = attempt,
            backoff_ms = decision.backoff.as_millis() as u64,
            "Backing off before retry"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            _ = tokio::time::sleep(decision.backoff) => {}
        }
    }
}
