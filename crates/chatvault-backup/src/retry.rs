//! Per-chunk retry with exponential backoff
//!
//! Only transient storage failures are retried. The backoff sleep races the
//! run's cancellation token so a cancel never waits out a long delay.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use chatvault_core::config::BackupConfig;
use chatvault_storage::StorageError;

use crate::error::BackupErrorKind;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BackupConfig::default())
    }
}

#[derive(Debug)]
pub enum RetryError {
    Cancelled,
    /// Every attempt failed with a transient error
    Exhausted { attempts: u32, last: StorageError },
    /// A non-transient error; not retried
    Permanent(StorageError),
}

impl RetryError {
    /// Default mapping onto the user-facing taxonomy
    pub fn into_kind(self) -> BackupErrorKind {
        match self {
            RetryError::Cancelled => BackupErrorKind::Cancelled,
            RetryError::Exhausted { attempts, last } => BackupErrorKind::BackupFailed {
                attempts,
                reason: last.to_string(),
            },
            RetryError::Permanent(e) => BackupErrorKind::DestinationUnavailable(e.to_string()),
        }
    }

    /// Mapping for reads and deletes, where running out of attempts means
    /// the destination is unavailable rather than that a backup failed.
    pub fn into_unavailable(self) -> BackupErrorKind {
        match self {
            RetryError::Exhausted { attempts, last } => BackupErrorKind::DestinationUnavailable(
                format!("{last} (after {attempts} attempts)"),
            ),
            other => other.into_kind(),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &BackupConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
        }
    }

    /// Delay after the `attempt`-th failure (1-based): base · 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        action: &str,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        action,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient storage failure, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    })
                }
                Err(e) => return Err(RetryError::Permanent(e)),
            }
        }
    }
}
