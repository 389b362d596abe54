//! Bounded retry with linear backoff for remote calls.
//!
//! Every call to the completion endpoint goes through [`RetryPolicy::run`].

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Retry settings applied to one remote call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    /// Delay unit; attempt `n` waits `n * base_delay` before the next try.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl From<&crate::config::RetryConfig> for RetryPolicy {
    fn from(config: &crate::config::RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `name` identifies the caller in logs, `action` describes the call
    /// and is part of the final error.
    pub async fn run<T, F, Fut>(&self, name: &str, action: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("[{}] retry succeeded: action={}, attempt={}", name, action, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        "[{}] call failed: action={}, attempt={}/{}, err={:#}",
                        name, action, attempt, attempts, e
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        let last = last_err.unwrap_or_else(|| anyhow!("no attempt was made"));
        Err(anyhow!(
            "{} failed after {} attempts: {:#}",
            action,
            attempts,
            last
        ))
    }

    /// Wait after failed attempt `attempt`, saturating instead of overflowing.
    fn backoff(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}
