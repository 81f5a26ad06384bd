use pkg_types::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::kv::CorruptRecord;

/// Errors that may succeed when the same operation is attempted again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Backend failures are worth another attempt. A record that fails to decode
/// will fail the same way next time.
impl Transient for anyhow::Error {
    fn is_transient(&self) -> bool {
        self.downcast_ref::<CorruptRecord>().is_none()
    }
}

/// Bounded retry policy for transient store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// Try once, never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            interval: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            interval: Duration::from_millis(cfg.interval_ms),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are exhausted. The last error is returned unchanged.
pub async fn retry_transient<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying",
                    what, attempt, policy.max_attempts, e
                );
                attempt += 1;
                if !policy.interval.is_zero() {
                    tokio::time::sleep(policy.interval).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}
