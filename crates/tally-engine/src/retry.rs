//! # Bounded Retry
//!
//! Re-runs a ledger operation while it fails with a transient storage error
//! (SQLite lock contention, pool exhaustion).
//!
//! ```text
//!  attempt 1 ──► Err(transient) ──► sleep(backoff) ──► attempt 2 ──► ...
//!      │                                                   │
//!      └── Ok / business error ──► return                  └── max_attempts reached ──► return last error
//! ```
//!
//! Business errors (`NotFound`, `InsufficientStock`, `InvalidTransaction`)
//! are returned on the first occurrence.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tally_core::LedgerResult;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Runs the operation exactly once.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or the policy runs out.
///
/// `op` must be safe to repeat; checkouts and item returns are, through
/// their idempotency keys.
///
/// ## Example
/// ```rust,ignore
/// let response = with_retry(&policy, || checkout.checkout(request.clone())).await?;
/// ```
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let mut backoff = policy.create_backoff();
    let mut attempt = 1;

    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
                warn!(attempt, ?delay, error = %err, "Transient storage failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tally_core::LedgerError;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(LedgerError::storage("database is locked", true))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: LedgerResult<()> = with_retry(&fast(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LedgerError::storage("database is locked", true)) }
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let result: LedgerResult<()> = with_retry(&fast(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LedgerError::InsufficientStock {
                    sku: "A".into(),
                    available: 0,
                    requested: 1,
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let _: LedgerResult<()> = with_retry(&RetryPolicy::none(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LedgerError::storage("busy", true)) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
