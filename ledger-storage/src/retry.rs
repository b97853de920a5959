//! Bounded retry with exponential backoff for substrate calls.

use std::future::Future;

use ledger_core::{LedgerError, LedgerResult, RetryPolicy, StorageError};

/// Run one substrate call under the policy's per-call timeout.
///
/// An elapsed timeout surfaces as [`StorageError::Timeout`], which is transient.
pub async fn call_with_timeout<T, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    call: Fut,
) -> LedgerResult<T>
where
    Fut: Future<Output = LedgerResult<T>>,
{
    match tokio::time::timeout(policy.call_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: policy.call_timeout.as_millis() as u64,
        }
        .into()),
    }
}

/// Retry `call` while it fails transiently, up to `policy.max_attempts` attempts.
///
/// Non-transient errors return immediately. Exhausting the budget yields
/// [`LedgerError::Unavailable`] carrying the last transient error.
///
/// Only use this for idempotent calls (reads, or writes whose conditions make
/// a replay harmless). Batched maintenance commits classify partial outcomes
/// before retrying.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call_with_timeout(policy, operation, call()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient storage failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                tracing::error!(operation, attempts = attempt, error = %e, "Retry budget exhausted");
                return Err(unavailable(operation, attempt, &e));
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn unavailable(operation: &str, attempts: u32, last_error: &LedgerError) -> LedgerError {
    LedgerError::Unavailable {
        operation: operation.to_string(),
        attempts,
        last_error: last_error.to_string(),
    }
}
