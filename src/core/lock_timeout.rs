// src/core/lock_timeout.rs

//! Liveness safeguards for the Herd's shared locks and CpuSharer tokens.
//!
//! A stuck lock holder or a leaked CpuSharer token is a bug in the Herd
//! itself, not a condition callers can recover from. Rather than let a
//! scan cycle hang forever, every blocking acquire races against a
//! deadline and aborts the process with a diagnostic if it fires.

use std::future::Future;
use std::time::Duration;
use tracing::error;

/// Runs `fut` with a deadline. If `fut` doesn't resolve within `timeout`,
/// logs a diagnostic and aborts the process. `None` waits forever (mirrors
/// a negative timeout meaning "no timeout" at call sites).
pub async fn with_timeout<F, T>(what: &str, timeout: Option<Duration>, fut: F) -> T
where
    F: Future<Output = T>,
{
    match timeout {
        None => fut.await,
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(v) => v,
            Err(_) => abort_with_stack(&format!(
                "timed out after {d:?} waiting on: {what}"
            )),
        },
    }
}

/// Logs `reason` and aborts the process immediately. Used when Herd state
/// has been corrupted or a lock or CpuSharer token has deadlocked — both
/// are bugs, not recoverable conditions.
pub fn abort_with_stack(reason: &str) -> ! {
    error!("FATAL: {reason}");
    error!("this indicates corruption of the Herd's own data structures or a stuck lock holder");
    std::process::abort()
}
