// src/core/sub/cancel.rs

//! A cancellation signal realized as an atomic epoch counter rather than a
//! channel. Whoever mutates a Sub's intent bumps the epoch; any operation
//! in flight samples its expected epoch at well-defined suspension points
//! and treats a mismatch as "stop now". This avoids the "receiver missed
//! the signal because it wasn't listening yet" problem a one-shot channel
//! has, at the cost of callers needing to poll rather than await.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct CancelEpoch(AtomicU64);

impl CancelEpoch {
    pub fn new() -> Self {
        CancelEpoch(AtomicU64::new(0))
    }

    /// The epoch an operation should capture at start to later check
    /// cancellation against.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Invalidates every in-flight operation that started before this call.
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// True if `observed_at` no longer matches the current epoch, i.e. a
    /// cancellation happened since the caller started.
    pub fn is_cancelled(&self, observed_at: u64) -> bool {
        self.current() != observed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_invalidates_previously_observed_epoch() {
        let epoch = CancelEpoch::new();
        let observed = epoch.current();
        assert!(!epoch.is_cancelled(observed));
        epoch.bump();
        assert!(epoch.is_cancelled(observed));
    }
}
