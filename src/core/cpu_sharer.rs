// src/core/cpu_sharer.rs

//! CPU-budget scheduling: caps how much of the local machine's CPU a scan
//! cycle's outbound RPCs may consume at once, and lets a low-priority
//! consumer yield to anything waiting behind it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::core::lock_timeout;

/// A cooperative token bucket sized to a fraction of the host's CPU count.
/// Callers `grab()` before doing CPU-bound work on a sub's behalf and
/// `release()` when done; `go_when_idle()` lets a background sweep wait
/// until nothing else wants the budget.
pub struct CpuSharer {
    semaphore: Arc<Semaphore>,
    capacity: AtomicU32,
    waiters: AtomicU64,
    idle_notify: Notify,
    grab_timeout: Option<Duration>,
}

/// An outstanding grant from a [`CpuSharer`]. Dropping it releases the
/// permit automatically; callers needing an explicit release point can
/// still call [`CpuSharer::release`].
pub struct CpuGrant {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl CpuSharer {
    /// Sizes the bucket at `fraction_of_cpus` permits per logical CPU,
    /// rounded down, with a floor of one permit so the Herd always makes
    /// forward progress on a single-core box.
    pub fn new(fraction_of_cpus: f64) -> Self {
        let cpus = num_cpus::get().max(1) as f64;
        let capacity = ((cpus * fraction_of_cpus).floor() as u32).max(1);
        CpuSharer {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity: AtomicU32::new(capacity),
            waiters: AtomicU64::new(0),
            idle_notify: Notify::new(),
            grab_timeout: None,
        }
    }

    /// Sets a deadline for [`Self::grab`]. A grab that can't acquire a
    /// permit within this window indicates the Herd is saturated far
    /// beyond what retrying will fix, and aborts the process.
    pub fn set_grab_timeout(&mut self, timeout: Option<Duration>) {
        self.grab_timeout = timeout;
    }

    /// Acquires one permit, waiting if the bucket is currently exhausted.
    pub async fn grab(&self) -> CpuGrant {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let semaphore = Arc::clone(&self.semaphore);
        let permit = lock_timeout::with_timeout("CpuSharer::grab", self.grab_timeout, async move {
            semaphore
                .acquire_owned()
                .await
                .expect("CpuSharer semaphore is never closed")
        })
        .await;
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        CpuGrant { _permit: permit }
    }

    /// Returns a permit early without waiting for the `CpuGrant` to drop.
    /// Prefer letting the grant drop; this exists for call sites that hold
    /// a grant across a branch where only one arm should release it.
    pub fn release(&self, grant: CpuGrant) {
        drop(grant);
    }

    /// Waits until no other caller currently holds or is waiting on a
    /// permit, then returns. Used by low-priority background sweeps (image
    /// garbage collection, cache revalidation) that should only run when
    /// the scan loop isn't contending for CPU.
    pub async fn go_when_idle(&self) {
        loop {
            if self.waiters.load(Ordering::SeqCst) == 0
                && self.semaphore.available_permits() == self.capacity.load(Ordering::SeqCst) as usize
            {
                return;
            }
            self.idle_notify.notified().await;
        }
    }

    /// Wakes any task parked in [`Self::go_when_idle`]. Call sites that
    /// release a permit should call this so idle-waiters don't block
    /// forever on a notification nobody sent.
    pub fn notify_idle_waiters(&self) {
        self.idle_notify.notify_waiters();
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_floors_at_one_permit() {
        let sharer = CpuSharer::new(0.0001);
        assert_eq!(sharer.capacity(), 1);
    }

    #[tokio::test]
    async fn grab_and_drop_restores_availability() {
        let sharer = CpuSharer::new(1.0);
        let before = sharer.available();
        let grant = sharer.grab().await;
        assert_eq!(sharer.available(), before - 1);
        drop(grant);
        // Permit count is restored synchronously on drop.
        assert_eq!(sharer.available(), before);
    }

    #[tokio::test]
    async fn go_when_idle_returns_immediately_when_uncontended() {
        let sharer = CpuSharer::new(1.0);
        tokio::time::timeout(Duration::from_millis(200), sharer.go_when_idle())
            .await
            .expect("go_when_idle should not block with no contenders");
    }

    #[tokio::test]
    async fn go_when_idle_waits_until_grant_is_released() {
        let sharer = Arc::new({
            let mut s = CpuSharer::new(0.01);
            s.set_grab_timeout(Some(Duration::from_secs(5)));
            s
        });
        assert_eq!(sharer.capacity(), 1);
        let grant = sharer.grab().await;

        let idle_sharer = Arc::clone(&sharer);
        let idle_task = tokio::spawn(async move {
            idle_sharer.go_when_idle().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!idle_task.is_finished());

        drop(grant);
        sharer.notify_idle_waiters();

        tokio::time::timeout(Duration::from_millis(500), idle_task)
            .await
            .expect("idle task should complete after release")
            .unwrap();
    }
}
