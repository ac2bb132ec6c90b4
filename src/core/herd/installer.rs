// src/core/herd/installer.rs

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::herd::Herd;
use crate::core::sub::SubStatus;

#[derive(Debug, Clone)]
struct InstallerEntry {
    first_seen_unreachable: DateTime<Utc>,
    last_attempt: Option<DateTime<Utc>>,
}

/// Append-only, hostname-deduplicated queue of subs awaiting an installer
/// attempt. Entries are removed only by MDB deletion or a successful
/// install.
#[derive(Default)]
pub struct InstallerQueue {
    entries: DashMap<String, InstallerEntry>,
}

impl InstallerQueue {
    pub fn new() -> Self {
        InstallerQueue::default()
    }

    /// Records that `hostname` became unreachable, if not already queued.
    pub fn note_unreachable(&self, hostname: &str) {
        self.entries.entry(hostname.to_string()).or_insert_with(|| InstallerEntry {
            first_seen_unreachable: Utc::now(),
            last_attempt: None,
        });
    }

    pub fn note_reachable(&self, hostname: &str) {
        self.entries.remove(hostname);
    }

    /// Removes `hostname` from the queue. Callers must hold the Herd
    /// write section covering the MDB deletion so a racing escalation
    /// loop cannot re-queue a host that's being removed.
    pub fn remove(&self, hostname: &str) {
        self.entries.remove(hostname);
    }

    /// Hosts whose unreachable grace period has elapsed and are either
    /// new to the queue or past their retry delay.
    fn due(&self, install_delay: Duration, retry_delay: Duration) -> Vec<String> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|entry| {
                let since_unreachable = now - entry.first_seen_unreachable;
                let grace_elapsed = since_unreachable.to_std().unwrap_or(Duration::ZERO) >= install_delay;
                if !grace_elapsed {
                    return false;
                }
                match entry.last_attempt {
                    None => true,
                    Some(last) => (now - last).to_std().unwrap_or(Duration::ZERO) >= retry_delay,
                }
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn record_attempt(&self, hostname: &str) {
        if let Some(mut entry) = self.entries.get_mut(hostname) {
            entry.last_attempt = Some(Utc::now());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shells out to an external installer binary for a given hostname.
#[async_trait::async_trait]
pub trait SubdInstaller: Send + Sync {
    async fn install(&self, hostname: &str) -> anyhow::Result<()>;
}

/// Runs the configured installer binary with `[hostname]` as argv. Exit
/// code 0 is success; anything else is a failure, retried later.
pub struct ExternalProcessInstaller {
    pub binary_path: PathBuf,
}

#[async_trait::async_trait]
impl SubdInstaller for ExternalProcessInstaller {
    async fn install(&self, hostname: &str) -> anyhow::Result<()> {
        let status = tokio::process::Command::new(&self.binary_path).arg(hostname).status().await?;
        if status.success() {
            Ok(())
        } else {
            anyhow::bail!("installer for {hostname} exited with {status}")
        }
    }
}

/// Background loop escalating long-unreachable subs to the external
/// installer. Disabled entirely when no installer binary is configured.
pub struct InstallerEscalationTask {
    pub herd: Arc<Herd>,
    pub installer: Option<Arc<dyn SubdInstaller>>,
    pub install_delay: Duration,
    pub retry_delay: Duration,
    pub check_interval: Duration,
}

impl InstallerEscalationTask {
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let Some(installer) = self.installer else {
            info!("subd installer not configured; escalation task idling");
            // Still honor shutdown so the JoinSet doesn't wait forever.
            let _ = shutdown_rx.recv().await;
            return Ok(());
        };

        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(installer.as_ref()).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("installer escalation task shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn sweep(&self, installer: &dyn SubdInstaller) {
        let queue = self.herd.installer_queue();
        for hostname in queue.due(self.install_delay, self.retry_delay) {
            let Some(sub) = self.herd.get_sub(&hostname) else {
                queue.remove(&hostname);
                continue;
            };
            if sub.status() != SubStatus::Unreachable {
                queue.note_reachable(&hostname);
                continue;
            }
            queue.record_attempt(&hostname);
            match installer.install(&hostname).await {
                Ok(()) => info!(hostname = %hostname, "subd installer succeeded"),
                Err(e) => warn!(hostname = %hostname, error = %e, "subd installer failed, will retry"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_excludes_entries_within_grace_period() {
        let queue = InstallerQueue::new();
        queue.note_unreachable("h1");
        let due = queue.due(Duration::from_secs(300), Duration::from_secs(3600));
        assert!(due.is_empty());
    }

    #[test]
    fn remove_erases_entry_immediately() {
        let queue = InstallerQueue::new();
        queue.note_unreachable("h1");
        queue.remove("h1");
        assert!(queue.is_empty());
    }
}
