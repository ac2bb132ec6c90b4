// src/core/herd/scan.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::herd::Herd;
use crate::core::sub::rpc::{FramedSubRpcClient, SubRpcClient};

/// Walks `subs_by_index` in a round-robin, offering each non-busy Sub
/// exactly one scheduling opportunity per cycle. A busy Sub is skipped,
/// not deferred — it will be reconsidered next cycle regardless.
pub struct ScanLoopTask {
    pub herd: Arc<Herd>,
    pub tick_interval: Duration,
}

impl ScanLoopTask {
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_next_sub().await;
                }
                _ = shutdown_rx.recv() => {
                    debug!("scan loop shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn poll_next_sub(&self) {
        let index = self.herd.subs_by_index_snapshot();
        if index.is_empty() {
            return;
        }

        let cursor = self.herd.next_sub_to_poll_index();
        let position = cursor.fetch_add(1, std::sync::atomic::Ordering::SeqCst) % index.len();
        let wrapped = position == index.len() - 1;
        self.herd.begin_scan_if_wrapped(wrapped);

        let sub = Arc::clone(&index[position]);
        if sub.is_deleting() {
            return;
        }
        if !sub.try_make_busy() {
            return;
        }

        let herd = Arc::clone(&self.herd);
        tokio::spawn(async move {
            let Ok(_permit) = herd.poll_semaphore.clone().acquire_owned().await else {
                sub.make_unbusy();
                return;
            };

            let machine = sub.mdb();
            let image_name = herd.effective_image_name(&machine);

            let desired_image = match image_name {
                Some(name) => herd.image_manager.get(&name, false, None).await.ok().flatten(),
                None => None,
            };

            let updates_disabled = herd.updates_disabled_reason().is_some() || machine.disable_updates;

            let reverse_dialer = Arc::clone(&herd.reverse_dialer);
            let computed_files = Arc::clone(&herd.computed_files);
            let result = sub
                .connect_and_poll(
                    &reverse_dialer,
                    |stream| -> Arc<dyn SubRpcClient> { Arc::new(FramedSubRpcClient::new(stream)) },
                    desired_image,
                    &computed_files,
                    updates_disabled,
                )
                .await;

            match result {
                Ok(_retry_reasonable) => herd.installer_queue().note_reachable(sub.hostname()),
                Err(e) => {
                    warn!(hostname = %sub.hostname(), error = %e, "poll failed");
                    if sub.status() == crate::core::sub::SubStatus::Unreachable {
                        herd.installer_queue().note_unreachable(sub.hostname());
                    }
                }
            }

            sub.make_unbusy();
        });
    }
}
