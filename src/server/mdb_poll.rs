// src/server/mdb_poll.rs

//! Periodically pulls a new snapshot from the configured `MdbSource` and
//! applies it to the Herd. This is the only path through which the fleet
//! roster changes; everything downstream reacts to `mdb_update`.

use crate::core::herd::Herd;
use crate::core::mdb::MdbSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error};

pub struct MdbPollTask {
    pub herd: Arc<Herd>,
    pub source: Box<dyn MdbSource>,
    pub interval: Duration,
}

impl MdbPollTask {
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.source.next().await {
                        Ok(mdb) => {
                            self.herd.mdb_update(mdb);
                            crate::core::metrics::MDB_INGESTS_TOTAL.inc();
                        }
                        Err(e) => error!(error = %e, "mdb source poll failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("mdb poll loop shutting down");
                    return Ok(());
                }
            }
        }
    }
}
