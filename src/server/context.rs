// src/server/context.rs

use crate::config::Config;
use crate::core::herd::Herd;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the Herd's main loop.
pub struct ServerContext {
    pub config: Config,
    pub herd: Arc<Herd>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
