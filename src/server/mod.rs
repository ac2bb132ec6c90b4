// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use tracing::{error, info};

mod admin;
mod context;
mod initialization;
mod mdb_poll;
mod metrics_server;
mod reverse_listener;
mod spawner;

/// The main startup function: builds every collaborator, spawns all
/// background tasks, then waits for them to finish (normally only at
/// shutdown).
pub async fn run(config: Config) -> Result<()> {
    let mut ctx = initialization::setup(config).await?;
    spawner::spawn_all(&mut ctx).await?;

    while let Some(result) = ctx.background_tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "background task exited with an error"),
            Err(e) => error!(error = %e, "background task panicked"),
        }
    }

    info!("all background tasks have exited; shutting down");
    Ok(())
}
