// src/server/spawner.rs

//! Spawns all of the Herd's long-running background tasks into the
//! context's `JoinSet`, plus the admin and metrics HTTP servers.

use super::admin::run_admin_server;
use super::context::ServerContext;
use super::initialization::build_mdb_source;
use super::mdb_poll::MdbPollTask;
use super::metrics_server::run_metrics_server;
use super::reverse_listener::ReverseListenerTask;
use crate::core::herd::{ExternalProcessInstaller, InstallerEscalationTask, ScanLoopTask};
use crate::core::image::ImageSweepTask;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Spawns all background tasks into the provided context.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let herd = Arc::clone(&ctx.herd);
    let config = ctx.config.clone();
    let shutdown_tx = ctx.shutdown_tx.clone();
    let tasks = &mut ctx.background_tasks;

    // --- MDB ingestion ---
    let mdb_source = build_mdb_source(&config)?;
    let mdb_task = MdbPollTask {
        herd: Arc::clone(&herd),
        source: mdb_source,
        interval: config.mdb_poll_interval,
    };
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.spawn(async move { mdb_task.run(shutdown_rx).await });

    // --- Reverse-dial listener ---
    let reverse_addr = format!("{}:{}", config.host, config.reverse_listen_port);
    let reverse_listener = tokio::net::TcpListener::bind(&reverse_addr).await?;
    info!(addr = %reverse_addr, "reverse-dial listener bound");
    let reverse_task = ReverseListenerTask {
        listener: reverse_listener,
        reverse_dialer: Arc::clone(&herd.reverse_dialer),
    };
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.spawn(async move { reverse_task.run(shutdown_rx).await });

    // --- Scan loop ---
    let scan_task = ScanLoopTask {
        herd: Arc::clone(&herd),
        tick_interval: config.scan_tick_interval,
    };
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.spawn(async move { scan_task.run(shutdown_rx).await });

    // --- Image cache sweep ---
    let sweep_task = ImageSweepTask {
        manager: Arc::clone(&herd.image_manager),
        interval: config.image_sweep_interval,
    };
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.spawn(async move { sweep_task.run(shutdown_rx).await });

    // --- Installer escalation ---
    let installer: Option<Arc<dyn crate::core::herd::SubdInstaller>> = config
        .subd_installer
        .as_ref()
        .map(|path| Arc::new(ExternalProcessInstaller { binary_path: path.into() }) as Arc<dyn crate::core::herd::SubdInstaller>);
    let installer_task = InstallerEscalationTask {
        herd: Arc::clone(&herd),
        installer,
        install_delay: config.subd_install_delay,
        retry_delay: config.subd_install_retry_delay,
        check_interval: config.installer_check_interval,
    };
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.spawn(async move { installer_task.run(shutdown_rx).await });

    // --- Admin HTTP server ---
    let admin_herd = Arc::clone(&herd);
    let admin_host = config.host.clone();
    let admin_port = config.admin_port;
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.spawn(async move { run_admin_server(admin_herd, admin_host, admin_port, shutdown_rx).await });

    // --- Metrics server ---
    if config.metrics.enabled {
        let metrics_herd = Arc::clone(&herd);
        let metrics_port = config.metrics.port;
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move { run_metrics_server(metrics_herd, metrics_port, shutdown_rx).await });
    } else {
        info!("prometheus metrics server is disabled in the configuration");
    }

    info!("all background tasks have been spawned");
    Ok(())
}
