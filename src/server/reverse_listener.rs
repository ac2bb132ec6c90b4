// src/server/reverse_listener.rs

//! Accepts sub-initiated connections for the reverse-dial path: a sub
//! behind NAT dials in, announces its hostname on one newline-terminated
//! line, and the remaining socket is handed to the `ReverseDialer` for the
//! next scheduled poll or update to reuse.

use crate::core::reverse_dialer::ReverseDialer;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub struct ReverseListenerTask {
    pub listener: TcpListener,
    pub reverse_dialer: Arc<ReverseDialer>,
}

impl ReverseListenerTask {
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "failed to accept reverse connection");
                            continue;
                        }
                    };
                    let reverse_dialer = Arc::clone(&self.reverse_dialer);
                    tokio::spawn(async move {
                        if let Err(e) = register_one(stream, reverse_dialer).await {
                            warn!(peer = %addr, error = %e, "reverse connection handshake failed");
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    debug!("reverse listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn register_one(stream: tokio::net::TcpStream, reverse_dialer: Arc<ReverseDialer>) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut hostname = String::new();
    reader.read_line(&mut hostname).await?;
    let hostname = hostname.trim().to_string();
    if hostname.is_empty() {
        anyhow::bail!("empty hostname announcement");
    }
    // `reader` keeps whatever it already buffered past the hostname line,
    // so registering it directly (rather than its unwrapped inner stream)
    // never drops bytes the sub sent immediately after the announcement.
    reverse_dialer.register_reverse(hostname, Box::new(reader));
    Ok(())
}
