// src/server/initialization.rs

//! Builds every long-lived collaborator the Herd depends on — the CPU
//! budget, the reverse dialer, the image and computed-file managers, and
//! the Herd registry itself — from a validated `Config`.

use super::context::ServerContext;
use crate::config::{Config, MdbSourceConfig};
use crate::core::computed_files::ComputedFilesManager;
use crate::core::cpu_sharer::CpuSharer;
use crate::core::herd::Herd;
use crate::core::image::{HttpImageServerClient, ImageManager, ImageServerClient, ImageUpdate};
use crate::core::mdb::{JsonFileMdbSource, MdbSource};
use crate::core::reverse_dialer::ReverseDialer;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::{rustls, TlsConnector};
use tracing::info;

/// Initializes all Herd components before the background tasks are spawned.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let cpu_sharer = Arc::new(CpuSharer::new(config.cpu_sharer_fraction));
    let tls_connector = build_tls_connector(&config)?;
    let reverse_dialer = Arc::new(ReverseDialer::new(
        Arc::clone(&cpu_sharer),
        config.sub_connect_timeout,
        tls_connector,
    ));
    let image_client = build_image_client(&config)?;
    let image_manager = Arc::new(ImageManager::new(image_client));
    let computed_files = Arc::new(ComputedFilesManager::new());

    let herd = Arc::new(Herd::new(
        cpu_sharer,
        reverse_dialer,
        image_manager,
        computed_files,
        config.poll_slots_per_cpu,
        config.disable_updates_at_startup,
    ));

    Ok(ServerContext {
        config,
        herd,
        shutdown_tx,
        background_tasks: tokio::task::JoinSet::new(),
    })
}

fn build_image_client(config: &Config) -> Result<Arc<dyn ImageServerClient>> {
    match &config.image_server_url {
        Some(url) => {
            let parsed = url::Url::parse(url).map_err(|e| anyhow!("invalid image_server_url '{url}': {e}"))?;
            Ok(Arc::new(HttpImageServerClient::new(parsed)))
        }
        None => {
            info!("image_server_url not configured; images always resolve as absent");
            Ok(Arc::new(NullImageServerClient))
        }
    }
}

/// Resolves nothing, used only when no image server is configured. Subs
/// with a required image will be stuck at `image-undefined` in that mode.
struct NullImageServerClient;

#[async_trait]
impl ImageServerClient for NullImageServerClient {
    async fn get(&self, _name: &str, _wait: bool, _timeout: Option<Duration>) -> anyhow::Result<Option<crate::core::image::Image>> {
        Ok(None)
    }

    async fn check_directory(&self, _name: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn subscribe_updates(&self) -> anyhow::Result<mpsc::Receiver<ImageUpdate>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

/// Builds a client-side TLS connector for dialing subs directly, used when
/// `tls.enabled`. The Herd presents its own certificate and key as a
/// client identity; the sub's certificate is checked against the public
/// web root store.
fn build_tls_connector(config: &Config) -> Result<Option<TlsConnector>> {
    if !config.tls.enabled {
        return Ok(None);
    }
    info!("TLS is enabled for outbound sub connections. Loading client certificate and key.");
    let certs = load_certs(&config.tls.cert_path)?;
    let key = load_key(&config.tls.key_path)?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(certs, key)
        .context("failed to build TLS client configuration")?;

    Ok(Some(TlsConnector::from(Arc::new(client_config))))
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path).map_err(|e| anyhow!("failed to open certificate file '{path}': {e}"))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in '{path}'"));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path).map_err(|e| anyhow!("failed to open private key file '{path}': {e}"))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| anyhow!("no private key found in key file '{path}'"))
}

/// Constructs the configured `MdbSource`. AWS-backed sources require a
/// scanning implementation this crate does not carry yet; see DESIGN.md.
pub fn build_mdb_source(config: &Config) -> Result<Box<dyn MdbSource>> {
    match &config.mdb_source {
        MdbSourceConfig::JsonFile { path } => Ok(Box::new(JsonFileMdbSource::new(path.clone()))),
        MdbSourceConfig::Aws { .. } => {
            Err(anyhow!("aws mdb_source is not implemented in this build; use a json-file source"))
        }
    }
}

fn log_startup_info(config: &Config) {
    info!(
        host = %config.host,
        admin_port = config.admin_port,
        poll_slots_per_cpu = config.poll_slots_per_cpu,
        "starting herd"
    );
    if config.subd_installer.is_none() {
        info!("subd_installer not configured; unreachable subs will never be auto-reinstalled");
    }
}
