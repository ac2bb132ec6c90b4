// src/config.rs

//! Loads, resolves, and validates the Herd's configuration: the flags and
//! environment options named in the external-interfaces contract, plus
//! the ambient settings (bind address, log level, TLS, metrics) every
//! long-running service needs.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

/// The TCP port the Herd dials to reach a sub's RPC listener.
pub const SUB_RPC_PORT: u16 = 9380;

/// A raw representation of the config file before defaults and validation
/// are applied.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_admin_port")]
    admin_port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,

    #[serde(default)]
    mdb_source: MdbSourceConfig,
    #[serde(default)]
    disable_updates_at_startup: bool,
    #[serde(default = "default_poll_slots_per_cpu")]
    poll_slots_per_cpu: u32,
    #[serde(default = "default_sub_connect_timeout_secs")]
    sub_connect_timeout_secs: u64,
    #[serde(with = "humantime_serde", default = "default_subd_install_delay")]
    subd_install_delay: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_subd_install_retry_delay")]
    subd_install_retry_delay: std::time::Duration,
    #[serde(default)]
    subd_installer: Option<String>,

    #[serde(default)]
    image_server_url: Option<String>,

    #[serde(default = "default_reverse_listen_port")]
    reverse_listen_port: u16,
    #[serde(with = "humantime_serde", default = "default_mdb_poll_interval")]
    mdb_poll_interval: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_scan_tick_interval")]
    scan_tick_interval: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_image_sweep_interval")]
    image_sweep_interval: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_installer_check_interval")]
    installer_check_interval: std::time::Duration,

    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    cpu_sharer_fraction: Option<f64>,
}

fn default_reverse_listen_port() -> u16 {
    SUB_RPC_PORT
}
fn default_mdb_poll_interval() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}
fn default_scan_tick_interval() -> std::time::Duration {
    std::time::Duration::from_millis(10)
}
fn default_image_sweep_interval() -> std::time::Duration {
    std::time::Duration::from_secs(5 * 60)
}
fn default_installer_check_interval() -> std::time::Duration {
    std::time::Duration::from_secs(60)
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_admin_port() -> u16 {
    6910
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_slots_per_cpu() -> u32 {
    100
}
fn default_sub_connect_timeout_secs() -> u64 {
    15
}
fn default_subd_install_delay() -> std::time::Duration {
    std::time::Duration::from_secs(5 * 60)
}
fn default_subd_install_retry_delay() -> std::time::Duration {
    std::time::Duration::from_secs(60 * 60)
}

/// Where the machine database comes from.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MdbSourceConfig {
    JsonFile { path: String },
    Aws { account_ids: Vec<String>, region: String },
}

impl Default for MdbSourceConfig {
    fn default() -> Self {
        MdbSourceConfig::JsonFile {
            path: "mdb.json".to_string(),
        }
    }
}

/// Configuration for TLS used when dialing a sub directly.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "herd.crt".to_string()
}
fn default_key_path() -> String {
    "herd.key".to_string()
}

/// Configuration for the Prometheus metrics HTTP server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    6911
}

/// The final, validated, resolved configuration the Herd runs with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub admin_port: u16,
    pub log_level: String,

    pub mdb_source: MdbSourceConfig,
    pub disable_updates_at_startup: bool,
    pub poll_slots_per_cpu: u32,
    pub sub_connect_timeout: Option<std::time::Duration>,
    pub subd_install_delay: std::time::Duration,
    pub subd_install_retry_delay: std::time::Duration,
    /// Absent means installer escalation is disabled entirely.
    pub subd_installer: Option<String>,

    pub image_server_url: Option<String>,

    pub reverse_listen_port: u16,
    pub mdb_poll_interval: std::time::Duration,
    pub scan_tick_interval: std::time::Duration,
    pub image_sweep_interval: std::time::Duration,
    pub installer_check_interval: std::time::Duration,

    pub tls: TlsConfig,
    pub metrics: MetricsConfig,
    pub cpu_sharer_fraction: f64,
}

impl Config {
    /// Reads and parses a TOML file, applying defaults and then
    /// validating the result.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig =
            toml::from_str(&contents).with_context(|| format!("failed to parse TOML from '{path}'"))?;

        let config = Config {
            host: raw.host,
            admin_port: raw.admin_port,
            log_level: raw.log_level,
            mdb_source: raw.mdb_source,
            disable_updates_at_startup: raw.disable_updates_at_startup,
            poll_slots_per_cpu: raw.poll_slots_per_cpu,
            sub_connect_timeout: if raw.sub_connect_timeout_secs == 0 {
                None
            } else {
                Some(std::time::Duration::from_secs(raw.sub_connect_timeout_secs))
            },
            subd_install_delay: raw.subd_install_delay,
            subd_install_retry_delay: raw.subd_install_retry_delay,
            subd_installer: raw.subd_installer,
            image_server_url: raw.image_server_url,
            reverse_listen_port: raw.reverse_listen_port,
            mdb_poll_interval: raw.mdb_poll_interval,
            scan_tick_interval: raw.scan_tick_interval,
            image_sweep_interval: raw.image_sweep_interval,
            installer_check_interval: raw.installer_check_interval,
            tls: raw.tls,
            metrics: raw.metrics,
            cpu_sharer_fraction: raw.cpu_sharer_fraction.unwrap_or(1.0),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.admin_port == 0 {
            return Err(anyhow!("admin_port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.poll_slots_per_cpu == 0 {
            return Err(anyhow!("poll_slots_per_cpu cannot be 0"));
        }
        if !(0.0..=64.0).contains(&self.cpu_sharer_fraction) || self.cpu_sharer_fraction <= 0.0 {
            return Err(anyhow!("cpu_sharer_fraction must be a positive number"));
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.admin_port {
                return Err(anyhow!("metrics.port cannot be the same as admin_port"));
            }
            if self.metrics.port == self.reverse_listen_port {
                return Err(anyhow!("metrics.port cannot be the same as reverse_listen_port"));
            }
        }

        if self.subd_installer.is_none() {
            warn!("subd_installer not configured; installer escalation is disabled");
        }

        if self.reverse_listen_port == 0 {
            return Err(anyhow!("reverse_listen_port cannot be 0"));
        }
        if self.reverse_listen_port == self.admin_port {
            return Err(anyhow!("reverse_listen_port cannot be the same as admin_port"));
        }
        if self.mdb_poll_interval.is_zero() {
            return Err(anyhow!("mdb_poll_interval cannot be 0"));
        }
        if self.scan_tick_interval.is_zero() {
            return Err(anyhow!("scan_tick_interval cannot be 0"));
        }
        if self.image_sweep_interval.is_zero() {
            return Err(anyhow!("image_sweep_interval cannot be 0"));
        }
        if self.installer_check_interval.is_zero() {
            return Err(anyhow!("installer_check_interval cannot be 0"));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            admin_port: default_admin_port(),
            log_level: default_log_level(),
            mdb_source: MdbSourceConfig::default(),
            disable_updates_at_startup: false,
            poll_slots_per_cpu: default_poll_slots_per_cpu(),
            sub_connect_timeout: Some(std::time::Duration::from_secs(default_sub_connect_timeout_secs())),
            subd_install_delay: default_subd_install_delay(),
            subd_install_retry_delay: default_subd_install_retry_delay(),
            subd_installer: None,
            image_server_url: None,
            reverse_listen_port: default_reverse_listen_port(),
            mdb_poll_interval: default_mdb_poll_interval(),
            scan_tick_interval: default_scan_tick_interval(),
            image_sweep_interval: default_image_sweep_interval(),
            installer_check_interval: default_installer_check_interval(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
            cpu_sharer_fraction: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_sub_connect_timeout_means_no_timeout() {
        let toml = "sub_connect_timeout_secs = 0\n";
        let raw: RawConfig = toml::from_str(toml).unwrap();
        assert_eq!(raw.sub_connect_timeout_secs, 0);
    }

    #[test]
    fn metrics_port_colliding_with_admin_port_is_rejected() {
        let mut config = Config::default();
        config.metrics.enabled = true;
        config.metrics.port = config.admin_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_parses_mdb_source_and_installer_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herd.toml");
        std::fs::write(
            &path,
            r#"
            admin_port = 7000
            subd_installer = "/usr/local/sbin/subd-installer"

            [mdb_source]
            kind = "json-file"
            path = "/etc/herd/mdb.json"
            "#,
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.admin_port, 7000);
        assert_eq!(config.subd_installer.as_deref(), Some("/usr/local/sbin/subd-installer"));
        match config.mdb_source {
            MdbSourceConfig::JsonFile { path } => assert_eq!(path, "/etc/herd/mdb.json"),
            _ => panic!("expected json-file mdb source"),
        }
    }
}
