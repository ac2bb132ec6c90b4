// src/core/image/manager.rs

use super::client::ImageServerClient;
use super::types::Image;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Lazily resolves image names to [`Image`] values, retaining them until
/// they fall outside the current interest list. The manager is the only
/// eviction point: once handed out, an `Arc<Image>` stays valid for as
/// long as the caller holds it, even past eviction from the cache.
pub struct ImageManager {
    client: Arc<dyn ImageServerClient>,
    cache: DashMap<String, Arc<Image>>,
    interest: parking_lot::RwLock<HashSet<String>>,
    arrival: Notify,
}

impl ImageManager {
    pub fn new(client: Arc<dyn ImageServerClient>) -> Self {
        ImageManager {
            client,
            cache: DashMap::new(),
            interest: parking_lot::RwLock::new(HashSet::new()),
            arrival: Notify::new(),
        }
    }

    /// Returns the cached image, or fetches it. If `wait_if_missing` is
    /// true and the server doesn't have it yet, blocks (bounded by
    /// `timeout`) until an `AddImage` update or a direct re-fetch finds it.
    pub async fn get(
        &self,
        name: &str,
        wait_if_missing: bool,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Option<Arc<Image>>> {
        if name.is_empty() {
            return Ok(None);
        }
        if let Some(image) = self.cache.get(name) {
            return Ok(Some(Arc::clone(&image)));
        }
        match self.client.get(name, wait_if_missing, timeout).await? {
            Some(image) => {
                let arc = Arc::new(image);
                self.cache.insert(name.to_string(), Arc::clone(&arc));
                Ok(Some(arc))
            }
            None => Ok(None),
        }
    }

    /// Non-blocking variant; suppresses fetch errors by returning `None`.
    pub async fn get_no_error(&self, name: &str) -> Option<Arc<Image>> {
        self.get(name, false, None).await.unwrap_or(None)
    }

    /// Replaces the set of names the manager will retain. Names outside
    /// the new set become eligible for eviction at the next sweep;
    /// `strict` forces immediate eviction instead of waiting for the sweep.
    pub fn set_image_interest_list(&self, names: impl IntoIterator<Item = String>, strict: bool) {
        let new_interest: HashSet<String> = names.into_iter().filter(|n| !n.is_empty()).collect();
        *self.interest.write() = new_interest.clone();
        if strict {
            self.cache.retain(|name, _| new_interest.contains(name));
        }
        self.arrival.notify_waiters();
    }

    /// Drops every cached image outside the current interest list. Call
    /// periodically from a background sweep; not done inline on every
    /// `set_image_interest_list` unless `strict` is requested.
    pub fn sweep(&self) {
        let interest = self.interest.read().clone();
        let before = self.cache.len();
        self.cache.retain(|name, _| interest.contains(name));
        let evicted = before - self.cache.len();
        if evicted > 0 {
            debug!(evicted, "image manager sweep evicted cached images");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cache.contains_key(name)
    }
}

/// Background sweep loop, evicting images that fell out of interest since
/// the last pass. Runs until `shutdown_rx` fires.
pub struct ImageSweepTask {
    pub manager: Arc<ImageManager>,
    pub interval: Duration,
}

impl ImageSweepTask {
    pub async fn run(self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.manager.sweep();
                }
                _ = shutdown_rx.recv() => {
                    info!("image sweep task shutting down");
                    return Ok(());
                }
            }
        }
    }
}
