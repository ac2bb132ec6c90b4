// src/core/object_cache/client.rs

use crate::core::hash::Hash;
use async_trait::async_trait;
use bytes::Bytes;

/// The remote object server's RPC contract: check which of a set of hashes
/// it holds, and stream their bytes back in request order.
#[async_trait]
pub trait ObjectServerClient: Send + Sync {
    /// Returns the size of each requested hash on the server, 0 if absent,
    /// in the same order as `hashes`.
    async fn check_objects(&self, hashes: &[Hash]) -> anyhow::Result<Vec<u64>>;

    /// Fetches the full bytes of each hash, in request order. Any error
    /// aborts the whole fetch; callers should not assume a partial result.
    async fn get_objects(&self, hashes: &[Hash]) -> anyhow::Result<Vec<(Hash, Bytes)>>;
}

/// `reqwest`-backed adapter using one POST for the size check and one
/// streamed GET per batch fetch.
pub struct HttpObjectServerClient {
    base_url: url::Url,
    http: reqwest::Client,
}

impl HttpObjectServerClient {
    pub fn new(base_url: url::Url) -> Self {
        HttpObjectServerClient {
            base_url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ObjectServerClient for HttpObjectServerClient {
    async fn check_objects(&self, hashes: &[Hash]) -> anyhow::Result<Vec<u64>> {
        let url = self.base_url.join("objects/check")?;
        let body: Vec<String> = hashes.iter().map(|h| h.to_hex()).collect();
        let resp = self.http.post(url).json(&body).send().await?.error_for_status()?;
        let sizes: Vec<u64> = resp.json().await?;
        Ok(sizes)
    }

    async fn get_objects(&self, hashes: &[Hash]) -> anyhow::Result<Vec<(Hash, Bytes)>> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let url = self.base_url.join(&format!("objects/{}", hash.to_hex()))?;
            let resp = self.http.get(url).send().await?.error_for_status()?;
            let bytes = resp.bytes().await?;
            out.push((*hash, bytes));
        }
        Ok(out)
    }
}
