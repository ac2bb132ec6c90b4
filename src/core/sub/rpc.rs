// src/core/sub/rpc.rs

use crate::core::hash::Hash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A sub's reported filesystem state: path to content hash, for regular
/// files the sub currently has on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSystem {
    pub files: HashMap<String, Hash>,
}

/// The sub's reply to a `poll` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PollReply {
    Unchanged,
    Snapshot {
        filesystem: FileSystem,
        object_hashes: Vec<Hash>,
        trigger_state: HashMap<String, bool>,
    },
}

/// What to materialize, delete, or evaluate on the sub during an update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateManifest {
    pub files_to_materialize: HashMap<String, Hash>,
    pub files_to_delete: Vec<String>,
    pub symlinks: HashMap<String, String>,
    pub directories_to_create: Vec<String>,
    pub directories_to_delete: Vec<String>,
    pub triggers_to_evaluate: Vec<String>,
}

/// Per-trigger result returned after an update is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerOutcome {
    pub trigger: String,
    pub succeeded: bool,
    pub message: Option<String>,
}

/// The Herd's outbound contract to one sub, over a long-lived connection.
#[async_trait]
pub trait SubRpcClient: Send + Sync {
    async fn poll(&self, generation_count: u64, have_image_config: bool) -> anyhow::Result<PollReply>;
    async fn fetch(&self, hashes: &[Hash]) -> anyhow::Result<()>;
    async fn update(&self, manifest: &UpdateManifest) -> anyhow::Result<Vec<TriggerOutcome>>;
    async fn cleanup(&self, hashes: &[Hash]) -> anyhow::Result<()>;
}

/// Newline-delimited JSON framing over a `ReverseDialer`-obtained stream.
/// Transport framing is a minimal adapter, not the focus of this crate;
/// production deployments would use a typed RPC framework instead.
pub struct FramedSubRpcClient<S> {
    stream: tokio::sync::Mutex<S>,
}

impl<S> FramedSubRpcClient<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        FramedSubRpcClient {
            stream: tokio::sync::Mutex::new(stream),
        }
    }

    async fn send_and_receive<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        request: &Req,
    ) -> anyhow::Result<Resp> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

        let mut stream = self.stream.lock().await;
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut *stream);
        let mut response_line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = reader.read(&mut byte).await?;
            if n == 0 {
                anyhow::bail!("sub connection closed before a response arrived");
            }
            if byte[0] == b'\n' {
                break;
            }
            response_line.push(byte[0]);
        }
        Ok(serde_json::from_slice(&response_line)?)
    }
}

#[derive(Serialize)]
#[serde(tag = "op")]
enum Request<'a> {
    Poll { generation_count: u64, have_image_config: bool },
    Fetch { hashes: &'a [Hash] },
    Update { manifest: &'a UpdateManifest },
    Cleanup { hashes: &'a [Hash] },
}

#[async_trait]
impl<S> SubRpcClient for FramedSubRpcClient<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn poll(&self, generation_count: u64, have_image_config: bool) -> anyhow::Result<PollReply> {
        self.send_and_receive(&Request::Poll {
            generation_count,
            have_image_config,
        })
        .await
    }

    async fn fetch(&self, hashes: &[Hash]) -> anyhow::Result<()> {
        self.send_and_receive(&Request::Fetch { hashes }).await
    }

    async fn update(&self, manifest: &UpdateManifest) -> anyhow::Result<Vec<TriggerOutcome>> {
        self.send_and_receive(&Request::Update { manifest }).await
    }

    async fn cleanup(&self, hashes: &[Hash]) -> anyhow::Result<()> {
        self.send_and_receive(&Request::Cleanup { hashes }).await
    }
}
