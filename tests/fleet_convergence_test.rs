//! End-to-end convergence test driving a `Sub` through a real poll/fetch/
//! update exchange over an in-memory duplex stream, speaking the same
//! newline-delimited JSON wire protocol `FramedSubRpcClient` uses against
//! a real subd. The other end of the duplex is a small fake subd that
//! only knows how to answer the requests this scenario issues.

use herd::core::computed_files::ComputedFilesManager;
use herd::core::cpu_sharer::CpuSharer;
use herd::core::errors::HerdResult;
use herd::core::hash::Hash;
use herd::core::herd::Herd;
use herd::core::image::{HttpImageServerClient, Image, ImageManager, ImageServerClient, Inode};
use herd::core::mdb::{Machine, Mdb};
use herd::core::reverse_dialer::ReverseDialer;
use herd::core::sub::{FramedSubRpcClient, SubRpcClient, SubStatus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn test_herd() -> Arc<Herd> {
    let cpu_sharer = Arc::new(CpuSharer::new(1.0));
    let dialer = Arc::new(ReverseDialer::new(cpu_sharer.clone(), Some(Duration::from_secs(1)), None));
    let image_client = Arc::new(HttpImageServerClient::new(url::Url::parse("http://localhost/").unwrap()));
    let image_manager = Arc::new(ImageManager::new(image_client as Arc<dyn ImageServerClient>));
    let computed_files = Arc::new(ComputedFilesManager::new());
    Arc::new(Herd::new(cpu_sharer, dialer, image_manager, computed_files, 100, false))
}

fn web_image(content_hash: Hash) -> Image {
    let mut inodes = HashMap::new();
    inodes.insert(
        "/etc/web.conf".to_string(),
        Inode::RegularFile { hash: content_hash, len: 11 },
    );
    Image {
        name: "web".to_string(),
        inodes,
        filter: None,
        triggers: Vec::new(),
    }
}

/// Reads one newline-delimited JSON request and answers it according to
/// `script`: a map from the request's `op` tag to a canned response value.
/// Reports each op it saw on `seen_tx` before replying, then runs until
/// the stream closes.
async fn fake_subd(
    stream: tokio::io::DuplexStream,
    script: HashMap<&'static str, Value>,
    seen_tx: tokio::sync::mpsc::UnboundedSender<String>,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        let request: Value = serde_json::from_str(line.trim()).unwrap();
        let op = request["op"].as_str().unwrap();
        let _ = seen_tx.send(op.to_string());
        let response = script.get(op).cloned().unwrap_or(Value::Null);
        let mut out = serde_json::to_vec(&response).unwrap();
        out.push(b'\n');
        write_half.write_all(&out).await.unwrap();
    }
}

// A new machine with a delta against its required image converges: poll
// returns a snapshot missing the file, the sub fetches and updates, and
// ends up synced.
#[tokio::test]
async fn sub_converges_to_required_image() -> HerdResult<()> {
    let herd = test_herd();
    let machine = Machine {
        hostname: "h1".to_string(),
        ip_address: "h1".to_string(),
        required_image: "web".to_string(),
        ..Default::default()
    };
    herd.mdb_update(Mdb::sorted(vec![machine]));
    let sub = herd.get_sub("h1").expect("sub created by mdb_update");

    let content_hash = Hash::of(b"hello world");
    let image = Arc::new(web_image(content_hash));

    let (client_side, subd_side) = tokio::io::duplex(8192);
    herd.reverse_dialer.register_reverse("h1".to_string(), Box::new(client_side));

    let mut script = HashMap::new();
    script.insert(
        "Poll",
        json!({
            "Snapshot": {
                "filesystem": { "files": {} },
                "object_hashes": [],
                "trigger_state": {}
            }
        }),
    );
    script.insert("Fetch", Value::Null);
    script.insert("Update", json!([]));
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let subd = tokio::spawn(fake_subd(subd_side, script, seen_tx));

    let computed_files = ComputedFilesManager::new();
    let reverse_dialer = Arc::clone(&herd.reverse_dialer);
    let retry_reasonable = sub
        .connect_and_poll(
            &reverse_dialer,
            |stream| -> Arc<dyn SubRpcClient> { Arc::new(FramedSubRpcClient::new(stream)) },
            Some(image),
            &computed_files,
            false,
        )
        .await?;

    assert!(!retry_reasonable);
    assert_eq!(sub.status(), SubStatus::WaitingToPoll);

    let mut ops = Vec::new();
    while let Ok(op) = seen_rx.try_recv() {
        ops.push(op);
    }
    assert_eq!(ops, vec!["Poll", "Fetch", "Update"]);

    drop(subd);
    Ok(())
}

// A sub already in sync with its required image stays synced without
// issuing a fetch or update.
#[tokio::test]
async fn sub_already_synced_skips_update() -> HerdResult<()> {
    let herd = test_herd();
    let machine = Machine {
        hostname: "h2".to_string(),
        ip_address: "h2".to_string(),
        required_image: "web".to_string(),
        ..Default::default()
    };
    herd.mdb_update(Mdb::sorted(vec![machine]));
    let sub = herd.get_sub("h2").expect("sub created by mdb_update");

    let content_hash = Hash::of(b"hello world");
    let image = Arc::new(web_image(content_hash));

    let (client_side, subd_side) = tokio::io::duplex(8192);
    herd.reverse_dialer.register_reverse("h2".to_string(), Box::new(client_side));

    let mut script = HashMap::new();
    script.insert(
        "Poll",
        json!({
            "Snapshot": {
                "filesystem": { "files": { "/etc/web.conf": content_hash.to_hex() } },
                "object_hashes": [],
                "trigger_state": {}
            }
        }),
    );
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let subd = tokio::spawn(fake_subd(subd_side, script, seen_tx));

    let computed_files = ComputedFilesManager::new();
    let reverse_dialer = Arc::clone(&herd.reverse_dialer);
    let retry_reasonable = sub
        .connect_and_poll(
            &reverse_dialer,
            |stream| -> Arc<dyn SubRpcClient> { Arc::new(FramedSubRpcClient::new(stream)) },
            Some(image),
            &computed_files,
            false,
        )
        .await?;

    assert!(!retry_reasonable);
    assert_eq!(sub.status(), SubStatus::Synced);

    drop(subd);
    let mut ops = Vec::new();
    while let Ok(op) = seen_rx.try_recv() {
        ops.push(op);
    }
    assert_eq!(ops, vec!["Poll"]);
    Ok(())
}

// Disabling updates fleet-wide stops a sub with a real delta from being
// pushed, but polling still happens.
#[tokio::test]
async fn updates_disabled_blocks_push_but_not_poll() -> HerdResult<()> {
    let herd = test_herd();
    let machine = Machine {
        hostname: "h3".to_string(),
        ip_address: "h3".to_string(),
        required_image: "web".to_string(),
        ..Default::default()
    };
    herd.mdb_update(Mdb::sorted(vec![machine]));
    herd.disable_updates("oncall", "investigating regression").unwrap();
    let sub = herd.get_sub("h3").expect("sub created by mdb_update");

    let content_hash = Hash::of(b"hello world");
    let image = Arc::new(web_image(content_hash));

    let (client_side, subd_side) = tokio::io::duplex(8192);
    herd.reverse_dialer.register_reverse("h3".to_string(), Box::new(client_side));

    let mut script = HashMap::new();
    script.insert(
        "Poll",
        json!({
            "Snapshot": {
                "filesystem": { "files": {} },
                "object_hashes": [],
                "trigger_state": {}
            }
        }),
    );
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let subd = tokio::spawn(fake_subd(subd_side, script, seen_tx));

    let computed_files = ComputedFilesManager::new();
    let reverse_dialer = Arc::clone(&herd.reverse_dialer);
    let retry_reasonable = sub
        .connect_and_poll(
            &reverse_dialer,
            |stream| -> Arc<dyn SubRpcClient> { Arc::new(FramedSubRpcClient::new(stream)) },
            Some(image),
            &computed_files,
            true,
        )
        .await?;

    assert!(!retry_reasonable);
    assert_eq!(sub.status(), SubStatus::WaitingToPoll);

    drop(subd);
    let mut ops = Vec::new();
    while let Ok(op) = seen_rx.try_recv() {
        ops.push(op);
    }
    assert_eq!(ops, vec!["Poll"]);
    Ok(())
}
