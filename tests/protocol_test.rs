//! Toolchain protocol round-trip tests over in-memory pipes.

mod common;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::MemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use stockpile::build::{BuildCache, BuildCacheConfig};
use stockpile::protocol::ProtocolServer;
use stockpile::stage::CacheDir;

const ACTION: &str = "2c11223344556677889900aabbccddee";
const OUTPUT: &str = "3dff00112233445566778899aabbccdd";

struct Client {
    input: tokio::io::DuplexStream,
    output: BufReader<tokio::io::DuplexStream>,
    server: tokio::task::JoinHandle<stockpile::Result<()>>,
}

fn start(store: Arc<MemoryStore>, dir: &std::path::Path) -> Client {
    let cache = Arc::new(BuildCache::new(
        Arc::new(CacheDir::new(dir).unwrap()),
        store,
        BuildCacheConfig::default(),
    ));
    let (client_in, server_in) = tokio::io::duplex(1 << 16);
    let (server_out, client_out) = tokio::io::duplex(1 << 16);
    let server = tokio::spawn(async move {
        ProtocolServer::new(cache, 4).serve(server_in, server_out).await
    });
    Client {
        input: client_in,
        output: BufReader::new(client_out),
        server,
    }
}

impl Client {
    async fn round_trip(&mut self, req: Value) -> Value {
        let mut line = req.to_string();
        line.push('\n');
        self.input.write_all(line.as_bytes()).await.unwrap();
        let mut rsp = String::new();
        self.output.read_line(&mut rsp).await.unwrap();
        serde_json::from_str(&rsp).unwrap()
    }
}

#[tokio::test]
async fn get_put_get_close() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let mut client = start(Arc::clone(&store), dir.path());

    // Cold get misses.
    let rsp = client
        .round_trip(json!({"id": 1, "command": "get", "action_id": ACTION}))
        .await;
    assert_eq!(rsp["id"], 1);
    assert_eq!(rsp["miss"], true);

    // Put stages locally and reports the disk path.
    let body = b"output object";
    let rsp = client
        .round_trip(json!({
            "id": 2,
            "command": "put",
            "action_id": ACTION,
            "output_id": OUTPUT,
            "size": body.len(),
            "body": BASE64.encode(body),
            "mod_time_nanos": 1_700_000_000_000_000_000u64,
        }))
        .await;
    assert_eq!(rsp["id"], 2);
    let disk_path = rsp["disk_path"].as_str().expect("disk path");
    assert_eq!(std::fs::read(disk_path).unwrap(), body);

    // The following get hits locally.
    let rsp = client
        .round_trip(json!({"id": 3, "command": "get", "action_id": ACTION}))
        .await;
    assert_eq!(rsp["output_id"], OUTPUT);
    assert_eq!(rsp["size"], body.len());
    assert!(rsp.get("miss").is_none());

    // Close drains the background uploads before responding.
    let rsp = client.round_trip(json!({"id": 4, "command": "close"})).await;
    assert_eq!(rsp["id"], 4);
    assert!(store.contains(&format!("output/{}/{}", &OUTPUT[..2], OUTPUT)));
    assert!(store.contains(&format!("action/{}/{}", &ACTION[..2], ACTION)));

    client.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn errors_are_reported_per_request() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let mut client = start(store, dir.path());

    // Bad identifier: the request fails, the connection survives.
    let rsp = client
        .round_trip(json!({"id": 7, "command": "get", "action_id": "zz"}))
        .await;
    assert_eq!(rsp["id"], 7);
    assert!(rsp["err"].as_str().is_some());

    let rsp = client
        .round_trip(json!({"id": 8, "command": "get", "action_id": ACTION}))
        .await;
    assert_eq!(rsp["miss"], true);

    let rsp = client.round_trip(json!({"id": 9, "command": "close"})).await;
    assert_eq!(rsp["id"], 9);
    client.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn eof_without_close_still_shuts_down() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let client = start(store, dir.path());

    drop(client.input);
    client.server.await.unwrap().unwrap();
}
