//! Toolchain cache protocol server.
//!
//! Speaks a newline-delimited JSON protocol over a byte stream (normally
//! stdin/stdout) and drives the build cache callbacks. One request per
//! line:
//!
//! ```text
//! {"id":1,"command":"get","action_id":"<hex>"}
//! {"id":2,"command":"put","action_id":"<hex>","output_id":"<hex>",
//!  "size":5,"body":"<base64>","mod_time_nanos":1700000000000000000}
//! {"id":3,"command":"close"}
//! ```
//!
//! Responses carry the same `id`. A miss is `{"id":1,"miss":true}`; errors
//! are reported per request as `{"id":n,"err":"..."}` and never tear down
//! the connection. Requests run concurrently up to a configured limit, but
//! `close` drains everything in flight, then the background uploads, before
//! its response is sent.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::warn;

use crate::build::{BuildCache, PutRequest};
use crate::types::{Error, Result};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Command {
    Get,
    Put,
    Close,
}

#[derive(Debug, Deserialize)]
struct WireRequest {
    id: u64,
    command: Command,
    #[serde(default)]
    action_id: Option<String>,
    #[serde(default)]
    output_id: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    /// Output bytes, base64 encoded.
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    mod_time_nanos: Option<i64>,
}

#[derive(Debug, Default, Serialize)]
struct WireResponse {
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    miss: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<String>,
}

pub struct ProtocolServer {
    cache: Arc<BuildCache>,
    max_requests: usize,
}

impl ProtocolServer {
    /// `max_requests` = 0 means one per CPU.
    pub fn new(cache: Arc<BuildCache>, max_requests: usize) -> Self {
        let max_requests = if max_requests == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            max_requests
        };
        Self {
            cache,
            max_requests,
        }
    }

    /// Serve requests from `input` until EOF or a `close` command, writing
    /// responses to `output`. Responses may arrive out of request order.
    pub async fn serve<R, W>(&self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<WireResponse>(64);
        let writer = tokio::spawn(async move {
            let mut output = output;
            while let Some(rsp) = rx.recv().await {
                let mut line = match serde_json::to_vec(&rsp) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "response serialization failed");
                        continue;
                    }
                };
                line.push(b'\n');
                if output.write_all(&line).await.is_err() {
                    break;
                }
                let _ = output.flush().await;
            }
        });

        let limit = Arc::new(Semaphore::new(self.max_requests));
        let mut in_flight = JoinSet::new();
        let mut lines = BufReader::new(input).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let req: WireRequest = match serde_json::from_str(&line) {
                Ok(req) => req,
                Err(e) => {
                    warn!(error = %e, "dropping unparseable request line");
                    continue;
                }
            };

            if matches!(req.command, Command::Close) {
                while in_flight.join_next().await.is_some() {}
                self.cache.close().await;
                let _ = tx
                    .send(WireResponse {
                        id: req.id,
                        ..Default::default()
                    })
                    .await;
                break;
            }

            let permit = match Arc::clone(&limit).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let cache = Arc::clone(&self.cache);
            let tx = tx.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let id = req.id;
                let rsp = match run_command(&cache, req).await {
                    Ok(rsp) => rsp,
                    Err(e) => WireResponse {
                        id,
                        err: Some(e.to_string()),
                        ..Default::default()
                    },
                };
                let _ = tx.send(rsp).await;
            });
        }

        while in_flight.join_next().await.is_some() {}
        drop(tx);
        let _ = writer.await;
        Ok(())
    }
}

async fn run_command(cache: &BuildCache, req: WireRequest) -> Result<WireResponse> {
    let id = req.id;
    match req.command {
        Command::Get => {
            let action_id = req
                .action_id
                .ok_or_else(|| Error::malformed("request", "get requires action_id"))?;
            match cache.get(&action_id).await? {
                Some((output_id, path)) => {
                    let size = tokio::fs::metadata(&path).await.map(|m| m.len()).ok();
                    Ok(WireResponse {
                        id,
                        output_id: Some(output_id),
                        disk_path: Some(path.display().to_string()),
                        size,
                        ..Default::default()
                    })
                }
                None => Ok(WireResponse {
                    id,
                    miss: Some(true),
                    ..Default::default()
                }),
            }
        }
        Command::Put => {
            let action_id = req
                .action_id
                .ok_or_else(|| Error::malformed("request", "put requires action_id"))?;
            let output_id = req
                .output_id
                .ok_or_else(|| Error::malformed("request", "put requires output_id"))?;
            let body = match req.body {
                Some(encoded) => BASE64
                    .decode(encoded)
                    .map_err(|e| Error::malformed("request body", e.to_string()))?,
                None => Vec::new(),
            };
            let size = req.size.unwrap_or(body.len() as u64);
            let mod_time = match req.mod_time_nanos {
                Some(nanos) if nanos >= 0 => {
                    SystemTime::UNIX_EPOCH + Duration::from_nanos(nanos as u64)
                }
                _ => SystemTime::now(),
            };
            let path = cache
                .put(PutRequest {
                    action_id,
                    output_id,
                    size,
                    body: std::io::Cursor::new(body),
                    mod_time,
                })
                .await?;
            Ok(WireResponse {
                id,
                disk_path: Some(path.display().to_string()),
                ..Default::default()
            })
        }
        Command::Close => Ok(WireResponse {
            id,
            ..Default::default()
        }),
    }
}
