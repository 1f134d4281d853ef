//! Build-cache engine: toolchain actions mapped to output objects, staged
//! locally and written through to the object store.
//!
//! # Remote layout
//!
//! Within the bucket, keys are organized into two groups. Each action is
//! stored under `[<prefix>/]action/<xx>/<action-id>` and each output object
//! under `[<prefix>/]output/<xx>/<output-id>`, where `<xx>` is the first two
//! characters of the hex id, partitioning the key space.
//!
//! The action object holds a single line `<output-id> <unix-nanos>`; the
//! output object holds the raw bytes.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncRead;
use tracing::{info, warn};

use crate::metrics::Counter;
use crate::s3::digest::DigestReader;
use crate::s3::{join_key, ObjectStore};
use crate::stage::{check_id, ActionRecord, CacheDir};
use crate::types::{Error, Result};
use crate::uploader::Uploader;

#[derive(Debug, Default, Serialize)]
pub struct BuildMetrics {
    /// Get hits served from the local stage.
    pub get_local_hit: Counter,
    /// Get hits faulted in from the remote store.
    pub get_fault_hit: Counter,
    /// Get faults that were remote misses.
    pub get_fault_miss: Counter,
    /// Remote action records that failed to parse.
    pub get_malformed: Counter,
    /// Objects below the upload threshold, kept local only.
    pub put_skip_small: Counter,
    /// Objects skipped because the remote etag already matched.
    pub put_remote_found: Counter,
    /// Objects written to the remote store.
    pub put_remote_object: Counter,
    /// Action records written to the remote store.
    pub put_remote_action: Counter,
    /// Errors writing to the remote store.
    pub put_remote_error: Counter,
}

/// One toolchain put: an action, the output that satisfies it, and the
/// output bytes.
pub struct PutRequest<R> {
    pub action_id: String,
    pub output_id: String,
    pub size: u64,
    pub body: R,
    pub mod_time: SystemTime,
}

/// Settings for [`BuildCache`].
pub struct BuildCacheConfig {
    pub key_prefix: String,
    /// Objects smaller than this are not written to the remote store.
    pub min_upload_size: u64,
    /// Concurrent remote writers; 0 means one per CPU.
    pub upload_concurrency: usize,
    pub upload_timeout: Duration,
}

impl Default for BuildCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            min_upload_size: 0,
            upload_concurrency: 0,
            upload_timeout: Duration::from_secs(60),
        }
    }
}

/// Two-key cache engine over a local stage and a remote object store.
pub struct BuildCache {
    stage: Arc<CacheDir>,
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
    min_upload_size: u64,
    uploader: Uploader,
    metrics: Arc<BuildMetrics>,
}

impl BuildCache {
    pub fn new(stage: Arc<CacheDir>, store: Arc<dyn ObjectStore>, config: BuildCacheConfig) -> Self {
        Self {
            stage,
            store,
            key_prefix: config.key_prefix,
            min_upload_size: config.min_upload_size,
            uploader: Uploader::new(config.upload_concurrency, config.upload_timeout),
            metrics: Arc::new(BuildMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<BuildMetrics> {
        Arc::clone(&self.metrics)
    }

    fn action_key(&self, id: &str) -> String {
        join_key([self.key_prefix.as_str(), "action", &id[..2], id])
    }

    fn output_key(&self, id: &str) -> String {
        join_key([self.key_prefix.as_str(), "output", &id[..2], id])
    }

    /// Look up an action. Returns the output id and the local path holding
    /// the output bytes, or `None` on a miss in both tiers.
    ///
    /// A remote action whose output object is absent is an error, not a
    /// miss: the action claimed the object exists, so the cache is torn for
    /// this key and the caller must see that.
    pub async fn get(&self, action_id: &str) -> Result<Option<(String, PathBuf)>> {
        check_id(action_id)?;

        if let Some((output_id, path)) = self.stage.get(action_id).await? {
            self.metrics.get_local_hit.incr();
            return Ok(Some((output_id, path)));
        }

        let data = match self.store.get_bytes(&self.action_key(action_id)).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                self.metrics.get_fault_miss.incr();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let record = ActionRecord::parse(&data).inspect_err(|e| {
            self.metrics.get_malformed.incr();
            warn!(action = action_id, error = %e, "remote action record unreadable");
        })?;
        check_id(&record.output_id)?;

        let mut body = match self.store.get(&self.output_key(&record.output_id)).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => {
                return Err(Error::Store(format!(
                    "output {} missing for action {action_id}",
                    record.output_id
                )));
            }
            Err(e) => return Err(e),
        };
        self.metrics.get_fault_hit.incr();

        let path = self
            .stage
            .put(action_id, &record.output_id, &mut body, record.mod_time())
            .await?;
        Ok(Some((record.output_id, path)))
    }

    /// Store an output and its action record. The local write is
    /// synchronous; the remote write-behind runs in the background in two
    /// stages, object first, so a consumer never observes an action record
    /// pointing at a missing object.
    pub async fn put<R>(&self, req: PutRequest<R>) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin + Send,
    {
        check_id(&req.action_id)?;
        check_id(&req.output_id)?;

        // The digest accumulates while the stage copies the bytes, so the
        // conditional upload needs no extra pass over the data.
        let mut body = DigestReader::new(req.body);
        let disk_path = self
            .stage
            .put(&req.action_id, &req.output_id, &mut body, req.mod_time)
            .await?;

        if req.size < self.min_upload_size {
            self.metrics.put_skip_small.incr();
            return Ok(disk_path);
        }

        let etag = body.digest();
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let action_key = self.action_key(&req.action_id);
        let output_key = self.output_key(&req.output_id);
        let output_id = req.output_id.clone();
        let path = disk_path.clone();

        self.uploader
            .spawn("build-cache", async move {
                // Stage A: the object, skipped when the remote etag already
                // matches.
                let mod_time = tokio::fs::metadata(&path)
                    .await
                    .and_then(|m| m.modified())
                    .map_err(|e| Error::file("stat staged output", &path, e))?;
                match store.put_conditional(&output_key, &etag, &path).await {
                    Ok(true) => metrics.put_remote_object.incr(),
                    Ok(false) => metrics.put_remote_found.incr(),
                    Err(e) => {
                        metrics.put_remote_error.incr();
                        return Err(e);
                    }
                }

                // Stage B: the action record naming the object.
                let record = ActionRecord::new(output_id, mod_time);
                match store.put_bytes(&action_key, record.encode().into()).await {
                    Ok(()) => metrics.put_remote_action.incr(),
                    Err(e) => {
                        metrics.put_remote_error.incr();
                        return Err(e);
                    }
                }
                Ok(())
            })
            .await;

        Ok(disk_path)
    }

    /// Wait for all background uploads to finish.
    pub async fn close(&self) {
        let start = std::time::Instant::now();
        self.uploader.wait().await;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "uploads complete");
    }
}
