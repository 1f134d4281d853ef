//! Module-artifact cache: opaque names mapped to immutable blobs.
//!
//! Cache files are stored under the SHA-256 digest of the artifact name,
//! hex encoded and sharded by its first two characters:
//!
//! ```text
//! SHA256("fizzlepug") → 160db4…b2d6
//! <cache-dir>/module/16/160db4…b2d6
//! ```
//!
//! The same layout keys the remote store, under the configured prefix. The
//! local file doubles as deduplication: a re-put of a name that already has
//! a local copy does no remote work.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::metrics::Counter;
use crate::s3::{join_key, ObjectStore};
use crate::stage::{shard_path, write_atomic};
use crate::types::{Error, Result};
use crate::uploader::Uploader;

#[derive(Debug, Default, Serialize)]
pub struct ModuleMetrics {
    pub get_request: Counter,
    pub get_local_hit: Counter,
    pub get_local_miss: Counter,
    pub get_fault_hit: Counter,
    pub get_fault_miss: Counter,
    pub get_local_error: Counter,
    pub get_fault_error: Counter,
    pub get_local_bytes: Counter,
    pub get_remote_bytes: Counter,
    pub put_request: Counter,
    pub put_local_hit: Counter,
    pub put_local_error: Counter,
    pub put_remote_error: Counter,
    pub put_local_bytes: Counter,
    pub put_remote_bytes: Counter,
}

/// The two-operation cache interface consumed by a module proxy front end.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Fetch the blob for `name`, or `None` when it exists in neither tier.
    async fn get(&self, name: &str) -> Result<Option<tokio::fs::File>>;

    /// Store the blob for `name`.
    async fn put(&self, name: &str, data: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()>;
}

pub struct ModuleCacheConfig {
    pub key_prefix: String,
    /// Concurrent remote operations; 0 means one per CPU.
    pub max_tasks: usize,
    pub upload_timeout: Duration,
    /// Detailed (noisy) per-request logging.
    pub log_requests: bool,
}

impl Default for ModuleCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            max_tasks: 0,
            upload_timeout: Duration::from_secs(60),
            log_requests: false,
        }
    }
}

/// Single-key tiered cache for module artifacts.
pub struct ModuleCache {
    local: PathBuf,
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
    sema: Arc<Semaphore>,
    uploader: Uploader,
    log_requests: bool,
    metrics: Arc<ModuleMetrics>,
}

impl ModuleCache {
    pub fn new(local: impl Into<PathBuf>, store: Arc<dyn ObjectStore>, config: ModuleCacheConfig) -> Self {
        let max_tasks = if config.max_tasks == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            config.max_tasks
        };
        Self {
            local: local.into(),
            store,
            key_prefix: config.key_prefix,
            sema: Arc::new(Semaphore::new(max_tasks)),
            uploader: Uploader::new(max_tasks, config.upload_timeout),
            log_requests: config.log_requests,
            metrics: Arc::new(ModuleMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<ModuleMetrics> {
        Arc::clone(&self.metrics)
    }

    fn hash_name(name: &str) -> String {
        hex::encode(Sha256::digest(name.as_bytes()))
    }

    fn make_key(&self, hash: &str) -> String {
        join_key([self.key_prefix.as_str(), &hash[..2], hash])
    }

    fn vlog(&self, msg: &str, name: &str, detail: &str) {
        if self.log_requests {
            debug!(name, detail, "{msg}");
        }
    }

    /// Wait for background writes to finish.
    pub async fn close(&self) {
        self.uploader.wait().await;
    }
}

#[async_trait]
impl ArtifactCache for ModuleCache {
    async fn get(&self, name: &str) -> Result<Option<tokio::fs::File>> {
        self.metrics.get_request.incr();
        let hash = Self::hash_name(name);
        let path = shard_path(&self.local, &hash);
        self.vlog("module get", name, &hash);

        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                self.metrics.get_local_hit.incr();
                if let Ok(meta) = file.metadata().await {
                    self.metrics.get_local_bytes.add(meta.len());
                }
                return Ok(Some(file));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.metrics.get_local_miss.incr();
            }
            Err(e) => {
                self.metrics.get_local_error.incr();
                warn!(name, error = %e, "local module read failed, treating as miss");
            }
        }

        // Local miss; fault in from the remote store under a task slot.
        let _slot = self
            .sema
            .acquire()
            .await
            .map_err(|_| Error::Store("module cache closed".into()))?;
        let mut body = match self.store.get(&self.make_key(&hash)).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => {
                self.metrics.get_fault_miss.incr();
                return Ok(None);
            }
            Err(e) => {
                self.metrics.get_fault_error.incr();
                return Err(e);
            }
        };
        self.metrics.get_fault_hit.incr();
        self.vlog("module get fault hit", name, &hash);

        let n = write_atomic(&path, &mut body, 0o644).await?;
        self.metrics.get_remote_bytes.add(n);

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::file("open module", &path, e))?;
        Ok(Some(file))
    }

    async fn put(&self, name: &str, data: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
        self.metrics.put_request.incr();
        let hash = Self::hash_name(name);
        let path = shard_path(&self.local, &hash);
        self.vlog("module put", name, &hash);

        if tokio::fs::metadata(&path).await.is_ok() {
            self.metrics.put_local_hit.incr();
            return Ok(());
        }

        let n = match write_atomic(&path, data, 0o644).await {
            Ok(n) => n,
            Err(e) => {
                self.metrics.put_local_error.incr();
                return Err(e);
            }
        };
        self.metrics.put_local_bytes.add(n);

        // Push the blob to the remote store in the background, reading back
        // from the just-written local file.
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let key = self.make_key(&hash);
        self.uploader
            .spawn("module-cache", async move {
                match store.put_file(&key, &path).await {
                    Ok(()) => {
                        metrics.put_remote_bytes.add(n);
                        Ok(())
                    }
                    Err(e) => {
                        metrics.put_remote_error.incr();
                        Err(e)
                    }
                }
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_hash_is_stable() {
        let h = ModuleCache::hash_name("fizzlepug");
        assert_eq!(h, ModuleCache::hash_name("fizzlepug"));
        assert_eq!(h.len(), 64);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(h, ModuleCache::hash_name("fizzlepug2"));
    }
}
