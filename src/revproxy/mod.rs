//! Caching reverse HTTP proxy.
//!
//! Requests whose URL host matches a configured target are served through a
//! three-tier cache (memory, local disk, remote store) keyed by a SHA-256
//! fingerprint of the request URL; anything else is rejected with 502.
//!
//! Only responses marked `immutable` are persisted to disk and the remote
//! store. Volatile responses carrying a `max-age` are held in memory only,
//! capped at one hour. Responses served by the proxy carry an `X-Cache`
//! header describing how they were obtained:
//!
//! - `hit, memory` / `hit, local` / `hit, remote`: served from a cache tier.
//! - `fetch, cached`: forwarded and stored durably.
//! - `fetch, cached, volatile`: forwarded and stored in memory.
//! - `fetch, uncached`: forwarded and not stored.
//!
//! Results intersecting the cache also carry `X-Cache-Id`, the leading hex
//! of the fingerprint.

pub mod connect;
pub mod object;

use bytes::Bytes;
use futures_util::stream::Stream;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, HOST};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::metrics::Counter;
use crate::s3::{join_key, ObjectStore};
use crate::stage::{shard_path, write_atomic};
use crate::types::Result;
use crate::uploader::Uploader;
use object::{parse_cache_object, write_cache_object, MemoryCache, MEMORY_CACHE_ENTRIES};

pub type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, std::io::Error>;

#[derive(Debug, Default, Serialize)]
pub struct ProxyMetrics {
    pub req_received: Counter,
    pub req_memory_hit: Counter,
    pub req_local_hit: Counter,
    pub req_local_miss: Counter,
    pub req_fault_hit: Counter,
    pub req_fault_miss: Counter,
    pub req_forward: Counter,
    pub rsp_save: Counter,
    pub rsp_save_memory: Counter,
    pub rsp_save_error: Counter,
    pub rsp_save_bytes: Counter,
    pub rsp_push: Counter,
    pub rsp_push_error: Counter,
    pub rsp_push_bytes: Counter,
    pub rsp_not_cached: Counter,
}

pub struct ProxyConfig {
    /// Hosts the proxy will forward for: exact names, or `*.domain` patterns
    /// matching the domain itself and any subdomain of it.
    pub targets: Vec<String>,
    pub key_prefix: String,
    /// Concurrent remote writers; 0 means one per CPU.
    pub upload_concurrency: usize,
    pub upload_timeout: Duration,
}

/// The reverse proxy handler and its cache tiers.
pub struct ProxyServer {
    targets: Vec<String>,
    local: PathBuf,
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
    client: reqwest::Client,
    uploader: Uploader,
    memory: MemoryCache,
    metrics: Arc<ProxyMetrics>,
}

/// What to do with a forwarded response once it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorePolicy {
    /// Persist to local disk and the remote store.
    Durable,
    /// Hold in memory only, for the given lifetime.
    Volatile(Duration),
    /// Do not store.
    Skip,
}

impl ProxyServer {
    pub fn new(
        local: impl Into<PathBuf>,
        store: Arc<dyn ObjectStore>,
        config: ProxyConfig,
    ) -> Result<Self> {
        // Redirects pass through to the client untouched.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            targets: config.targets,
            local: local.into(),
            store,
            key_prefix: config.key_prefix,
            client,
            uploader: Uploader::new(config.upload_concurrency, config.upload_timeout),
            memory: MemoryCache::new(MEMORY_CACHE_ENTRIES),
            metrics: Arc::new(ProxyMetrics::default()),
        })
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Wait for background pushes to finish.
    pub async fn close(&self) {
        self.uploader.wait().await;
    }

    fn make_key(&self, hash: &str) -> String {
        join_key([self.key_prefix.as_str(), &hash[..2], hash])
    }

    /// Serve one proxied request through the cache tiers.
    pub async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<BoxBody> {
        self.metrics.req_received.incr();

        let host = request_host(&req).unwrap_or_default();
        if !host_matches_target(&host, &self.targets) {
            debug!(host, uri = %req.uri(), "rejecting proxy request for non-target");
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("https://{host}{path_and_query}");
        let hash = hash_request_url(&url);

        let can_cache = req.method() == Method::GET
            && !cache_control_tokens(req.headers()).iter().any(|t| t == "no-store");

        if can_cache {
            if let Some((hdr, body)) = self.memory.get(&hash) {
                self.metrics.req_memory_hit.incr();
                return cached_response(&hdr, body, "hit, memory", &hash);
            }

            match self.load_local(&hash).await {
                Some((hdr, body)) => {
                    self.metrics.req_local_hit.incr();
                    return cached_response(&hdr, body, "hit, local", &hash);
                }
                None => self.metrics.req_local_miss.incr(),
            }

            match self.load_remote(&hash).await {
                Some((hdr, body, raw)) => {
                    self.metrics.req_fault_hit.incr();
                    // Repopulate the local tier opportunistically.
                    if let Err(e) = self.store_local(&hash, &raw).await {
                        warn!(hash, error = %e, "local cache update failed");
                    }
                    return cached_response(&hdr, body, "hit, remote", &hash);
                }
                None => self.metrics.req_fault_miss.incr(),
            }
        }

        self.metrics.req_forward.incr();
        self.forward(req, &url, hash, can_cache).await
    }

    async fn load_local(&self, hash: &str) -> Option<(HeaderMap, Bytes)> {
        let path = shard_path(&self.local, hash);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(hash, error = %e, "local cache read failed");
                return None;
            }
        };
        match parse_cache_object(data) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(hash, error = %e, "local cache object unreadable");
                None
            }
        }
    }

    async fn load_remote(&self, hash: &str) -> Option<(HeaderMap, Bytes, Bytes)> {
        let raw = match self.store.get_bytes(&self.make_key(hash)).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!(hash, error = %e, "remote cache read failed");
                return None;
            }
        };
        match parse_cache_object(raw.clone()) {
            Ok((hdr, body)) => Some((hdr, body, raw)),
            Err(e) => {
                warn!(hash, error = %e, "remote cache object unreadable");
                None
            }
        }
    }

    async fn store_local(&self, hash: &str, raw: &[u8]) -> Result<u64> {
        let path = shard_path(&self.local, hash);
        let mut cursor = std::io::Cursor::new(raw);
        write_atomic(&path, &mut cursor, 0o600).await
    }

    /// Forward the request upstream as HTTPS, streaming the response to the
    /// client while capturing it for cache storage when eligible.
    async fn forward(
        self: Arc<Self>,
        req: Request<Incoming>,
        url: &str,
        hash: String,
        can_cache: bool,
    ) -> Response<BoxBody> {
        let (parts, req_body) = req.into_parts();

        let mut upstream_req = self.client.request(parts.method.clone(), url);
        for (name, value) in parts.headers.iter() {
            if name == HOST || is_hop_header(name) {
                continue;
            }
            upstream_req = upstream_req.header(name, value);
        }
        if !matches!(parts.method, Method::GET | Method::HEAD) {
            upstream_req =
                upstream_req.body(reqwest::Body::wrap_stream(req_body.into_data_stream()));
        }

        let upstream = match upstream_req.send().await {
            Ok(rsp) => rsp,
            Err(e) => {
                warn!(%url, error = %e, "upstream fetch failed");
                return text_response(StatusCode::BAD_GATEWAY, "upstream fetch failed");
            }
        };

        let status = upstream.status();
        let mut headers = HeaderMap::new();
        for (name, value) in upstream.headers().iter() {
            if !is_hop_header(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        let policy = if can_cache {
            classify_response(status, upstream.headers())
        } else {
            StorePolicy::Skip
        };

        if can_cache {
            match policy {
                StorePolicy::Skip => {
                    self.metrics.rsp_not_cached.incr();
                    set_xcache(&mut headers, "fetch, uncached", "");
                }
                StorePolicy::Volatile(_) => set_xcache(&mut headers, "fetch, cached, volatile", &hash),
                StorePolicy::Durable => set_xcache(&mut headers, "fetch, cached", &hash),
            }
        }

        let cache_headers = upstream.headers().clone();
        let upstream_body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>> =
            Box::pin(upstream.bytes_stream());

        let body = if policy == StorePolicy::Skip {
            let pass = futures_util::StreamExt::map(upstream_body, |item| {
                item.map(Frame::data).map_err(std::io::Error::other)
            });
            StreamBody::new(pass).boxed_unsync()
        } else {
            // Tee the body: bytes reach the client as they arrive, and the
            // capture is finalized only when the upstream stream completes,
            // at which point the spawned task updates the cache.
            let (capture, finished) = CaptureStream::new(upstream_body);
            let me = Arc::clone(&self);
            let hash = hash.clone();
            tokio::spawn(async move {
                if let Ok(body) = finished.await {
                    me.update_cache(policy, &hash, &cache_headers, body).await;
                }
            });
            StreamBody::new(capture).boxed_unsync()
        };

        let mut response = Response::builder().status(status);
        if let Some(h) = response.headers_mut() {
            *h = headers;
        }
        response.body(body).unwrap_or_else(|_| {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
        })
    }

    async fn update_cache(&self, policy: StorePolicy, hash: &str, hdr: &HeaderMap, body: Vec<u8>) {
        match policy {
            StorePolicy::Volatile(ttl) => {
                self.memory.insert(hash, ttl, hdr, Bytes::from(body));
                self.metrics.rsp_save_memory.incr();
                // Volatile objects are never persisted to disk or the
                // remote store.
            }
            StorePolicy::Durable => {
                let object = write_cache_object(hdr, &body);
                match self.store_local(hash, &object).await {
                    Ok(_) => {
                        self.metrics.rsp_save.incr();
                        self.metrics.rsp_save_bytes.add(body.len() as u64);
                    }
                    Err(e) => {
                        self.metrics.rsp_save_error.incr();
                        warn!(hash, error = %e, "saving response to local cache failed");
                        // A failed local write suppresses the remote upload.
                        return;
                    }
                }

                let store = Arc::clone(&self.store);
                let metrics = Arc::clone(&self.metrics);
                let key = self.make_key(hash);
                let object = Bytes::from(object);
                let len = object.len() as u64;
                self.uploader
                    .spawn("revproxy", async move {
                        match store.put_bytes(&key, object).await {
                            Ok(()) => {
                                metrics.rsp_push.incr();
                                metrics.rsp_push_bytes.add(len);
                                Ok(())
                            }
                            Err(e) => {
                                metrics.rsp_push_error.incr();
                                Err(e)
                            }
                        }
                    })
                    .await;
            }
            StorePolicy::Skip => {}
        }
    }
}

/// Reports whether `host` is one of the configured targets. A target is
/// either an exact hostname, or `*.domain` matching both `domain` itself
/// and any name ending in `.domain`.
pub fn host_matches_target(host: &str, targets: &[String]) -> bool {
    if host.is_empty() {
        return false;
    }
    targets.iter().any(|t| {
        if t == host {
            return true;
        }
        match t.strip_prefix('*') {
            Some(tail) => host.ends_with(tail) || host == tail.strip_prefix('.').unwrap_or(tail),
            None => false,
        }
    })
}

/// The storage fingerprint for a request URL.
pub fn hash_request_url(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

fn cache_control_tokens(hdr: &HeaderMap) -> Vec<String> {
    hdr.get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn classify_response(status: StatusCode, hdr: &HeaderMap) -> StorePolicy {
    if status != StatusCode::OK {
        return StorePolicy::Skip;
    }
    let cc = cache_control_tokens(hdr);
    if cc.iter().any(|t| t == "no-store") {
        return StorePolicy::Skip;
    }
    if cc.iter().any(|t| t == "immutable") {
        return StorePolicy::Durable;
    }
    let max_age = cc
        .iter()
        .filter_map(|t| t.strip_prefix("max-age="))
        .filter_map(|v| v.parse::<u64>().ok())
        .next_back();
    match max_age {
        Some(secs) if secs > 0 => {
            StorePolicy::Volatile(Duration::from_secs(secs.min(3600)))
        }
        _ => StorePolicy::Skip,
    }
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }
    let raw = req.headers().get(HOST)?.to_str().ok()?;
    Some(strip_port(raw).to_string())
}

pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(end) = host.strip_prefix('[').and_then(|_| host.find(']')) {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}

fn is_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn set_xcache(hdr: &mut HeaderMap, result: &str, hash: &str) {
    if let Ok(v) = HeaderValue::from_str(result) {
        hdr.insert(HeaderName::from_static("x-cache"), v);
    }
    if hash.len() >= 12 {
        if let Ok(v) = HeaderValue::from_str(&hash[..12]) {
            hdr.insert(HeaderName::from_static("x-cache-id"), v);
        }
    }
}

fn cached_response(hdr: &HeaderMap, body: Bytes, result: &str, hash: &str) -> Response<BoxBody> {
    let mut headers = hdr.clone();
    set_xcache(&mut headers, result, hash);
    let mut response = Response::builder().status(StatusCode::OK);
    if let Some(h) = response.headers_mut() {
        *h = headers;
    }
    response
        .body(full_body(body))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
}

pub(crate) fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn text_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(full_body(msg.to_string()))
        .expect("static response")
}

/// Streams frames through to the client while buffering a copy; the buffer
/// is delivered on the oneshot only if the upstream body completes.
struct CaptureStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    captured: Option<(Vec<u8>, oneshot::Sender<Vec<u8>>)>,
}

impl CaptureStream {
    fn new(
        inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    ) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner,
                captured: Some((Vec::new(), tx)),
            },
            rx,
        )
    }
}

impl Stream for CaptureStream {
    type Item = std::result::Result<Frame<Bytes>, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        match me.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some((buf, _)) = me.captured.as_mut() {
                    buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Poll::Ready(Some(Err(e))) => {
                // A truncated body must not be cached.
                me.captured = None;
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                if let Some((buf, tx)) = me.captured.take() {
                    let _ = tx.send(buf);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
