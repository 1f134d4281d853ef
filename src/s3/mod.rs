//! Object-store client.
//!
//! [`ObjectStore`] is the seam between the cache engines and the backing
//! store; [`S3Store`] implements it over the AWS SDK for a single bucket.
//! Not-found detection is unified here: SDK-native sentinels surface as
//! [`Error::NotFound`] so callers can test with one predicate.

pub mod digest;

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::types::{Error, Result};

/// The region used to resolve bucket locations, and the fallback when the
/// location API reports an empty region name (it does so for buckets in this
/// region for historical reasons).
const DEFAULT_REGION: &str = "us-east-1";

/// A streamed object body with an optional known length.
pub struct ObjectBody {
    len: Option<u64>,
    current: Bytes,
    chunks: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
}

impl ObjectBody {
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            len: Some(data.len() as u64),
            current: data,
            chunks: Box::pin(stream::empty()),
        }
    }

    fn from_byte_stream(body: ByteStream, len: Option<u64>) -> Self {
        let chunks = stream::unfold(body, |mut body| async move {
            match body.try_next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), body)),
                Ok(None) => None,
                Err(e) => Some((Err(Error::Store(e.to_string())), body)),
            }
        });
        Self {
            len,
            current: Bytes::new(),
            chunks: Box::pin(chunks),
        }
    }

    /// Content length, when the store reported one.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut out = Vec::with_capacity(self.len.unwrap_or(0) as usize);
        out.extend_from_slice(&self.current);
        while let Some(chunk) = self.chunks.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.into())
    }
}

impl AsyncRead for ObjectBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.current.is_empty() {
                let n = me.current.len().min(buf.remaining());
                buf.put_slice(&me.current.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match me.chunks.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => me.current = chunk,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::other(e.to_string())))
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Read and write access to a remote object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object as a stream. Absence is [`Error::NotFound`].
    async fn get(&self, key: &str) -> Result<ObjectBody>;

    /// Fetch an object fully buffered.
    async fn get_bytes(&self, key: &str) -> Result<Bytes>;

    /// Write the given bytes under `key`.
    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()>;

    /// Stream the file at `path` under `key`, sending its size as the
    /// content length.
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;

    /// Write the file at `path` under `key` unless the remote already holds
    /// an object whose etag matches `etag` (an MD5 of the expected contents
    /// as lowercase hex). Reports whether the object was written.
    async fn put_conditional(&self, key: &str, etag: &str, path: &Path) -> Result<bool>;
}

/// [`ObjectStore`] backed by an S3 bucket.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Resolve the region for `bucket` via the bucket-location API, falling
    /// back to [`DEFAULT_REGION`].
    pub async fn bucket_region(bucket: &str) -> Result<String> {
        let cfg = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(DEFAULT_REGION))
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&cfg);
        let loc = client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| Error::Store(format!("locate bucket {bucket}: {}", DisplayErrorContext(&e))))?;
        Ok(loc
            .location_constraint()
            .map(|c| c.as_str().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string()))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str) -> Result<ObjectBody> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => {
                let len = out.content_length().and_then(|n| u64::try_from(n).ok());
                Ok(ObjectBody::from_byte_stream(out.body, len))
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(Error::Store(format!(
                "get {key}: {}",
                DisplayErrorContext(&e)
            ))),
        }
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes> {
        self.get(key).await?.read_to_end().await
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        let len = data.len() as i64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(len)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Error::Store(format!("put {key}: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let len = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::file("stat", path, e))?
            .len();
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| Error::Store(format!("open {}: {e}", path.display())))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(len as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Store(format!("put {key}: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }

    async fn put_conditional(&self, key: &str, etag: &str, path: &Path) -> Result<bool> {
        // A successful HEAD with If-Match means the remote already holds a
        // matching object; any failure (absent key or mismatched etag) falls
        // through to the put.
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .if_match(etag)
            .send()
            .await;
        if head.is_ok() {
            return Ok(false);
        }
        self.put_file(key, path).await?;
        Ok(true)
    }
}

/// Assemble a storage key from parts, skipping empty segments. Keys always
/// use forward slashes, regardless of platform.
pub fn join_key<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut key = String::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(part);
    }
    key
}
