//! Test support: an in-memory object store.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use md5::{Digest as _, Md5};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use stockpile::s3::{ObjectBody, ObjectStore};
use stockpile::types::{Error, Result};

/// In-memory [`ObjectStore`] with the same conditional-put semantics as the
/// real backend: a put guarded by an etag is skipped when the stored bytes
/// already hash to it.
#[derive(Default)]
pub struct MemoryStore {
    objects: DashMap<String, Bytes>,
    pub writes: AtomicUsize,
    pub conditional_skips: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.objects.insert(key.to_string(), data.into());
    }

    pub fn get_raw(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|e| e.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn etag(data: &[u8]) -> String {
        hex::encode(Md5::digest(data))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<ObjectBody> {
        match self.objects.get(key) {
            Some(data) => Ok(ObjectBody::from_bytes(data.clone())),
            None => Err(Error::NotFound(key.to_string())),
        }
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes> {
        self.get(key).await?.read_to_end().await
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path).await?;
        self.put_bytes(key, data.into()).await
    }

    async fn put_conditional(&self, key: &str, etag: &str, path: &Path) -> Result<bool> {
        if let Some(existing) = self.objects.get(key) {
            if Self::etag(&existing) == etag {
                self.conditional_skips.fetch_add(1, Ordering::SeqCst);
                return Ok(false);
            }
        }
        self.put_file(key, path).await?;
        Ok(true)
    }
}
