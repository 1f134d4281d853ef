//! Cached response format and the volatile memory tier.
//!
//! A durable cache object is a plain-text header section, a blank line, and
//! the raw response body. Only a fixed subset of response headers survives;
//! a missing `Content-Type` is recorded as `application/octet-stream`, and
//! missing `Date`, `Etag`, or `Cache-Control` are simply omitted.

use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, DATE, ETAG};
use hyper::HeaderMap;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::{Error, Result};

/// Headers preserved in cache objects and memory entries, with the written
/// spelling of each.
const KEEP_HEADERS: [(&str, HeaderName); 4] = [
    ("Content-Type", CONTENT_TYPE),
    ("Date", DATE),
    ("Etag", ETAG),
    ("Cache-Control", CACHE_CONTROL),
];

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Entries the memory cache holds before evicting by recency.
pub const MEMORY_CACHE_ENTRIES: usize = 1 << 16;

/// Ceiling on the lifetime of a memory entry, whatever max-age says.
pub const MAX_MEMORY_TTL: Duration = Duration::from_secs(3600);

/// Reduce `hdr` to the keep-list.
pub fn trim_headers(hdr: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (_, name) in &KEEP_HEADERS {
        if let Some(v) = hdr.get(name) {
            out.insert(name.clone(), v.clone());
        }
    }
    out
}

/// Serialize a response into the durable cache-object format.
pub fn write_cache_object(hdr: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 128);
    for (spelling, name) in &KEEP_HEADERS {
        let fallback = (*name == CONTENT_TYPE).then_some(DEFAULT_CONTENT_TYPE);
        let value = hdr
            .get(name)
            .and_then(|v| v.to_str().ok())
            .or(fallback);
        if let Some(value) = value {
            out.extend_from_slice(spelling.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
    }
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

/// Parse a cache object back into headers and body. Any `": "`-separated
/// header line is accepted; names outside the keep-list are ignored.
pub fn parse_cache_object(data: Bytes) -> Result<(HeaderMap, Bytes)> {
    let split = data
        .windows(2)
        .position(|w| w == b"\n\n")
        .ok_or_else(|| Error::malformed("cache object", "missing header separator"))?;
    let body = data.slice(split + 2..);

    let mut hdr = HeaderMap::new();
    let head = &data[..split];
    for line in head.split(|&b| b == b'\n') {
        let Some(pos) = line.windows(2).position(|w| w == b": ") else {
            continue;
        };
        let (name, value) = (&line[..pos], &line[pos + 2..]);
        let Ok(name) = HeaderName::from_bytes(name) else {
            continue;
        };
        if !KEEP_HEADERS.iter().any(|(_, keep)| *keep == name) {
            continue;
        }
        if let Ok(value) = HeaderValue::from_bytes(value) {
            hdr.insert(name, value);
        }
    }
    Ok((hdr, body))
}

struct MemEntry {
    header: HeaderMap,
    body: Bytes,
    expires: Instant,
}

/// Volatile in-memory response cache with recency eviction and
/// expiry-on-read. One mutex guards every operation.
pub struct MemoryCache {
    inner: Mutex<LruCache<String, MemEntry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, hash: &str) -> Option<(HeaderMap, Bytes)> {
        let mut cache = self.inner.lock().expect("memory cache poisoned");
        let entry = cache.get(hash)?;
        if Instant::now() >= entry.expires {
            cache.pop(hash);
            return None;
        }
        Some((entry.header.clone(), entry.body.clone()))
    }

    pub fn insert(&self, hash: &str, max_age: Duration, hdr: &HeaderMap, body: Bytes) {
        let entry = MemEntry {
            header: trim_headers(hdr),
            body,
            expires: Instant::now() + max_age.min(MAX_MEMORY_TTL),
        };
        let mut cache = self.inner.lock().expect("memory cache poisoned");
        cache.put(hash.to_string(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&HeaderName, &str)]) -> HeaderMap {
        let mut hdr = HeaderMap::new();
        for (name, value) in pairs {
            hdr.insert((*name).clone(), HeaderValue::from_str(value).unwrap());
        }
        hdr
    }

    #[test]
    fn round_trip_keeps_only_keep_list() {
        let mut hdr = headers(&[
            (&CONTENT_TYPE, "text/plain"),
            (&DATE, "Mon, 02 Jan 2006 15:04:05 GMT"),
            (&ETAG, "\"abc123\""),
            (&CACHE_CONTROL, "immutable"),
        ]);
        hdr.insert("x-amz-request-id", HeaderValue::from_static("drop-me"));

        let data = write_cache_object(&hdr, b"the body");
        let (parsed, body) = parse_cache_object(Bytes::from(data)).unwrap();

        assert_eq!(body.as_ref(), b"the body");
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(parsed.get(ETAG).unwrap(), "\"abc123\"");
        assert!(parsed.get("x-amz-request-id").is_none());
    }

    #[test]
    fn content_type_defaults_and_missing_headers_are_omitted() {
        let data = write_cache_object(&HeaderMap::new(), b"x");
        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.starts_with("Content-Type: application/octet-stream\n"));
        assert!(!text.contains("Date:"));
        assert!(!text.contains("Etag:"));

        let (parsed, body) = parse_cache_object(Bytes::from(data)).unwrap();
        assert_eq!(parsed.get(CONTENT_TYPE).unwrap(), DEFAULT_CONTENT_TYPE);
        assert_eq!(body.as_ref(), b"x");
    }

    #[test]
    fn unknown_header_lines_are_ignored() {
        let raw = b"Content-Type: text/css\nX-Whatever: yes\nnot a header line\n\nbody".to_vec();
        let (parsed, body) = parse_cache_object(Bytes::from(raw)).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(body.as_ref(), b"body");
    }

    #[test]
    fn object_without_separator_is_malformed() {
        let err = parse_cache_object(Bytes::from_static(b"Content-Type: text/plain\n")).unwrap_err();
        assert!(!err.is_not_found());
    }

    #[test]
    fn body_may_contain_blank_lines() {
        let data = write_cache_object(&HeaderMap::new(), b"a\n\nb\n\nc");
        let (_, body) = parse_cache_object(Bytes::from(data)).unwrap();
        assert_eq!(body.as_ref(), b"a\n\nb\n\nc");
    }

    #[test]
    fn memory_entries_expire_on_read() {
        let cache = MemoryCache::new(16);
        let hdr = headers(&[(&CONTENT_TYPE, "text/plain")]);
        cache.insert("aaaa", Duration::ZERO, &hdr, Bytes::from_static(b"v"));
        assert!(cache.get("aaaa").is_none());

        cache.insert("bbbb", Duration::from_secs(30), &hdr, Bytes::from_static(b"v"));
        assert!(cache.get("bbbb").is_some());
    }

    #[test]
    fn memory_cache_evicts_by_recency() {
        let cache = MemoryCache::new(2);
        let hdr = HeaderMap::new();
        let ttl = Duration::from_secs(60);
        cache.insert("a", ttl, &hdr, Bytes::from_static(b"1"));
        cache.insert("b", ttl, &hdr, Bytes::from_static(b"2"));
        cache.get("a");
        cache.insert("c", ttl, &hdr, Bytes::from_static(b"3"));
        assert!(cache.get("a").is_some(), "recently used entry survives");
        assert!(cache.get("b").is_none(), "least recent entry evicted");
    }
}
