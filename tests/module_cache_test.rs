//! Module-artifact cache integration tests.

mod common;

use common::MemoryStore;
use sha2::{Digest as _, Sha256};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use stockpile::module::{ArtifactCache, ModuleCache, ModuleCacheConfig};

const NAME: &str = "example.com/widget/@v/v1.2.3.zip";
const DATA: &[u8] = b"artifact archive bytes";

fn remote_key(name: &str) -> String {
    let hash = hex::encode(Sha256::digest(name.as_bytes()));
    format!("{}/{}", &hash[..2], hash)
}

fn new_cache(dir: &std::path::Path, store: Arc<MemoryStore>) -> ModuleCache {
    ModuleCache::new(dir, store, ModuleCacheConfig::default())
}

async fn read_all(file: &mut tokio::fs::File) -> Vec<u8> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn put_then_get_serves_the_local_copy() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path(), Arc::clone(&store));

    let mut data = std::io::Cursor::new(DATA.to_vec());
    cache.put(NAME, &mut data).await.unwrap();
    cache.close().await;

    let mut file = cache.get(NAME).await.unwrap().expect("local hit");
    assert_eq!(read_all(&mut file).await, DATA);

    let metrics = cache.metrics();
    assert_eq!(metrics.get_local_hit.get(), 1);
    assert_eq!(metrics.put_local_bytes.get(), DATA.len() as u64);

    // The write-behind reached the remote store under the hashed key.
    assert_eq!(store.get_raw(&remote_key(NAME)).unwrap().as_ref(), DATA);
}

#[tokio::test]
async fn re_put_of_a_cached_name_does_no_remote_work() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path(), Arc::clone(&store));

    let mut first = std::io::Cursor::new(DATA.to_vec());
    cache.put(NAME, &mut first).await.unwrap();
    cache.close().await;
    let writes_after_first = store.write_count();

    let mut second = std::io::Cursor::new(DATA.to_vec());
    cache.put(NAME, &mut second).await.unwrap();
    cache.close().await;

    assert_eq!(cache.metrics().put_local_hit.get(), 1);
    assert_eq!(store.write_count(), writes_after_first);
}

#[tokio::test]
async fn miss_faults_in_from_the_remote_and_repopulates_local() {
    let store = Arc::new(MemoryStore::new());
    store.insert(&remote_key(NAME), DATA);

    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path(), Arc::clone(&store));

    let mut file = cache.get(NAME).await.unwrap().expect("remote hit");
    assert_eq!(read_all(&mut file).await, DATA);
    assert_eq!(cache.metrics().get_fault_hit.get(), 1);

    // The next get never touches the remote.
    let mut file = cache.get(NAME).await.unwrap().expect("local hit");
    assert_eq!(read_all(&mut file).await, DATA);
    assert_eq!(cache.metrics().get_local_hit.get(), 1);
}

#[tokio::test]
async fn absent_artifact_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path(), Arc::clone(&store));

    assert!(cache.get(NAME).await.unwrap().is_none());
    assert_eq!(cache.metrics().get_fault_miss.get(), 1);
}
