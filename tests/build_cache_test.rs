//! Build-cache engine integration tests over an in-memory object store.

mod common;

use common::MemoryStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use stockpile::build::{BuildCache, BuildCacheConfig, PutRequest};
use stockpile::s3::ObjectStore;
use stockpile::stage::{ActionRecord, CacheDir};

const ACTION: &str = "0a11223344556677889900aabbccddee";
const OUTPUT: &str = "1bff00112233445566778899aabbccdd";
const BODY: &[u8] = b"compiled object bytes";

fn mod_time() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_nanos(1_700_000_000_000_000_000)
}

fn new_cache(dir: &std::path::Path, store: Arc<MemoryStore>) -> BuildCache {
    BuildCache::new(
        Arc::new(CacheDir::new(dir).unwrap()),
        store,
        BuildCacheConfig {
            upload_concurrency: 2,
            ..Default::default()
        },
    )
}

fn put_request(body: &[u8]) -> PutRequest<std::io::Cursor<Vec<u8>>> {
    PutRequest {
        action_id: ACTION.to_string(),
        output_id: OUTPUT.to_string(),
        size: body.len() as u64,
        body: std::io::Cursor::new(body.to_vec()),
        mod_time: mod_time(),
    }
}

#[tokio::test]
async fn put_then_get_round_trips_through_the_remote() {
    let store = Arc::new(MemoryStore::new());
    let local_a = tempfile::tempdir().unwrap();
    let cache = new_cache(local_a.path(), Arc::clone(&store));

    let disk_path = cache.put(put_request(BODY)).await.unwrap();
    assert_eq!(tokio::fs::read(&disk_path).await.unwrap(), BODY);
    cache.close().await;

    // Both remote halves exist, and the action names an output that is
    // itself present.
    let action_key = format!("action/{}/{}", &ACTION[..2], ACTION);
    let output_key = format!("output/{}/{}", &OUTPUT[..2], OUTPUT);
    let record = ActionRecord::parse(&store.get_raw(&action_key).expect("action stored")).unwrap();
    assert_eq!(record.output_id, OUTPUT);
    assert!(store.contains(&output_key), "output blob stored before its action");
    assert_eq!(store.get_raw(&output_key).unwrap().as_ref(), BODY);

    // A fresh machine (empty local stage, same bucket) sees the entry.
    let local_b = tempfile::tempdir().unwrap();
    let cache_b = new_cache(local_b.path(), Arc::clone(&store));
    let (output_id, path) = cache_b.get(ACTION).await.unwrap().expect("remote hit");
    assert_eq!(output_id, OUTPUT);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), BODY);
    assert_eq!(
        tokio::fs::metadata(&path).await.unwrap().modified().unwrap(),
        mod_time(),
        "fault-in preserves the recorded modification time"
    );

    // And the second get is a pure local hit.
    let metrics = cache_b.metrics();
    cache_b.get(ACTION).await.unwrap().expect("local hit");
    assert_eq!(metrics.get_local_hit.get(), 1);
    assert_eq!(metrics.get_fault_hit.get(), 1);
}

#[tokio::test]
async fn get_of_unknown_action_is_a_miss() {
    let store = Arc::new(MemoryStore::new());
    let local = tempfile::tempdir().unwrap();
    let cache = new_cache(local.path(), Arc::clone(&store));

    assert!(cache.get(ACTION).await.unwrap().is_none());
    assert_eq!(cache.metrics().get_fault_miss.get(), 1);
}

#[tokio::test]
async fn malformed_remote_action_is_an_error_not_a_miss() {
    let store = Arc::new(MemoryStore::new());
    store.insert(&format!("action/{}/{}", &ACTION[..2], ACTION), "garbage");

    let local = tempfile::tempdir().unwrap();
    let cache = new_cache(local.path(), Arc::clone(&store));

    let err = cache.get(ACTION).await.unwrap_err();
    assert!(!err.is_not_found(), "malformed record must not read as a miss");

    // No local entry may be created from a record we could not parse.
    let stage = CacheDir::new(local.path()).unwrap();
    assert!(stage.get(ACTION).await.unwrap().is_none());
}

#[tokio::test]
async fn action_naming_a_missing_output_is_an_error() {
    let store = Arc::new(MemoryStore::new());
    let record = ActionRecord::new(OUTPUT, mod_time());
    store.insert(&format!("action/{}/{}", &ACTION[..2], ACTION), record.encode());

    let local = tempfile::tempdir().unwrap();
    let cache = new_cache(local.path(), Arc::clone(&store));

    let err = cache.get(ACTION).await.unwrap_err();
    assert!(!err.is_not_found(), "torn state must surface as an error");
}

#[tokio::test]
async fn small_objects_stay_local() {
    let store = Arc::new(MemoryStore::new());
    let local = tempfile::tempdir().unwrap();
    let cache = BuildCache::new(
        Arc::new(CacheDir::new(local.path()).unwrap()),
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        BuildCacheConfig {
            min_upload_size: 1024,
            ..Default::default()
        },
    );

    cache.put(put_request(BODY)).await.unwrap();
    cache.close().await;

    assert_eq!(store.len(), 0, "undersized objects are never uploaded");
    assert_eq!(cache.metrics().put_skip_small.get(), 1);
}

#[tokio::test]
async fn repeated_put_skips_the_second_upload() {
    let store = Arc::new(MemoryStore::new());
    let local = tempfile::tempdir().unwrap();
    let cache = new_cache(local.path(), Arc::clone(&store));

    cache.put(put_request(BODY)).await.unwrap();
    cache.close().await;
    cache.put(put_request(BODY)).await.unwrap();
    cache.close().await;

    let metrics = cache.metrics();
    assert_eq!(metrics.put_remote_object.get(), 1);
    assert_eq!(metrics.put_remote_found.get(), 1);
    assert_eq!(
        store.conditional_skips.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    // The action record is rewritten each time, idempotently.
    assert_eq!(metrics.put_remote_action.get(), 2);
}

#[tokio::test]
async fn invalid_identifiers_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    let local = tempfile::tempdir().unwrap();
    let cache = new_cache(local.path(), Arc::clone(&store));

    assert!(cache.get("x").await.is_err());
    assert!(cache.get("not-hex!").await.is_err());
}
