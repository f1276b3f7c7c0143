//! Store scenarios exercised through the public API only

use futures::future::join_all;
use notevault_core::config::StoreConfig;
use notevault_core::core_crypto::{KdfParams, MasterKey};
use notevault_core::core_store::{DataStore, LogicalKey, StoreError};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        data_dir: dir.path().to_path_buf(),
        ..StoreConfig::default()
    }
}

fn fast_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}

fn data_files(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".enc") && n != "index.enc")
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_put_get_remove_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = DataStore::open(&config(&dir), MasterKey::generate()).unwrap();
    let key = LogicalKey::new("main", "root", "data", "v1");

    assert_eq!(store.get(key.clone()).await.unwrap(), json!({}));

    store.put(key.clone(), json!({"x": 1})).await.unwrap();
    assert_eq!(store.get(key.clone()).await.unwrap(), json!({"x": 1}));
    assert_eq!(data_files(&dir).len(), 1);

    let report = store
        .remove("main".to_string(), "root".to_string())
        .await
        .unwrap();
    assert_eq!(report.removed, 1);
    assert!(data_files(&dir).is_empty());
    assert_eq!(store.get(key).await.unwrap(), json!({}));
}

#[tokio::test]
async fn test_resolution_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let key = MasterKey::from_bytes([7u8; 32]);
    let logical = LogicalKey::new("main", "root", "data", "v1");

    {
        let store = DataStore::open(&config(&dir), key.clone()).unwrap();
        store.put(logical.clone(), json!("first")).await.unwrap();
        store.put(logical.clone(), json!("second")).await.unwrap();
    }
    let files = data_files(&dir);
    assert_eq!(files.len(), 1);

    let store = DataStore::open(&config(&dir), key).unwrap();
    assert_eq!(store.get(logical.clone()).await.unwrap(), json!("second"));
    store.put(logical, json!("third")).await.unwrap();
    assert_eq!(data_files(&dir), files);
}

#[tokio::test]
async fn test_bucket_isolation() {
    let dir = TempDir::new().unwrap();
    let store = DataStore::open(&config(&dir), MasterKey::generate()).unwrap();
    let a = LogicalKey::new("main", "alpha", "data", "v1");
    let b = LogicalKey::new("main", "beta", "data", "v1");

    store.put(a.clone(), json!("a")).await.unwrap();
    store.put(b.clone(), json!("b")).await.unwrap();

    store
        .remove("main".to_string(), "alpha".to_string())
        .await
        .unwrap();
    assert_eq!(store.get(a).await.unwrap(), json!({}));
    assert_eq!(store.get(b).await.unwrap(), json!("b"));

    let stats = store.stats().unwrap();
    assert_eq!(stats.buckets, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_rotation_keeps_every_document() {
    let dir = TempDir::new().unwrap();
    let old = MasterKey::generate();
    let new = MasterKey::generate();
    let store = DataStore::open(&config(&dir), old.clone()).unwrap();

    let keys: Vec<LogicalKey> = (0..10)
        .map(|i| LogicalKey::new("main", &format!("s{}", i % 3), &format!("d{}", i), "v1"))
        .collect();
    for (i, key) in keys.iter().enumerate() {
        store.put(key.clone(), json!({ "n": i })).await.unwrap();
    }

    let report = store.rotate_key(new.clone()).await.unwrap();
    assert_eq!(report.rotated, keys.len());
    assert!(!store.stats().unwrap().pending_rotation);
    drop(store);

    let err = DataStore::open(&config(&dir), old).unwrap_err();
    assert!(err.is_authentication());

    let store = DataStore::open(&config(&dir), new).unwrap();
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(store.get(key.clone()).await.unwrap(), json!({ "n": i }));
    }
}

#[tokio::test]
async fn test_password_change_and_reopen() {
    let dir = TempDir::new().unwrap();
    let kdf = fast_kdf();
    let key = LogicalKey::new("notes", "inbox", "today", "v2");

    let store = DataStore::open_with_password(&config(&dir), &kdf, "hunter2").unwrap();
    store.put(key.clone(), json!(["a", "b"])).await.unwrap();
    store
        .change_password("hunter2".to_string(), "correct horse".to_string())
        .await
        .unwrap();
    drop(store);

    assert!(DataStore::open_with_password(&config(&dir), &kdf, "hunter2").is_err());
    let store = DataStore::open_with_password(&config(&dir), &kdf, "correct horse").unwrap();
    assert_eq!(store.get(key).await.unwrap(), json!(["a", "b"]));
}

#[tokio::test]
async fn test_tampered_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = DataStore::open(&config(&dir), MasterKey::generate()).unwrap();
    let key = LogicalKey::new("main", "root", "data", "v1");
    store.put(key.clone(), json!({"secret": true})).await.unwrap();

    let path = dir.path().join(&data_files(&dir)[0]);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&path, bytes).unwrap();

    let err = store.get(key).await.unwrap_err();
    assert!(matches!(err, StoreError::Crypto(_)));
}

#[tokio::test]
async fn test_concurrent_writers_share_one_index() {
    let dir = TempDir::new().unwrap();
    let key = MasterKey::generate();
    let store = DataStore::open(&config(&dir), key.clone()).unwrap();

    let writes = (0..32).map(|i| {
        let store = store.clone();
        async move {
            let key = LogicalKey::new("main", &format!("scope{}", i % 4), &format!("id{}", i), "v1");
            store.put(key, json!({ "i": i })).await
        }
    });
    for result in join_all(writes).await {
        result.unwrap();
    }

    // Same key from many tasks must still map to one file
    let shared = LogicalKey::new("main", "shared", "data", "v1");
    let writes = (0..16).map(|i| {
        let store = store.clone();
        let shared = shared.clone();
        async move { store.put(shared, json!(i)).await }
    });
    for result in join_all(writes).await {
        result.unwrap();
    }

    assert_eq!(data_files(&dir).len(), 33);
    drop(store);

    let store = DataStore::open(&config(&dir), key).unwrap();
    assert_eq!(store.stats().unwrap().entries, 33);
    for i in 0..32 {
        let key = LogicalKey::new("main", &format!("scope{}", i % 4), &format!("id{}", i), "v1");
        assert_eq!(store.get(key).await.unwrap(), json!({ "i": i }));
    }
}

#[test]
fn test_stream_roundtrip_large_document() {
    let dir = TempDir::new().unwrap();
    let store = DataStore::open(
        &StoreConfig {
            stream_chunk_size: 4096,
            ..config(&dir)
        },
        MasterKey::generate(),
    )
    .unwrap();
    let key = LogicalKey::new("blobs", "root", "large", "v1");
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    let written = store.put_stream_blocking(&key, payload.as_slice()).unwrap();
    assert_eq!(written, payload.len() as u64 + 28);

    let mut out = Vec::new();
    assert!(store.get_stream_blocking(&key, &mut out).unwrap());
    assert_eq!(out, payload);
}
