//! Persistent cache behavior across client instances.

use coursegen_resilience::cache::{CacheBackend, CacheKey, FileCache};
use coursegen_resilience::{CallOptions, OperationError, ResilientClient, ServiceId};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn client_at(dir: &Path) -> ResilientClient {
    ResilientClient::builder()
        .cache_dir(dir)
        .build()
        .unwrap()
}

fn entry_files(dir: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect()
}

#[tokio::test]
async fn results_survive_a_new_client_instance() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let prompt = "Narrate the intro to lesson 3";

    for _ in 0..2 {
        let client = client_at(dir.path());
        assert_eq!(client.cache().backend_name(), "file");
        let key = client.keys().fingerprint(ServiceId::tts()).field("text", prompt).finish();
        let audio: Vec<u8> = client
            .call(&ServiceId::tts(), Some(&key), &CallOptions::default(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, OperationError>(vec![0x49, 0x44, 0x33])
                }
            })
            .await
            .unwrap();
        assert_eq!(audio, vec![0x49, 0x44, 0x33]);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(entry_files(dir.path()).len(), 1);
}

#[tokio::test]
async fn corrupt_entry_is_a_miss_and_gets_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let client = client_at(dir.path());
    let key = client.keys().image("flux", "a lighthouse at dusk", 512, 512);

    let _: String = client
        .call(&ServiceId::image(), Some(&key), &CallOptions::default(), || async {
            Ok("png-v1".to_string())
        })
        .await
        .unwrap();

    for path in entry_files(dir.path()) {
        std::fs::write(path, b"{ not an envelope").unwrap();
    }

    let (value, stats) = client
        .call_with_stats(&ServiceId::image(), Some(&key), &CallOptions::default(), || async {
            Ok("png-v2".to_string())
        })
        .await
        .unwrap();
    assert_eq!(value, "png-v2");
    assert!(!stats.cache_hit);

    let again: String = client
        .call(&ServiceId::image(), Some(&key), &CallOptions::default(), || async {
            Ok("png-v3".to_string())
        })
        .await
        .unwrap();
    assert_eq!(again, "png-v2");
}

#[tokio::test]
async fn entries_expire_after_their_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let client = client_at(dir.path());
    let key = client.keys().completion("m", None, "short-lived", None);
    let opts = CallOptions::default().with_ttl(Duration::from_millis(50));

    let first: u32 = client
        .call(&ServiceId::llm(), Some(&key), &opts, || async { Ok(1) })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let second: u32 = client
        .call(&ServiceId::llm(), Some(&key), &opts, || async { Ok(2) })
        .await
        .unwrap();

    assert_eq!((first, second), (1, 2));
}

#[tokio::test]
async fn purge_expired_removes_only_stale_files() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::open(dir.path()).unwrap();
    cache
        .set(&CacheKey::new("stale"), b"\"old\"", Duration::from_millis(10))
        .await
        .unwrap();
    cache
        .set(&CacheKey::new("fresh"), b"\"new\"", Duration::from_secs(600))
        .await
        .unwrap();
    std::fs::write(dir.path().join("garbage.json"), b"nope").unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let removed = cache.purge_expired().await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(cache.len().await.unwrap(), 1);
    assert!(cache.exists(&CacheKey::new("fresh")).await.unwrap());
}

#[tokio::test]
async fn clear_cache_empties_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let client = client_at(dir.path());
    for topic in ["indexes", "embeddings", "reranking"] {
        let key = client.keys().completion("m", None, topic, None);
        let _: String = client
            .call(&ServiceId::llm(), Some(&key), &CallOptions::default(), || async move {
                Ok(format!("notes on {topic}"))
            })
            .await
            .unwrap();
    }
    assert_eq!(client.cache().len().await.unwrap(), 3);

    client.clear_cache().await.unwrap();
    assert_eq!(client.cache().len().await.unwrap(), 0);
    assert!(entry_files(dir.path()).is_empty());
}

#[tokio::test]
async fn unusable_cache_dir_falls_back_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file in the way").unwrap();

    let client = client_at(&blocker.join("cache"));
    assert_eq!(client.cache().backend_name(), "memory");
    assert!(client.check_health().probes["cache"].healthy);
}
