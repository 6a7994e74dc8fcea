mod common;

use common::FlakySource;
use flashcache::cache::{CacheAside, CachePolicy};
use flashcache::error::{Error, WriteSide};
use flashcache::source::MemorySource;
use flashcache::store::{KeyValueStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<MemoryStore>, Arc<FlakySource>, CacheAside) {
  let store = Arc::new(MemoryStore::default());
  let source = Arc::new(FlakySource::new());
  let cache = CacheAside::new(
    store.clone(),
    source.clone(),
    CachePolicy::default().with_prefix("test:"),
  )
  .unwrap();
  (store, source, cache)
}

async fn cached(store: &MemoryStore, key: &str) -> Option<Vec<u8>> {
  store.acquire().await.unwrap().get(key).await.unwrap()
}

// =============================================================================
// Read-through
// =============================================================================

#[tokio::test]
async fn test_read_through_fetches_once() {
  let (store, source, cache) = setup();
  source.inner.insert("42", "User:42:profile");

  let first = cache.read("42").await.unwrap();
  assert_eq!(first, Some(b"User:42:profile".to_vec()));
  assert_eq!(source.inner.fetch_count(), 1);

  let second = cache.read("42").await.unwrap();
  assert_eq!(second, first);
  assert_eq!(source.inner.fetch_count(), 1);

  assert_eq!(
    cached(&store, "test:user:42:profile").await,
    Some(b"User:42:profile".to_vec())
  );

  let stats = cache.stats();
  assert_eq!(stats.hits, 1);
  assert_eq!(stats.misses, 1);
  assert_eq!(stats.backing_fetches, 1);
  assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_read_through_applies_read_ttl() {
  let (store, source, cache) = setup();
  source.inner.insert("1", "alice");
  cache.read("1").await.unwrap();

  let ttl = store
    .acquire()
    .await
    .unwrap()
    .ttl("test:user:1:profile")
    .await
    .unwrap()
    .unwrap();
  assert!(ttl <= Duration::from_secs(300));
  assert!(ttl > Duration::from_secs(295));
}

#[tokio::test]
async fn test_read_absent_caches_nothing() {
  let (store, source, cache) = setup();

  assert_eq!(cache.read("missing").await.unwrap(), None);
  assert_eq!(cached(&store, "test:user:missing:profile").await, None);

  // A second read goes back to the source
  cache.read("missing").await.unwrap();
  assert_eq!(source.inner.fetch_count(), 2);
}

#[tokio::test]
async fn test_read_fetch_failure_not_cached() {
  let (store, source, cache) = setup();
  source.inner.insert("7", "bob");
  source.fail_fetch("7");

  let err = cache.read("7").await.unwrap_err();
  assert!(matches!(err, Error::Source(_)));
  assert_eq!(cached(&store, "test:user:7:profile").await, None);
  assert!(store.is_empty());
  assert_eq!(cache.stats().fetch_failures, 1);
}

#[tokio::test]
async fn test_read_expired_entry_refetches() {
  let store = Arc::new(MemoryStore::default());
  let source = Arc::new(MemorySource::new());
  source.insert("1", "alice");
  let policy =
    CachePolicy::default().with_ttls(Duration::from_millis(50), Duration::from_millis(100));
  let cache = CacheAside::new(store.clone(), source.clone(), policy).unwrap();

  cache.read("1").await.unwrap();
  tokio::time::sleep(Duration::from_millis(80)).await;
  cache.read("1").await.unwrap();
  assert_eq!(source.fetch_count(), 2);
}

#[tokio::test]
async fn test_read_on_closed_store() {
  let (store, _source, cache) = setup();
  store.close();
  assert!(matches!(cache.read("1").await, Err(Error::Unavailable(_))));
}

// =============================================================================
// Write-through
// =============================================================================

#[tokio::test]
async fn test_write_through_reaches_both_sides() {
  let (store, source, cache) = setup();

  cache.write("5", b"carol").await.unwrap();

  assert_eq!(source.inner.value("5"), Some(b"carol".to_vec()));
  assert_eq!(
    cached(&store, "test:user:5:profile").await,
    Some(b"carol".to_vec())
  );
  // Read and write address the same key
  assert_eq!(cache.read("5").await.unwrap(), Some(b"carol".to_vec()));
  assert_eq!(source.inner.fetch_count(), 0);
  assert_eq!(cache.stats().writes, 1);
}

#[tokio::test]
async fn test_write_partial_source_failure() {
  let (store, source, cache) = setup();
  source.fail_stores(true);

  let err = cache.write("5", b"carol").await.unwrap_err();
  assert_eq!(err.written_side(), Some(WriteSide::Cache));
  assert_eq!(
    cached(&store, "test:user:5:profile").await,
    Some(b"carol".to_vec())
  );
  assert_eq!(source.inner.value("5"), None);
  assert_eq!(cache.stats().partial_writes, 1);
}

#[tokio::test]
async fn test_write_partial_cache_failure() {
  let (store, source, cache) = setup();
  store.close();

  let err = cache.write("5", b"carol").await.unwrap_err();
  assert_eq!(err.written_side(), Some(WriteSide::Source));
  assert_eq!(source.inner.value("5"), Some(b"carol".to_vec()));
}

#[tokio::test]
async fn test_write_both_sides_fail_returns_cache_error() {
  let (store, source, cache) = setup();
  store.close();
  source.fail_stores(true);

  let err = cache.write("5", b"carol").await.unwrap_err();
  assert!(matches!(err, Error::Unavailable(_)));
  assert_eq!(err.written_side(), None);
}

// =============================================================================
// Warm-up and invalidation
// =============================================================================

#[tokio::test]
async fn test_warm_skips_failed_fetch() {
  let (store, source, cache) = setup();
  for id in ["1", "2", "3", "4"] {
    source.inner.insert(id, format!("User:{}:profile", id));
  }
  source.fail_fetch("2");

  let count = cache.warm(["1", "2", "3", "4"]).await;
  assert_eq!(count, 3);

  assert!(cached(&store, "test:user:1:profile").await.is_some());
  assert!(cached(&store, "test:user:2:profile").await.is_none());
  assert!(cached(&store, "test:user:4:profile").await.is_some());

  let ttl = store
    .acquire()
    .await
    .unwrap()
    .ttl("test:user:3:profile")
    .await
    .unwrap()
    .unwrap();
  assert!(ttl > Duration::from_secs(300) && ttl <= Duration::from_secs(600));
  assert_eq!(cache.stats().warmed, 3);
}

#[tokio::test]
async fn test_warm_skips_absent_ids() {
  let (_store, source, cache) = setup();
  source.inner.insert("1", "alice");

  let ids = vec!["1".to_string(), "nobody".to_string()];
  assert_eq!(cache.warm(&ids).await, 1);
}

#[tokio::test]
async fn test_warm_on_closed_store_caches_nothing() {
  let (store, source, cache) = setup();
  source.inner.insert("1", "alice");
  store.close();
  assert_eq!(cache.warm(["1"]).await, 0);
}

#[tokio::test]
async fn test_invalidate() {
  let (_store, source, cache) = setup();
  source.inner.insert("9", "dave");
  cache.read("9").await.unwrap();

  assert!(cache.invalidate("9").await.unwrap());
  assert!(!cache.invalidate("9").await.unwrap());
  assert_eq!(source.inner.value("9"), Some(b"dave".to_vec()));

  cache.read("9").await.unwrap();
  assert_eq!(source.inner.fetch_count(), 2);
}
