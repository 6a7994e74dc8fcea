//! Backing source fronted by the cache
//!
//! The cache addresses a source by bare id; namespacing only applies to cache
//! keys.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

/// System of record behind a `CacheAside`
#[async_trait]
pub trait BackingSource: Send + Sync {
  /// `Ok(None)` when the source has no value for `id`
  async fn fetch(&self, id: &str) -> Result<Option<Vec<u8>>>;

  async fn store(&self, id: &str, value: &[u8]) -> Result<()>;
}

/// In-memory source that counts the calls it receives
#[derive(Default)]
pub struct MemorySource {
  data: RwLock<HashMap<String, Vec<u8>>>,
  fetches: AtomicU64,
  stores: AtomicU64,
}

impl MemorySource {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed a value without counting it as a store
  pub fn insert(&self, id: impl Into<String>, value: impl Into<Vec<u8>>) {
    self.data.write().insert(id.into(), value.into());
  }

  pub fn value(&self, id: &str) -> Option<Vec<u8>> {
    self.data.read().get(id).cloned()
  }

  pub fn fetch_count(&self) -> u64 {
    self.fetches.load(Ordering::Relaxed)
  }

  pub fn store_count(&self) -> u64 {
    self.stores.load(Ordering::Relaxed)
  }

  pub fn len(&self) -> usize {
    self.data.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.read().is_empty()
  }
}

#[async_trait]
impl BackingSource for MemorySource {
  async fn fetch(&self, id: &str) -> Result<Option<Vec<u8>>> {
    self.fetches.fetch_add(1, Ordering::Relaxed);
    Ok(self.data.read().get(id).cloned())
  }

  async fn store(&self, id: &str, value: &[u8]) -> Result<()> {
    self.stores.fetch_add(1, Ordering::Relaxed);
    self.data.write().insert(id.to_string(), value.to_vec());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_memory_source_counts_calls() {
    let source = MemorySource::new();
    source.insert("1", "alice");

    assert_eq!(source.fetch("1").await.unwrap(), Some(b"alice".to_vec()));
    assert_eq!(source.fetch("2").await.unwrap(), None);
    source.store("2", b"bob").await.unwrap();

    assert_eq!(source.fetch_count(), 2);
    assert_eq!(source.store_count(), 1);
    assert_eq!(source.value("2"), Some(b"bob".to_vec()));
    assert_eq!(source.len(), 2);
  }
}
