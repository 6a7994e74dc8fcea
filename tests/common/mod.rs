#![allow(dead_code)]

use async_trait::async_trait;
use flashcache::error::{Error, Result};
use flashcache::source::{BackingSource, MemorySource};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Source whose fetches fail for chosen ids and whose stores can be switched off
#[derive(Default)]
pub struct FlakySource {
  pub inner: MemorySource,
  failing_ids: parking_lot::RwLock<HashSet<String>>,
  stores_fail: AtomicBool,
}

impl FlakySource {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_fetch(&self, id: &str) {
    self.failing_ids.write().insert(id.to_string());
  }

  pub fn fail_stores(&self, fail: bool) {
    self.stores_fail.store(fail, Ordering::SeqCst);
  }
}

#[async_trait]
impl BackingSource for FlakySource {
  async fn fetch(&self, id: &str) -> Result<Option<Vec<u8>>> {
    if self.failing_ids.read().contains(id) {
      return Err(Error::backing(format!("fetch of {} timed out", id)));
    }
    self.inner.fetch(id).await
  }

  async fn store(&self, id: &str, value: &[u8]) -> Result<()> {
    if self.stores_fail.load(Ordering::SeqCst) {
      return Err(Error::backing("source is read-only"));
    }
    self.inner.store(id, value).await
  }
}

/// Key prefix unique to one test run
pub fn unique_prefix() -> String {
  format!("test:{}:", uuid::Uuid::new_v4().simple())
}
