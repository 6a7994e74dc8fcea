//! Cache-aside accessor
//!
//! Read-through, write-through and warm-up over a `BackingSource`. Cache keys
//! are `<prefix><domain>:<id>[:<subfield>]`; the source is addressed by the
//! bare id. Each step checks out its own store connection, so a slow source
//! never holds a pooled connection.

mod stats;

use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheSection;
use crate::error::{Error, Result, WriteSide};
use crate::keys::KeySpace;
use crate::source::BackingSource;
use crate::store::KeyValueStore;

pub use stats::CacheStats;
use stats::Counters;

/// Key layout and TTLs for one cached domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
  pub prefix: String,
  pub domain: String,
  pub subfield: Option<String>,
  /// Applied on read-through misses and write-throughs
  pub read_ttl: Duration,
  /// Applied by warm-up
  pub warm_ttl: Duration,
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self::from(&CacheSection::default())
  }
}

impl From<&CacheSection> for CachePolicy {
  fn from(section: &CacheSection) -> Self {
    Self {
      prefix: section.prefix.clone(),
      domain: section.domain.clone(),
      subfield: section.subfield.clone(),
      read_ttl: Duration::from_secs(section.read_ttl_secs),
      warm_ttl: Duration::from_secs(section.warm_ttl_secs),
    }
  }
}

impl CachePolicy {
  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  pub fn with_ttls(mut self, read_ttl: Duration, warm_ttl: Duration) -> Self {
    self.read_ttl = read_ttl;
    self.warm_ttl = warm_ttl;
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.read_ttl.is_zero() || self.warm_ttl.is_zero() {
      return Err(Error::Config(
        "cache TTLs must be greater than zero".to_string(),
      ));
    }
    if self.domain.is_empty() {
      return Err(Error::Config("cache domain must not be empty".to_string()));
    }
    if self.read_ttl >= self.warm_ttl {
      tracing::warn!(
        "Cache read TTL {:?} is not shorter than warm TTL {:?}",
        self.read_ttl,
        self.warm_ttl
      );
    }
    Ok(())
  }
}

pub struct CacheAside {
  store: Arc<dyn KeyValueStore>,
  source: Arc<dyn BackingSource>,
  keys: KeySpace,
  policy: CachePolicy,
  counters: Counters,
}

impl CacheAside {
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    source: Arc<dyn BackingSource>,
    policy: CachePolicy,
  ) -> Result<Self> {
    policy.validate()?;
    Ok(Self {
      store,
      source,
      keys: KeySpace::new(policy.prefix.clone()),
      policy,
      counters: Counters::default(),
    })
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  /// Cache key for `id`
  pub fn cache_key(&self, id: &str) -> String {
    self
      .keys
      .entry_key(&self.policy.domain, id, self.policy.subfield.as_deref())
  }

  /// Return the cached value, or fetch it from the source and cache it.
  /// Absent values and failed fetches leave the cache untouched.
  pub async fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
    let key = self.cache_key(id);

    let cached = self.store.acquire().await?.get(&key).await?;
    if let Some(value) = cached {
      Counters::bump(&self.counters.hits);
      tracing::debug!("Cache hit: {}", key);
      return Ok(Some(value));
    }
    Counters::bump(&self.counters.misses);
    tracing::debug!("Cache miss: {}", key);

    let Some(value) = self.fetch(id).await? else {
      return Ok(None);
    };
    self.put(&key, &value, self.policy.read_ttl).await?;
    Ok(Some(value))
  }

  /// Write to the cache and to the source. Both writes are always attempted.
  ///
  /// When exactly one side fails, returns `Error::PartialWrite` naming the side
  /// that was written; nothing is rolled back. When both fail, the cache error
  /// is returned.
  pub async fn write(&self, id: &str, value: &[u8]) -> Result<()> {
    let key = self.cache_key(id);
    let cached = self.put(&key, value, self.policy.read_ttl).await;
    let stored = self.source.store(id, value).await;

    match (cached, stored) {
      (Ok(()), Ok(())) => {
        Counters::bump(&self.counters.writes);
        tracing::debug!("Write-through: {}", key);
        Ok(())
      }
      (Ok(()), Err(e)) => {
        Counters::bump(&self.counters.partial_writes);
        tracing::warn!("Write-through of {} reached the cache only: {}", key, e);
        Err(Error::PartialWrite {
          written: WriteSide::Cache,
          reason: e.to_string(),
        })
      }
      (Err(e), Ok(())) => {
        Counters::bump(&self.counters.partial_writes);
        tracing::warn!("Write-through of {} reached the source only: {}", key, e);
        Err(Error::PartialWrite {
          written: WriteSide::Source,
          reason: e.to_string(),
        })
      }
      (Err(cache_err), Err(source_err)) => {
        tracing::warn!(
          "Write-through of {} failed on both sides: cache: {}; source: {}",
          key,
          cache_err,
          source_err
        );
        Err(cache_err)
      }
    }
  }

  /// Preload `ids` with the warm TTL. Returns how many entries were cached;
  /// a failure on one id is logged and the rest continue.
  pub async fn warm<I, S>(&self, ids: I) -> usize
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut cached = 0;
    for id in ids {
      let id = id.as_ref();
      let value = match self.fetch(id).await {
        Ok(Some(value)) => value,
        Ok(None) => {
          tracing::warn!("Warm-up skipped {}: not found in source", id);
          continue;
        }
        Err(e) => {
          tracing::warn!("Warm-up skipped {}: {}", id, e);
          continue;
        }
      };

      let key = self.cache_key(id);
      match self.put(&key, &value, self.policy.warm_ttl).await {
        Ok(()) => {
          Counters::bump(&self.counters.warmed);
          cached += 1;
        }
        Err(e) => tracing::warn!("Warm-up could not cache {}: {}", key, e),
      }
    }
    tracing::info!("Cache warm-up stored {} entries", cached);
    cached
  }

  /// Drop the cached entry for `id`. The source is not touched.
  pub async fn invalidate(&self, id: &str) -> Result<bool> {
    let key = self.cache_key(id);
    let removed = self.store.acquire().await?.delete(&key).await?;
    if removed {
      tracing::debug!("Invalidated {}", key);
    }
    Ok(removed)
  }

  pub fn stats(&self) -> CacheStats {
    self.counters.snapshot()
  }

  async fn fetch(&self, id: &str) -> Result<Option<Vec<u8>>> {
    Counters::bump(&self.counters.backing_fetches);
    self.source.fetch(id).await.map_err(|e| {
      Counters::bump(&self.counters.fetch_failures);
      e
    })
  }

  async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
    let mut conn = self.store.acquire().await?;
    conn.set(key, value, Some(ttl)).await
  }
}
