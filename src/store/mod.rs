//! Key-value store capability consumed by the cache and inventory layers
//!
//! Provides:
//! - `KeyValueStore`: an explicitly constructed pool handle
//! - `StoreConnection`: one checked-out connection, returned to the pool on drop
//! - `Transaction`: MULTI/EXEC over a connection, conditional on WATCHed keys
//! - `MemoryStore` (always) and `RedisStore` (feature `redis`)

mod entry;
mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendType, ServiceConfig};
use crate::error::{Error, Result};

pub use entry::StoredEntry;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_backend::RedisStore;

/// Pool handle for a key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
  /// Check out a connection for one logical operation
  async fn acquire(&self) -> Result<Box<dyn StoreConnection>>;

  /// Round-trip to the store
  async fn ping(&self) -> Result<()>;

  /// Stop handing out connections. Connections already checked out finish
  /// their current operation.
  fn close(&self);

  fn is_closed(&self) -> bool;
}

/// A single checked-out connection
#[async_trait]
pub trait StoreConnection: Send {
  async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Set a value. A `Some` TTL must be non-zero.
  async fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

  async fn delete(&mut self, key: &str) -> Result<bool>;

  async fn exists(&mut self, key: &str) -> Result<bool>;

  /// Remaining time to live; `None` when the key is missing or persistent
  async fn ttl(&mut self, key: &str) -> Result<Option<Duration>>;

  async fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64>;

  async fn decr_by(&mut self, key: &str, delta: i64) -> Result<i64>;

  /// Mark keys so the next `exec` aborts if any of them change
  async fn watch(&mut self, keys: &[&str]) -> Result<()>;

  async fn unwatch(&mut self) -> Result<()>;

  /// Run `ops` atomically. `Ok(None)` means a watched key changed and nothing
  /// was applied. Watches are cleared either way.
  async fn exec(&mut self, ops: Vec<TxOp>) -> Result<Option<Vec<TxReply>>>;
}

/// A command queued inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
  Get {
    key: String,
  },
  Set {
    key: String,
    value: Vec<u8>,
    ttl: Option<Duration>,
  },
  Delete {
    key: String,
  },
  IncrBy {
    key: String,
    delta: i64,
  },
  DecrBy {
    key: String,
    delta: i64,
  },
}

impl TxOp {
  pub fn key(&self) -> &str {
    match self {
      TxOp::Get { key }
      | TxOp::Set { key, .. }
      | TxOp::Delete { key }
      | TxOp::IncrBy { key, .. }
      | TxOp::DecrBy { key, .. } => key,
    }
  }
}

/// Per-command reply from a committed transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TxReply {
  Ok,
  Integer(i64),
  Value(Option<Vec<u8>>),
}

impl TxReply {
  pub fn as_integer(&self) -> Option<i64> {
    match self {
      TxReply::Integer(i) => Some(*i),
      _ => None,
    }
  }

  pub fn into_value(self) -> Option<Vec<u8>> {
    match self {
      TxReply::Value(v) => v,
      _ => None,
    }
  }
}

/// MULTI/EXEC builder borrowing a connection
pub struct Transaction<'a> {
  conn: &'a mut dyn StoreConnection,
  ops: Vec<TxOp>,
}

impl<'a> Transaction<'a> {
  pub fn begin(conn: &'a mut dyn StoreConnection) -> Self {
    Self {
      conn,
      ops: Vec::new(),
    }
  }

  pub fn queue(&mut self, op: TxOp) -> &mut Self {
    self.ops.push(op);
    self
  }

  pub fn get(&mut self, key: impl Into<String>) -> &mut Self {
    self.queue(TxOp::Get { key: key.into() })
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
    self.queue(TxOp::Set {
      key: key.into(),
      value: value.into(),
      ttl: None,
    })
  }

  pub fn incr_by(&mut self, key: impl Into<String>, delta: i64) -> &mut Self {
    self.queue(TxOp::IncrBy {
      key: key.into(),
      delta,
    })
  }

  pub fn decr_by(&mut self, key: impl Into<String>, delta: i64) -> &mut Self {
    self.queue(TxOp::DecrBy {
      key: key.into(),
      delta,
    })
  }

  pub fn len(&self) -> usize {
    self.ops.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }

  /// EXEC. `Ok(None)` when a watched key changed since WATCH.
  pub async fn commit(self) -> Result<Option<Vec<TxReply>>> {
    self.conn.exec(self.ops).await
  }

  /// Drop the queued commands and release any watches
  pub async fn discard(self) -> Result<()> {
    self.conn.unwatch().await
  }
}

/// Build the backend selected by `config.backend`
pub async fn connect(config: &ServiceConfig) -> Result<Arc<dyn KeyValueStore>> {
  match config.backend {
    BackendType::Memory => Ok(Arc::new(MemoryStore::new(
      config.memory.max_connections,
      config.memory.acquire_timeout(),
    ))),
    #[cfg(feature = "redis")]
    BackendType::Redis => Ok(Arc::new(RedisStore::connect(&config.redis).await?)),
    #[cfg(not(feature = "redis"))]
    BackendType::Redis => Err(Error::Config(
      "redis backend requested but the `redis` feature is disabled".to_string(),
    )),
  }
}

/// Parse a stored decimal integer (counters, stock)
pub fn parse_i64(key: &str, raw: &[u8]) -> Result<i64> {
  std::str::from_utf8(raw)
    .ok()
    .and_then(|s| s.trim().parse::<i64>().ok())
    .ok_or_else(|| Error::invalid_value(format!("{} is not an integer", key)))
}

pub(crate) fn validate_ttl(ttl: Option<Duration>) -> Result<()> {
  match ttl {
    Some(d) if d.is_zero() => Err(Error::invalid_argument("ttl must be greater than zero")),
    _ => Ok(()),
  }
}
