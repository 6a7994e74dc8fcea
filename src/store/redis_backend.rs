//! Redis-backed store over a deadpool connection pool

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;

use super::{validate_ttl, KeyValueStore, StoreConnection, TxOp, TxReply};
use crate::config::RedisSection;
use crate::error::{Error, Result};

/// Pool of dedicated Redis connections; a checked-out connection has one user
/// at a time.
pub struct RedisStore {
  pool: Pool,
  url: String,
}

impl RedisStore {
  /// Build the pool and verify the server answers PING
  pub async fn connect(section: &RedisSection) -> Result<Self> {
    let pool = PoolConfig::from_url(section.url.as_str())
      .builder()
      .map_err(|e| Error::Config(format!("invalid redis url: {}", e)))?
      .max_size(section.max_connections.max(1))
      .wait_timeout(Some(section.acquire_timeout()))
      .runtime(Runtime::Tokio1)
      .build()
      .map_err(|e| Error::Config(format!("failed to build redis pool: {}", e)))?;

    let store = Self {
      pool,
      url: section.redacted_url(),
    };
    store.ping().await?;
    tracing::info!(
      "Connected to Redis at {} (pool size {})",
      store.url,
      section.max_connections
    );
    Ok(store)
  }

  /// Connection URL with any password masked
  pub fn url(&self) -> &str {
    &self.url
  }
}

#[async_trait]
impl KeyValueStore for RedisStore {
  async fn acquire(&self) -> Result<Box<dyn StoreConnection>> {
    if self.pool.is_closed() {
      return Err(Error::unavailable("store closed"));
    }
    let conn = self.pool.get().await?;
    Ok(Box::new(RedisConnection {
      conn,
      watching: false,
    }))
  }

  async fn ping(&self) -> Result<()> {
    let mut conn = self.pool.get().await?;
    redis::cmd("PING").query_async::<()>(&mut conn).await?;
    Ok(())
  }

  fn close(&self) {
    if !self.pool.is_closed() {
      self.pool.close();
      tracing::info!("Redis pool closed ({})", self.url);
    }
  }

  fn is_closed(&self) -> bool {
    self.pool.is_closed()
  }
}

struct RedisConnection {
  conn: Connection,
  watching: bool,
}

impl RedisConnection {
  fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis; sub-millisecond TTLs round up
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
  }

  fn convert_reply(value: redis::Value) -> TxReply {
    match value {
      redis::Value::Nil => TxReply::Value(None),
      redis::Value::Int(i) => TxReply::Integer(i),
      redis::Value::BulkString(bytes) => TxReply::Value(Some(bytes)),
      _ => TxReply::Ok,
    }
  }
}

#[async_trait]
impl StoreConnection for RedisConnection {
  async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.conn.get(key).await?)
  }

  async fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
    validate_ttl(ttl)?;
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
      cmd.arg("PX").arg(Self::ttl_millis(ttl));
    }
    cmd.query_async::<()>(&mut self.conn).await?;
    Ok(())
  }

  async fn delete(&mut self, key: &str) -> Result<bool> {
    let removed: i64 = self.conn.del(key).await?;
    Ok(removed > 0)
  }

  async fn exists(&mut self, key: &str) -> Result<bool> {
    Ok(self.conn.exists(key).await?)
  }

  async fn ttl(&mut self, key: &str) -> Result<Option<Duration>> {
    // -2: missing, -1: no expiry
    let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut self.conn).await?;
    Ok((millis > 0).then(|| Duration::from_millis(millis as u64)))
  }

  async fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
    Ok(self.conn.incr(key, delta).await?)
  }

  async fn decr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
    Ok(self.conn.decr(key, delta).await?)
  }

  async fn watch(&mut self, keys: &[&str]) -> Result<()> {
    redis::cmd("WATCH")
      .arg(keys)
      .query_async::<()>(&mut self.conn)
      .await?;
    self.watching = true;
    Ok(())
  }

  async fn unwatch(&mut self) -> Result<()> {
    if self.watching {
      redis::cmd("UNWATCH").query_async::<()>(&mut self.conn).await?;
      self.watching = false;
    }
    Ok(())
  }

  async fn exec(&mut self, ops: Vec<TxOp>) -> Result<Option<Vec<TxReply>>> {
    if ops.is_empty() {
      // redis-rs short-circuits empty pipelines, so send MULTI/EXEC directly
      redis::cmd("MULTI").query_async::<()>(&mut self.conn).await?;
      self.watching = false;
      let replies: Option<Vec<redis::Value>> =
        redis::cmd("EXEC").query_async(&mut self.conn).await?;
      return Ok(replies.map(|_| Vec::new()));
    }

    let mut pipe = redis::pipe();
    pipe.atomic();
    for op in &ops {
      match op {
        TxOp::Get { key } => {
          pipe.cmd("GET").arg(key);
        }
        TxOp::Set { key, value, ttl } => {
          validate_ttl(*ttl)?;
          pipe.cmd("SET").arg(key).arg(value.as_slice());
          if let Some(ttl) = ttl {
            pipe.arg("PX").arg(Self::ttl_millis(*ttl));
          }
        }
        TxOp::Delete { key } => {
          pipe.cmd("DEL").arg(key);
        }
        TxOp::IncrBy { key, delta } => {
          pipe.cmd("INCRBY").arg(key).arg(*delta);
        }
        TxOp::DecrBy { key, delta } => {
          pipe.cmd("DECRBY").arg(key).arg(*delta);
        }
      }
    }

    // EXEC clears watches whether or not it aborts
    self.watching = false;
    let replies: Option<Vec<redis::Value>> = pipe.query_async(&mut self.conn).await?;
    Ok(replies.map(|values| values.into_iter().map(Self::convert_reply).collect()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ttl_millis_rounds_up_sub_millisecond() {
    assert_eq!(RedisConnection::ttl_millis(Duration::from_micros(1)), 1);
    assert_eq!(RedisConnection::ttl_millis(Duration::from_millis(1500)), 1500);
  }

  #[test]
  fn test_ttl_millis_saturates() {
    assert_eq!(RedisConnection::ttl_millis(Duration::MAX), u64::MAX);
    assert_eq!(
      RedisConnection::ttl_millis(Duration::from_secs(u64::MAX / 1000 + 1)),
      u64::MAX
    );
  }
}
