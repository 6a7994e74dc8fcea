//! In-process store with Redis-compatible WATCH/MULTI/EXEC semantics

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::entry::StoredEntry;
use super::{parse_i64, validate_ttl, KeyValueStore, StoreConnection, TxOp, TxReply};
use crate::error::{Error, Result};

const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Keyspace plus the modification clock used to validate watches
#[derive(Default)]
struct State {
  data: HashMap<String, StoredEntry>,
  /// Version at which a key was deleted or expired, so a watcher sees the change.
  /// Only recorded while some connection is watching.
  tombstones: HashMap<String, u64>,
  /// Open watch sessions: clock at first WATCH -> number of connections
  watch_sessions: BTreeMap<u64, usize>,
  clock: u64,
}

impl State {
  fn next_version(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  fn record_removal(&mut self, key: &str) {
    let version = self.next_version();
    if !self.watch_sessions.is_empty() {
      self.tombstones.insert(key.to_string(), version);
    }
  }

  /// Drop `key` if its TTL has run out. Returns true when it was dropped.
  fn purge_if_expired(&mut self, key: &str) -> bool {
    let expired = self.data.get(key).map(|e| e.is_expired()).unwrap_or(false);
    if expired {
      self.data.remove(key);
      self.record_removal(key);
    }
    expired
  }

  /// Start a watch session; returns its start on the clock
  fn open_session(&mut self) -> u64 {
    *self.watch_sessions.entry(self.clock).or_insert(0) += 1;
    self.clock
  }

  fn close_session(&mut self, start: u64) {
    if let Some(count) = self.watch_sessions.get_mut(&start) {
      *count -= 1;
      if *count == 0 {
        self.watch_sessions.remove(&start);
      }
    }
    self.prune_tombstones();
  }

  /// Forget removals no open session can observe
  fn prune_tombstones(&mut self) {
    match self.watch_sessions.keys().next().copied() {
      None => self.tombstones.clear(),
      Some(oldest) => self.tombstones.retain(|_, version| *version > oldest),
    }
  }

  /// Last modification of `key` on the clock, 0 if unknown
  fn version_of(&mut self, key: &str) -> u64 {
    self.purge_if_expired(key);
    self
      .data
      .get(key)
      .map(|e| e.version)
      .or_else(|| self.tombstones.get(key).copied())
      .unwrap_or(0)
  }

  fn get(&mut self, key: &str) -> Option<Vec<u8>> {
    self.purge_if_expired(key);
    self.data.get(key).map(|e| e.value.clone())
  }

  fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
    let version = self.next_version();
    self.tombstones.remove(key);
    self
      .data
      .insert(key.to_string(), StoredEntry::new(value, ttl, version));
  }

  fn delete(&mut self, key: &str) -> bool {
    self.purge_if_expired(key);
    if self.data.remove(key).is_some() {
      self.record_removal(key);
      true
    } else {
      false
    }
  }

  fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
    self.purge_if_expired(key);
    let current = match self.data.get(key) {
      Some(entry) => parse_i64(key, &entry.value)?,
      None => 0,
    };
    let updated = current
      .checked_add(delta)
      .ok_or_else(|| Error::invalid_value(format!("increment on {} would overflow", key)))?;
    let version = self.next_version();
    let encoded = updated.to_string().into_bytes();
    match self.data.get_mut(key) {
      Some(entry) => entry.overwrite_value(encoded, version),
      None => {
        self.tombstones.remove(key);
        self
          .data
          .insert(key.to_string(), StoredEntry::new(encoded, None, version));
      }
    }
    Ok(updated)
  }

  fn apply(&mut self, op: TxOp) -> Result<TxReply> {
    match op {
      TxOp::Get { key } => Ok(TxReply::Value(self.get(&key))),
      TxOp::Set { key, value, ttl } => {
        validate_ttl(ttl)?;
        self.set(&key, value, ttl);
        Ok(TxReply::Ok)
      }
      TxOp::Delete { key } => Ok(TxReply::Integer(self.delete(&key) as i64)),
      TxOp::IncrBy { key, delta } => self.incr_by(&key, delta).map(TxReply::Integer),
      TxOp::DecrBy { key, delta } => {
        let negated = delta
          .checked_neg()
          .ok_or_else(|| Error::invalid_argument("decrement out of range"))?;
        self.incr_by(&key, negated).map(TxReply::Integer)
      }
    }
  }
}

struct Shared {
  state: RwLock<State>,
  closed: AtomicBool,
}

impl Shared {
  fn ensure_open(&self) -> Result<()> {
    if self.closed.load(Ordering::Acquire) {
      Err(Error::unavailable("store closed"))
    } else {
      Ok(())
    }
  }
}

/// In-memory key-value store with a bounded connection pool
pub struct MemoryStore {
  shared: Arc<Shared>,
  permits: Arc<Semaphore>,
  max_connections: usize,
  acquire_timeout: Duration,
}

impl MemoryStore {
  pub fn new(max_connections: usize, acquire_timeout: Duration) -> Self {
    let max_connections = max_connections.max(1);
    Self {
      shared: Arc::new(Shared {
        state: RwLock::new(State::default()),
        closed: AtomicBool::new(false),
      }),
      permits: Arc::new(Semaphore::new(max_connections)),
      max_connections,
      acquire_timeout,
    }
  }

  pub fn max_connections(&self) -> usize {
    self.max_connections
  }

  /// Connections that can be checked out right now
  pub fn available_connections(&self) -> usize {
    self.permits.available_permits()
  }

  /// Remove every entry whose TTL has run out
  pub fn purge_expired(&self) -> usize {
    let mut state = self.shared.state.write();
    let expired_keys: Vec<String> = state
      .data
      .iter()
      .filter(|(_, entry)| entry.is_expired())
      .map(|(k, _)| k.clone())
      .collect();

    let count = expired_keys.len();
    for key in expired_keys {
      state.purge_if_expired(&key);
    }
    state.prune_tombstones();
    count
  }

  /// Live (unexpired) keys
  pub fn len(&self) -> usize {
    let state = self.shared.state.read();
    state.data.values().filter(|e| !e.is_expired()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_CONNECTIONS, DEFAULT_ACQUIRE_TIMEOUT)
  }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
  async fn acquire(&self) -> Result<Box<dyn StoreConnection>> {
    self.shared.ensure_open()?;
    let permit = match tokio::time::timeout(
      self.acquire_timeout,
      self.permits.clone().acquire_owned(),
    )
    .await
    {
      Ok(Ok(permit)) => permit,
      Ok(Err(_)) => return Err(Error::unavailable("store closed")),
      Err(_) => {
        tracing::warn!(
          "Memory store pool exhausted after {:?} ({} connections)",
          self.acquire_timeout,
          self.max_connections
        );
        return Err(Error::unavailable("connection pool exhausted"));
      }
    };

    Ok(Box::new(MemoryConnection {
      shared: self.shared.clone(),
      watched: HashMap::new(),
      session: None,
      _permit: permit,
    }))
  }

  async fn ping(&self) -> Result<()> {
    self.shared.ensure_open()
  }

  fn close(&self) {
    if !self.shared.closed.swap(true, Ordering::AcqRel) {
      self.permits.close();
      tracing::info!("Memory store closed");
    }
  }

  fn is_closed(&self) -> bool {
    self.shared.closed.load(Ordering::Acquire)
  }
}

/// Checked-out connection; the pool slot is released when this is dropped
struct MemoryConnection {
  shared: Arc<Shared>,
  /// key -> clock at WATCH time; a later modification means a conflict
  watched: HashMap<String, u64>,
  session: Option<u64>,
  _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
  fn release_watches(&mut self) {
    self.watched.clear();
    if let Some(start) = self.session.take() {
      self.shared.state.write().close_session(start);
    }
  }
}

impl Drop for MemoryConnection {
  fn drop(&mut self) {
    self.release_watches();
  }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
  async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
    self.shared.ensure_open()?;
    Ok(self.shared.state.write().get(key))
  }

  async fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
    self.shared.ensure_open()?;
    validate_ttl(ttl)?;
    self.shared.state.write().set(key, value.to_vec(), ttl);
    Ok(())
  }

  async fn delete(&mut self, key: &str) -> Result<bool> {
    self.shared.ensure_open()?;
    Ok(self.shared.state.write().delete(key))
  }

  async fn exists(&mut self, key: &str) -> Result<bool> {
    self.shared.ensure_open()?;
    let mut state = self.shared.state.write();
    state.purge_if_expired(key);
    Ok(state.data.contains_key(key))
  }

  async fn ttl(&mut self, key: &str) -> Result<Option<Duration>> {
    self.shared.ensure_open()?;
    let mut state = self.shared.state.write();
    state.purge_if_expired(key);
    Ok(state.data.get(key).and_then(|e| e.ttl_remaining()))
  }

  async fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
    self.shared.ensure_open()?;
    self.shared.state.write().incr_by(key, delta)
  }

  async fn decr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
    self.shared.ensure_open()?;
    self
      .shared
      .state
      .write()
      .apply(TxOp::DecrBy {
        key: key.to_string(),
        delta,
      })?
      .as_integer()
      .ok_or_else(|| Error::invalid_value(format!("{} is not an integer", key)))
  }

  async fn watch(&mut self, keys: &[&str]) -> Result<()> {
    self.shared.ensure_open()?;
    let mut state = self.shared.state.write();
    if self.session.is_none() {
      self.session = Some(state.open_session());
    }
    for key in keys {
      // A key watched twice keeps its first WATCH time
      if !self.watched.contains_key(*key) {
        state.purge_if_expired(key);
        self.watched.insert(key.to_string(), state.clock);
      }
    }
    Ok(())
  }

  async fn unwatch(&mut self) -> Result<()> {
    self.release_watches();
    Ok(())
  }

  async fn exec(&mut self, ops: Vec<TxOp>) -> Result<Option<Vec<TxReply>>> {
    self.shared.ensure_open()?;
    let watched = std::mem::take(&mut self.watched);
    let session = self.session.take();
    let mut state = self.shared.state.write();

    let mut changed = None;
    for (key, watched_at) in &watched {
      if state.version_of(key) > *watched_at {
        changed = Some(key);
        break;
      }
    }
    if let Some(start) = session {
      state.close_session(start);
    }
    if let Some(key) = changed {
      tracing::debug!("EXEC aborted: watched key {} changed", key);
      return Ok(None);
    }

    // Like Redis, a failing command neither stops nor rolls back the others
    let mut replies = Vec::with_capacity(ops.len());
    let mut first_error = None;
    for op in ops {
      match state.apply(op) {
        Ok(reply) => replies.push(reply),
        Err(e) => {
          first_error.get_or_insert(e);
        }
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(Some(replies)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_state_versions_advance() {
    let mut state = State::default();
    assert_eq!(state.version_of("k"), 0);
    state.set("k", b"1".to_vec(), None);
    let v1 = state.version_of("k");
    state.incr_by("k", 1).unwrap();
    let v2 = state.version_of("k");
    assert!(v2 > v1);
    assert!(state.delete("k"));
    let v3 = state.version_of("k");
    assert!(v3 > v2);
  }

  #[test]
  fn test_state_incr_rejects_non_integer() {
    let mut state = State::default();
    state.set("k", b"abc".to_vec(), None);
    assert!(matches!(state.incr_by("k", 1), Err(Error::InvalidValue(_))));
  }

  #[test]
  fn test_state_incr_overflow() {
    let mut state = State::default();
    state.set("k", i64::MAX.to_string().into_bytes(), None);
    assert!(state.incr_by("k", 1).is_err());
    assert!(state.apply(TxOp::DecrBy {
      key: "k".into(),
      delta: i64::MIN
    })
    .is_err());
  }

  #[test]
  fn test_removals_leave_no_tombstones_without_watchers() {
    let mut state = State::default();
    for i in 0..100 {
      let key = format!("k{}", i);
      state.set(&key, b"v".to_vec(), None);
      assert!(state.delete(&key));
    }
    assert!(state.tombstones.is_empty());
  }

  #[test]
  fn test_tombstones_live_only_as_long_as_a_watch() {
    let mut state = State::default();
    state.set("k", b"v".to_vec(), None);
    let start = state.open_session();
    let watched_at = state.clock;

    assert!(state.delete("k"));
    assert!(state.version_of("k") > watched_at);
    assert_eq!(state.tombstones.len(), 1);

    state.close_session(start);
    assert!(state.tombstones.is_empty());
    assert!(state.watch_sessions.is_empty());
  }

  #[test]
  fn test_prune_keeps_tombstones_newer_than_oldest_session() {
    let mut state = State::default();
    state.set("a", b"1".to_vec(), None);
    state.set("b", b"1".to_vec(), None);
    let first = state.open_session();
    state.delete("a");
    let second = state.open_session();
    state.delete("b");

    state.close_session(first);
    assert!(!state.tombstones.contains_key("a"));
    assert!(state.tombstones.contains_key("b"));

    state.close_session(second);
    assert!(state.tombstones.is_empty());
  }

  #[tokio::test]
  async fn test_purge_expired_leaves_no_tombstones() {
    let store = MemoryStore::new(2, Duration::from_millis(10));
    let mut conn = store.acquire().await.unwrap();
    for i in 0..50 {
      conn
        .set(&format!("k{}", i), b"v", Some(Duration::from_millis(5)))
        .await
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.purge_expired(), 50);
    assert!(store.shared.state.read().tombstones.is_empty());
  }

  #[tokio::test]
  async fn test_dropped_connection_releases_its_watch() {
    let store = MemoryStore::new(2, Duration::from_millis(10));
    let mut conn = store.acquire().await.unwrap();
    conn.set("k", b"1", None).await.unwrap();
    conn.watch(&["k"]).await.unwrap();

    let mut other = store.acquire().await.unwrap();
    other.delete("k").await.unwrap();
    assert_eq!(store.shared.state.read().tombstones.len(), 1);

    drop(conn);
    let state = store.shared.state.read();
    assert!(state.watch_sessions.is_empty());
    assert!(state.tombstones.is_empty());
  }

  #[test]
  fn test_max_connections_floor() {
    let store = MemoryStore::new(0, Duration::from_millis(10));
    assert_eq!(store.max_connections(), 1);
  }
}
