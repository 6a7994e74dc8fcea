//! Entries held by the in-memory store

use std::time::{Duration, Instant};

/// A stored value with expiry and WATCH version metadata
#[derive(Debug, Clone)]
pub struct StoredEntry {
  pub value: Vec<u8>,
  pub expires_at: Option<Instant>,
  /// Store-wide modification counter at the last write of this key
  pub version: u64,
}

impl StoredEntry {
  pub fn new(value: Vec<u8>, ttl: Option<Duration>, version: u64) -> Self {
    Self {
      value,
      expires_at: ttl.map(|d| Instant::now() + d),
      version,
    }
  }

  pub fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() >= exp)
      .unwrap_or(false)
  }

  pub fn ttl_remaining(&self) -> Option<Duration> {
    self.expires_at.and_then(|exp| {
      let now = Instant::now();
      if now >= exp {
        None
      } else {
        Some(exp - now)
      }
    })
  }

  /// Replace the value in place, keeping the expiry (INCRBY semantics)
  pub fn overwrite_value(&mut self, value: Vec<u8>, version: u64) {
    self.value = value;
    self.version = version;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_without_ttl_never_expires() {
    let entry = StoredEntry::new(b"v".to_vec(), None, 1);
    assert!(!entry.is_expired());
    assert!(entry.ttl_remaining().is_none());
  }

  #[test]
  fn test_entry_ttl_remaining() {
    let entry = StoredEntry::new(b"v".to_vec(), Some(Duration::from_secs(60)), 1);
    let remaining = entry.ttl_remaining().unwrap();
    assert!(remaining <= Duration::from_secs(60));
    assert!(remaining > Duration::from_secs(58));
  }

  #[test]
  fn test_overwrite_keeps_expiry() {
    let mut entry = StoredEntry::new(b"1".to_vec(), Some(Duration::from_secs(60)), 1);
    let expires_at = entry.expires_at;
    entry.overwrite_value(b"2".to_vec(), 5);
    assert_eq!(entry.value, b"2");
    assert_eq!(entry.version, 5);
    assert_eq!(entry.expires_at, expires_at);
  }
}
