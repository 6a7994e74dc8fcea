use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of cache-aside activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  /// Calls made to the backing source by reads and warm-up
  pub backing_fetches: u64,
  pub fetch_failures: u64,
  /// Write-throughs that reached both sides
  pub writes: u64,
  pub partial_writes: u64,
  pub warmed: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

#[derive(Default)]
pub(crate) struct Counters {
  pub hits: AtomicU64,
  pub misses: AtomicU64,
  pub backing_fetches: AtomicU64,
  pub fetch_failures: AtomicU64,
  pub writes: AtomicU64,
  pub partial_writes: AtomicU64,
  pub warmed: AtomicU64,
}

impl Counters {
  pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> CacheStats {
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      backing_fetches: self.backing_fetches.load(Ordering::Relaxed),
      fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
      writes: self.writes.load(Ordering::Relaxed),
      partial_writes: self.partial_writes.load(Ordering::Relaxed),
      warmed: self.warmed.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hit_rate() {
    assert_eq!(CacheStats::default().hit_rate(), 0.0);
    let stats = CacheStats {
      hits: 3,
      misses: 1,
      ..Default::default()
    };
    assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
  }
}
