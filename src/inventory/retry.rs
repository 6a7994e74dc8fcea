//! Bounded retry with exponential backoff
//!
//! The delay before retry `n` (zero-based) is `initial_backoff * 2^n`, capped
//! at `max_backoff`, plus 0-50% random jitter.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::config::InventorySection;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from(&InventorySection::default())
  }
}

impl From<&InventorySection> for RetryPolicy {
  fn from(section: &InventorySection) -> Self {
    Self {
      max_attempts: section.max_attempts,
      initial_backoff: Duration::from_millis(section.initial_backoff_ms),
      max_backoff: Duration::from_millis(section.max_backoff_ms),
    }
  }
}

impl RetryPolicy {
  /// A single attempt, no retries
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      initial_backoff: Duration::ZERO,
      max_backoff: Duration::ZERO,
    }
  }

  /// Delay before the retry following failed attempt `attempt` (zero-based)
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let capped = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);

    let jitter_range = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX) / 2;
    if jitter_range > 0 {
      capped.saturating_add(Duration::from_millis(
        rand::thread_rng().gen_range(0..=jitter_range),
      ))
    } else {
      capped
    }
  }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Returns the last error in the latter case.
pub async fn with_retry<F, Fut, T>(
  policy: &RetryPolicy,
  operation_name: &str,
  mut operation: F,
) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let attempts = policy.max_attempts.max(1);
  let mut attempt = 0;

  loop {
    match operation().await {
      Ok(value) => {
        if attempt > 0 {
          tracing::debug!("{} succeeded after {} attempts", operation_name, attempt + 1);
        }
        return Ok(value);
      }
      Err(e) if e.is_retryable() && attempt + 1 < attempts => {
        let delay = policy.backoff(attempt);
        tracing::warn!(
          "{} attempt {}/{} failed: {}; retrying in {:?}",
          operation_name,
          attempt + 1,
          attempts,
          e,
          delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => {
        if e.is_retryable() {
          tracing::warn!("{} gave up after {} attempts: {}", operation_name, attempts, e);
        }
        return Err(e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      initial_backoff: Duration::from_millis(1),
      max_backoff: Duration::from_millis(4),
    }
  }

  #[test]
  fn test_backoff_is_capped() {
    let p = RetryPolicy {
      max_attempts: 10,
      initial_backoff: Duration::from_millis(100),
      max_backoff: Duration::from_millis(1000),
    };
    let first = p.backoff(0);
    assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
    let late = p.backoff(30);
    assert!(late >= Duration::from_millis(1000) && late <= Duration::from_millis(1500));
  }

  #[test]
  fn test_backoff_saturates_at_duration_max() {
    let p = RetryPolicy {
      max_attempts: 2,
      initial_backoff: Duration::MAX,
      max_backoff: Duration::MAX,
    };
    assert_eq!(p.backoff(0), Duration::MAX);
    assert_eq!(p.backoff(5), Duration::MAX);
  }

  #[test]
  fn test_no_retry_policy_has_no_delay() {
    assert_eq!(RetryPolicy::none().backoff(3), Duration::ZERO);
  }

  #[tokio::test]
  async fn test_retries_until_success() {
    let calls = &AtomicU32::new(0);
    let result = with_retry(&policy(5), "op", move || async move {
      if calls.fetch_add(1, Ordering::SeqCst) < 2 {
        Err(Error::ConflictAborted)
      } else {
        Ok(7)
      }
    })
    .await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_gives_up_after_budget() {
    let calls = &AtomicU32::new(0);
    let result: Result<()> = with_retry(&policy(3), "op", move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(Error::unavailable("down"))
    })
    .await;
    assert!(matches!(result, Err(Error::Unavailable(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_non_retryable_error_returns_immediately() {
    let calls = &AtomicU32::new(0);
    let result: Result<()> = with_retry(&policy(5), "op", move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(Error::invalid_argument("quantity must be positive"))
    })
    .await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
