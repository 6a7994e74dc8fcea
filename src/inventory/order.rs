use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit record written exactly once per successful purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
  pub order_id: Uuid,
  pub user_id: String,
  pub product_id: String,
  pub quantity: u64,
  pub created_at: DateTime<Utc>,
}

impl Order {
  pub fn new(user_id: &str, product_id: &str, quantity: u64) -> Self {
    Self {
      order_id: Uuid::new_v4(),
      user_id: user_id.to_string(),
      product_id: product_id.to_string(),
      quantity,
      created_at: Utc::now(),
    }
  }

  /// Microseconds since the epoch; part of the order key
  pub fn timestamp_micros(&self) -> i64 {
    self.created_at.timestamp_micros()
  }
}

/// Stock, units sold and unit price read as one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProductStatus {
  pub stock: i64,
  pub sold: i64,
  pub price: f64,
}

/// Result of a single purchase attempt
#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseOutcome {
  Success(Order),
  OutOfStock,
  /// Another writer changed the stock between WATCH and EXEC
  Failed,
}

impl PurchaseOutcome {
  pub fn as_str(&self) -> &'static str {
    match self {
      PurchaseOutcome::Success(_) => "SUCCESS",
      PurchaseOutcome::OutOfStock => "OUT_OF_STOCK",
      PurchaseOutcome::Failed => "FAILED",
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, PurchaseOutcome::Success(_))
  }

  pub fn order(&self) -> Option<&Order> {
    match self {
      PurchaseOutcome::Success(order) => Some(order),
      _ => None,
    }
  }
}

impl std::fmt::Display for PurchaseOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}
