//! Flash-sale inventory
//!
//! A product is three string keys: `<prefix>stock:<id>`, `<prefix>sold:<id>`
//! and `<prefix>price:<id>`. Purchases deduct stock with WATCH/MULTI/EXEC, so
//! correctness rests on the store's conditional commit and never on
//! in-process locks. Each successful purchase writes a JSON order record to
//! `<prefix>order:<userId>:<productId>:<timestampMicros>` without a TTL.

mod order;
pub mod retry;

use std::sync::Arc;

use crate::config::InventorySection;
use crate::error::{Error, Result};
use crate::keys::KeySpace;
use crate::store::{parse_i64, KeyValueStore, StoreConnection, Transaction, TxReply};

pub use order::{Order, ProductStatus, PurchaseOutcome};
pub use retry::{with_retry, RetryPolicy};

pub struct Inventory {
  store: Arc<dyn KeyValueStore>,
  keys: KeySpace,
  retry: RetryPolicy,
}

impl Inventory {
  pub fn new(store: Arc<dyn KeyValueStore>, keys: KeySpace, retry: RetryPolicy) -> Self {
    Self { store, keys, retry }
  }

  pub fn from_config(store: Arc<dyn KeyValueStore>, section: &InventorySection) -> Self {
    Self::new(
      store,
      KeySpace::new(section.prefix.clone()),
      RetryPolicy::from(section),
    )
  }

  pub fn keys(&self) -> &KeySpace {
    &self.keys
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.retry
  }

  pub fn stock_key(&self, product_id: &str) -> String {
    self.keys.key("stock", product_id)
  }

  pub fn sold_key(&self, product_id: &str) -> String {
    self.keys.key("sold", product_id)
  }

  pub fn price_key(&self, product_id: &str) -> String {
    self.keys.key("price", product_id)
  }

  pub fn order_key(&self, order: &Order) -> String {
    self.keys.key(
      "order",
      &format!(
        "{}:{}:{}",
        order.user_id,
        order.product_id,
        order.timestamp_micros()
      ),
    )
  }

  /// Set stock, `sold = 0` and price in one MULTI/EXEC. Overwrites an existing
  /// product.
  pub async fn initialize_product(&self, product_id: &str, stock: u64, price: f64) -> Result<()> {
    if product_id.is_empty() {
      return Err(Error::invalid_argument("product id must not be empty"));
    }
    if !price.is_finite() || price < 0.0 {
      return Err(Error::invalid_argument(format!(
        "price must be a non-negative number, got {}",
        price
      )));
    }
    let stock = i64::try_from(stock)
      .map_err(|_| Error::invalid_argument(format!("stock {} is out of range", stock)))?;

    let mut conn = self.store.acquire().await?;
    let mut tx = Transaction::begin(&mut *conn);
    tx.set(self.stock_key(product_id), stock.to_string())
      .set(self.sold_key(product_id), "0")
      .set(self.price_key(product_id), price.to_string());

    match tx.commit().await? {
      Some(_) => {
        tracing::info!(
          "Initialized product {} (stock {}, price {})",
          product_id,
          stock,
          price
        );
        Ok(())
      }
      None => Err(Error::ConflictAborted),
    }
  }

  /// One optimistic purchase attempt on a pooled connection
  pub async fn purchase(
    &self,
    product_id: &str,
    user_id: &str,
    quantity: u64,
  ) -> Result<PurchaseOutcome> {
    let mut conn = self.store.acquire().await?;
    self.purchase_on(&mut *conn, product_id, user_id, quantity).await
  }

  /// One optimistic purchase attempt on a caller-held connection. Any watch
  /// taken here is released before an error is returned.
  pub async fn purchase_on(
    &self,
    conn: &mut dyn StoreConnection,
    product_id: &str,
    user_id: &str,
    quantity: u64,
  ) -> Result<PurchaseOutcome> {
    if quantity == 0 {
      return Err(Error::invalid_argument("quantity must be positive"));
    }
    let delta = i64::try_from(quantity)
      .map_err(|_| Error::invalid_argument(format!("quantity {} is out of range", quantity)))?;

    let stock_key = self.stock_key(product_id);
    let sold_key = self.sold_key(product_id);
    conn.watch(&[stock_key.as_str(), sold_key.as_str()]).await?;

    match self
      .attempt(&mut *conn, &stock_key, &sold_key, product_id, user_id, delta)
      .await
    {
      Ok(outcome) => Ok(outcome),
      Err(e) => {
        if let Err(unwatch_err) = conn.unwatch().await {
          tracing::warn!("UNWATCH after failed purchase failed: {}", unwatch_err);
        }
        Err(e)
      }
    }
  }

  async fn attempt(
    &self,
    conn: &mut dyn StoreConnection,
    stock_key: &str,
    sold_key: &str,
    product_id: &str,
    user_id: &str,
    delta: i64,
  ) -> Result<PurchaseOutcome> {
    let stock = match conn.get(stock_key).await? {
      Some(raw) => parse_i64(stock_key, &raw)?,
      None => 0,
    };
    // INCRBY on a corrupt counter would fail after DECRBY already ran
    let sold = match conn.get(sold_key).await? {
      Some(raw) => parse_i64(sold_key, &raw)?,
      None => 0,
    };
    if sold.checked_add(delta).is_none() {
      return Err(Error::invalid_value(format!("{} would overflow", sold_key)));
    }

    if delta > stock {
      conn.unwatch().await?;
      tracing::debug!(
        "Purchase of {} x{} by {}: out of stock ({} left)",
        product_id,
        delta,
        user_id,
        stock
      );
      return Ok(PurchaseOutcome::OutOfStock);
    }

    // Audit records are never overwritten: step past a taken timestamp, and
    // watch the chosen key so a concurrent writer aborts this EXEC
    let mut order = Order::new(user_id, product_id, delta as u64);
    let order_key = loop {
      let key = self.order_key(&order);
      conn.watch(&[key.as_str()]).await?;
      if !conn.exists(&key).await? {
        break key;
      }
      order.created_at += chrono::Duration::microseconds(1);
    };
    let record = serde_json::to_vec(&order)
      .map_err(|e| Error::invalid_value(format!("order record: {}", e)))?;

    let mut tx = Transaction::begin(conn);
    tx.decr_by(stock_key, delta)
      .incr_by(sold_key, delta)
      .set(order_key, record);

    match tx.commit().await? {
      Some(replies) => {
        if let Some(remaining) = replies.first().and_then(TxReply::as_integer) {
          if remaining < 0 {
            tracing::error!(
              "Stock of {} went negative ({}) after a committed purchase",
              product_id,
              remaining
            );
          }
        }
        tracing::debug!(
          "Purchase of {} x{} by {} committed as order {}",
          product_id,
          delta,
          user_id,
          order.order_id
        );
        Ok(PurchaseOutcome::Success(order))
      }
      None => {
        tracing::debug!(
          "Purchase of {} by {} aborted: stock changed concurrently",
          product_id,
          user_id
        );
        Ok(PurchaseOutcome::Failed)
      }
    }
  }

  /// `purchase` retried with backoff while it reports FAILED or the store is
  /// unavailable. Returns FAILED when every attempt lost a conflict.
  pub async fn purchase_with_retry(
    &self,
    product_id: &str,
    user_id: &str,
    quantity: u64,
  ) -> Result<PurchaseOutcome> {
    let result = with_retry(&self.retry, "purchase", move || async move {
      match self.purchase(product_id, user_id, quantity).await? {
        PurchaseOutcome::Failed => Err(Error::ConflictAborted),
        outcome => Ok(outcome),
      }
    })
    .await;

    match result {
      Err(Error::ConflictAborted) => Ok(PurchaseOutcome::Failed),
      other => other,
    }
  }

  /// Stock, sold and price read in one MULTI/EXEC. `None` when the product's
  /// stock key does not exist.
  pub async fn status(&self, product_id: &str) -> Result<Option<ProductStatus>> {
    let stock_key = self.stock_key(product_id);
    let sold_key = self.sold_key(product_id);
    let price_key = self.price_key(product_id);

    let mut conn = self.store.acquire().await?;
    let mut tx = Transaction::begin(&mut *conn);
    tx.get(stock_key.as_str())
      .get(sold_key.as_str())
      .get(price_key.as_str());
    let replies = tx.commit().await?.ok_or(Error::ConflictAborted)?;

    let mut values = replies.into_iter().map(TxReply::into_value);
    let (stock, sold, price) = (
      values.next().flatten(),
      values.next().flatten(),
      values.next().flatten(),
    );

    let Some(stock) = stock else {
      return Ok(None);
    };
    let sold = sold.ok_or_else(|| Error::invalid_value(format!("{} is missing", sold_key)))?;
    let price = price.ok_or_else(|| Error::invalid_value(format!("{} is missing", price_key)))?;

    Ok(Some(ProductStatus {
      stock: parse_i64(&stock_key, &stock)?,
      sold: parse_i64(&sold_key, &sold)?,
      price: parse_price(&price_key, &price)?,
    }))
  }
}

fn parse_price(key: &str, raw: &[u8]) -> Result<f64> {
  std::str::from_utf8(raw)
    .ok()
    .and_then(|s| s.trim().parse::<f64>().ok())
    .filter(|p| p.is_finite())
    .ok_or_else(|| Error::invalid_value(format!("{} is not a price", key)))
}
