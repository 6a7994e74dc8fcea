//! flashcache: cache-aside access and flash-sale inventory over a key-value
//! store with optimistic-lock transactions.

// Shared plumbing
pub mod config;
pub mod error;
pub mod keys;

// Store capability and backends
pub mod store;

// Features built on the store
pub mod cache;
pub mod inventory;
pub mod source;

pub use cache::{CacheAside, CachePolicy, CacheStats};
pub use config::{BackendType, ServiceConfig};
pub use error::{Error, Result, WriteSide};
pub use inventory::{Inventory, Order, ProductStatus, PurchaseOutcome, RetryPolicy};
pub use keys::KeySpace;
pub use source::{BackingSource, MemorySource};
pub use store::{KeyValueStore, MemoryStore, StoreConnection, Transaction, TxOp, TxReply};
#[cfg(feature = "redis")]
pub use store::RedisStore;
