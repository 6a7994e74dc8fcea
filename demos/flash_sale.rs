//! Flash-sale simulation: many buyers race for limited stock, then a
//! cache-aside pass over user profiles.
//!
//! Run with: cargo run --example flash_sale -- --stock 50 --buyers 200

use clap::Parser;
use flashcache::cache::{CacheAside, CachePolicy};
use flashcache::config::{BackendType, ServiceConfig};
use flashcache::inventory::{Inventory, PurchaseOutcome};
use flashcache::source::MemorySource;
use flashcache::store;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flash_sale", about = "Flash-sale and cache-aside demo", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  /// memory or redis (memory when no config file is found)
  #[arg(long)]
  backend: Option<BackendType>,
  #[arg(long, env = "FLASHCACHE_REDIS_URL")]
  redis_url: Option<String>,
  #[arg(long, default_value_t = 100)]
  stock: u64,
  #[arg(long, default_value_t = 250)]
  buyers: usize,
  #[arg(long, default_value_t = 1)]
  quantity: u64,
  #[arg(long)]
  log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  let mut config = if let Some(path) = &args.config {
    ServiceConfig::from_file(path)?
  } else {
    ServiceConfig::find_and_load()?.unwrap_or_else(|| ServiceConfig {
      backend: BackendType::Memory,
      ..Default::default()
    })
  };

  if let Some(url) = args.redis_url {
    config.redis.url = url;
    config.backend = BackendType::Redis;
  }
  if let Some(backend) = args.backend {
    config.backend = backend;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let store = store::connect(&config).await?;
  tracing::info!("Using {} backend", config.backend);

  // Flash sale
  let inventory = Arc::new(Inventory::from_config(store.clone(), &config.inventory));
  let product = format!("demo-{}", uuid::Uuid::new_v4().simple());
  inventory.initialize_product(&product, args.stock, 19.99).await?;

  let mut handles = Vec::with_capacity(args.buyers);
  for i in 0..args.buyers {
    let inventory = inventory.clone();
    let product = product.clone();
    let quantity = args.quantity;
    handles.push(tokio::spawn(async move {
      inventory
        .purchase_with_retry(&product, &format!("buyer{}", i), quantity)
        .await
    }));
  }

  let (mut success, mut out_of_stock, mut failed, mut errors) = (0, 0, 0, 0);
  for handle in handles {
    match handle.await? {
      Ok(PurchaseOutcome::Success(_)) => success += 1,
      Ok(PurchaseOutcome::OutOfStock) => out_of_stock += 1,
      Ok(PurchaseOutcome::Failed) => failed += 1,
      Err(e) => {
        tracing::warn!("Purchase error: {}", e);
        errors += 1;
      }
    }
  }

  let status = inventory
    .status(&product)
    .await?
    .ok_or_else(|| anyhow::anyhow!("product {} vanished", product))?;
  println!(
    "{}: {} sold, {} left at {:.2} | SUCCESS {} OUT_OF_STOCK {} FAILED {} errors {}",
    product, status.sold, status.stock, status.price, success, out_of_stock, failed, errors
  );

  // Cache-aside
  let source = Arc::new(MemorySource::new());
  for id in 1..=20 {
    source.insert(id.to_string(), format!("User:{}:profile", id));
  }
  let policy = CachePolicy::from(&config.cache).with_prefix(format!("demo:{}:", product));
  let cache = CacheAside::new(store.clone(), source.clone(), policy)?;

  let ids: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
  let warmed = cache.warm(&ids).await;
  for id in 1..=20 {
    cache.read(&id.to_string()).await?;
  }
  cache.write("1", b"User:1:renamed").await?;

  let stats = cache.stats();
  println!(
    "cache: warmed {} | hits {} misses {} (hit rate {:.0}%) | source fetches {}",
    warmed,
    stats.hits,
    stats.misses,
    stats.hit_rate() * 100.0,
    source.fetch_count()
  );

  store.close();
  Ok(())
}
