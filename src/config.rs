//! Service configuration
//!
//! Loaded from YAML (`flashcache.yaml`), every section optional. Values may
//! reference environment variables as `$VAR` or `${VAR}`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Replace `$VAR` and `${VAR}` with the variable's value (empty when unset)
fn expand_env_vars(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  let mut rest = input;

  while let Some(pos) = rest.find('$') {
    out.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];

    if let Some(braced) = after.strip_prefix('{') {
      if let Some(end) = braced.find('}') {
        out.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
        rest = &braced[end + 1..];
        continue;
      }
      // Unterminated ${ is kept verbatim
      out.push_str(&rest[pos..]);
      return out;
    }

    let name_len = after
      .chars()
      .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
      .count();
    if name_len == 0 {
      out.push('$');
    } else {
      out.push_str(&std::env::var(&after[..name_len]).unwrap_or_default());
    }
    rest = &after[name_len..];
  }

  out.push_str(rest);
  out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
  Memory,
  #[default]
  Redis,
}

impl std::fmt::Display for BackendType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      BackendType::Memory => write!(f, "memory"),
      BackendType::Redis => write!(f, "redis"),
    }
  }
}

impl std::str::FromStr for BackendType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "memory" | "inmemory" | "builtin" => Ok(BackendType::Memory),
      "redis" => Ok(BackendType::Redis),
      _ => Err(format!("Unknown backend: {}", s)),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
  #[serde(default)]
  pub backend: BackendType,
  #[serde(default)]
  pub redis: RedisSection,
  #[serde(default)]
  pub memory: MemorySection,
  #[serde(default)]
  pub cache: CacheSection,
  #[serde(default)]
  pub inventory: InventorySection,
  #[serde(default)]
  pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSection {
  #[serde(default = "default_redis_url")]
  pub url: String,
  #[serde(default = "default_max_connections")]
  pub max_connections: usize,
  /// How long a caller waits for a free pooled connection
  #[serde(default = "default_acquire_timeout_ms")]
  pub acquire_timeout_ms: u64,
}

fn default_redis_url() -> String {
  "redis://localhost:6379".into()
}
fn default_max_connections() -> usize {
  10
}
fn default_acquire_timeout_ms() -> u64 {
  5000
}

impl Default for RedisSection {
  fn default() -> Self {
    Self {
      url: default_redis_url(),
      max_connections: default_max_connections(),
      acquire_timeout_ms: default_acquire_timeout_ms(),
    }
  }
}

impl RedisSection {
  pub fn acquire_timeout(&self) -> Duration {
    Duration::from_millis(self.acquire_timeout_ms)
  }

  /// URL safe to log: `redis://:secret@host` becomes `redis://:***@host`
  pub fn redacted_url(&self) -> String {
    match (self.url.find("://"), self.url.rfind('@')) {
      (Some(scheme_end), Some(at)) if at > scheme_end => {
        let userinfo = &self.url[scheme_end + 3..at];
        let user = userinfo.split(':').next().unwrap_or_default();
        format!("{}{}:***{}", &self.url[..scheme_end + 3], user, &self.url[at..])
      }
      _ => self.url.clone(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
  #[serde(default = "default_max_connections")]
  pub max_connections: usize,
  #[serde(default = "default_acquire_timeout_ms")]
  pub acquire_timeout_ms: u64,
}

impl Default for MemorySection {
  fn default() -> Self {
    Self {
      max_connections: default_max_connections(),
      acquire_timeout_ms: default_acquire_timeout_ms(),
    }
  }
}

impl MemorySection {
  pub fn acquire_timeout(&self) -> Duration {
    Duration::from_millis(self.acquire_timeout_ms)
  }
}

/// Cache-aside key layout and TTL policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
  #[serde(default)]
  pub prefix: String,
  #[serde(default = "default_domain")]
  pub domain: String,
  #[serde(default = "default_subfield")]
  pub subfield: Option<String>,
  /// TTL for entries stored on a read-through miss or a write-through
  #[serde(default = "default_read_ttl_secs")]
  pub read_ttl_secs: u64,
  /// TTL for entries stored by warm-up
  #[serde(default = "default_warm_ttl_secs")]
  pub warm_ttl_secs: u64,
}

fn default_domain() -> String {
  "user".into()
}
fn default_subfield() -> Option<String> {
  Some("profile".into())
}
fn default_read_ttl_secs() -> u64 {
  300
}
fn default_warm_ttl_secs() -> u64 {
  600
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      prefix: String::new(),
      domain: default_domain(),
      subfield: default_subfield(),
      read_ttl_secs: default_read_ttl_secs(),
      warm_ttl_secs: default_warm_ttl_secs(),
    }
  }
}

/// Flash-sale key prefix and retry policy for conflicting purchases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventorySection {
  #[serde(default)]
  pub prefix: String,
  /// Total purchase attempts, including the first one
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_initial_backoff_ms")]
  pub initial_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
  5
}
fn default_initial_backoff_ms() -> u64 {
  10
}
fn default_max_backoff_ms() -> u64 {
  500
}

impl Default for InventorySection {
  fn default() -> Self {
    Self {
      prefix: String::new(),
      max_attempts: default_max_attempts(),
      initial_backoff_ms: default_initial_backoff_ms(),
      max_backoff_ms: default_max_backoff_ms(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl ServiceConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self> {
    let expanded = expand_env_vars(content);
    let config: Self = serde_yaml::from_str(&expanded)?;
    config.validate()?;
    Ok(config)
  }

  pub fn find_and_load() -> Result<Option<Self>> {
    for p in ["flashcache.yaml", "flashcache.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  pub fn validate(&self) -> Result<()> {
    if self.cache.read_ttl_secs == 0 || self.cache.warm_ttl_secs == 0 {
      return Err(Error::Config(
        "cache TTLs must be greater than zero".to_string(),
      ));
    }
    if self.inventory.max_attempts == 0 {
      return Err(Error::Config(
        "inventory.max_attempts must be at least 1".to_string(),
      ));
    }
    Ok(())
  }
}
