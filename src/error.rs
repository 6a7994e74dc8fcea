//! Error types shared by the store, cache and inventory layers

use std::fmt;

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which half of a write-through reached its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSide {
  Cache,
  Source,
}

impl fmt::Display for WriteSide {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WriteSide::Cache => write!(f, "cache"),
      WriteSide::Source => write!(f, "source"),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Connection refused, pool exhausted, store closed or I/O failure
  #[error("backing store unavailable: {0}")]
  Unavailable(String),

  /// An optimistic commit lost the race against another writer
  #[error("transaction aborted: watched key changed before commit")]
  ConflictAborted,

  /// Write-through reached only one side; the caller reconciles
  #[error("partial write: only the {written} side was written ({reason})")]
  PartialWrite { written: WriteSide, reason: String },

  /// The backing source behind the cache failed
  #[error("backing source error: {0}")]
  Source(String),

  #[error("invalid stored value: {0}")]
  InvalidValue(String),

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("configuration error: {0}")]
  Config(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Yaml(#[from] serde_yaml::Error),
}

impl Error {
  pub fn unavailable(msg: impl Into<String>) -> Self {
    Error::Unavailable(msg.into())
  }

  pub fn backing(msg: impl Into<String>) -> Self {
    Error::Source(msg.into())
  }

  pub fn invalid_value(msg: impl Into<String>) -> Self {
    Error::InvalidValue(msg.into())
  }

  pub fn invalid_argument(msg: impl Into<String>) -> Self {
    Error::InvalidArgument(msg.into())
  }

  /// Whether repeating the same operation later may succeed
  pub fn is_retryable(&self) -> bool {
    matches!(self, Error::ConflictAborted | Error::Unavailable(_))
  }

  /// The side that did get written, for partial write-through failures
  pub fn written_side(&self) -> Option<WriteSide> {
    match self {
      Error::PartialWrite { written, .. } => Some(*written),
      _ => None,
    }
  }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
  fn from(e: redis::RedisError) -> Self {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
      Error::Unavailable(e.to_string())
    } else {
      match e.kind() {
        redis::ErrorKind::TypeError | redis::ErrorKind::ResponseError => {
          Error::InvalidValue(e.to_string())
        }
        _ => Error::Unavailable(e.to_string()),
      }
    }
  }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::PoolError> for Error {
  fn from(e: deadpool_redis::PoolError) -> Self {
    Error::Unavailable(e.to_string())
  }
}
