use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("batch operation {index} on key '{key}' failed: {message}")]
    Operation {
        index: usize,
        key: String,
        message: String,
    },
    #[error("stored value could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOp {
    pub key: String,
    pub value: String,
    /// `None` stores the key without expiry
    pub ttl: Option<Duration>,
}

impl SetOp {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value by key, `None` when the key is missing or expired
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a single key, replacing any previous value and expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Fetch many keys at once; the result is aligned with `keys`
    async fn multi_get(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Execute a batch of writes in one round trip.
    ///
    /// The outer error reports a transport failure for the whole batch; the
    /// inner results report each operation. Batches are not atomic: earlier
    /// operations stay applied when a later one fails.
    async fn batch_exec(&self, ops: Vec<SetOp>) -> StoreResult<Vec<StoreResult<()>>>;
}
