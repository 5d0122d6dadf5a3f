use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

use crate::storage::{KvStore, SetOp, StoreError, StoreResult};

/// Redis-backed key-value store using a multiplexed connection.
///
/// Batches are sent as a single non-transactional pipeline of `SET` commands.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn new(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

/// Redis expiries have second granularity; never round a TTL down to zero.
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, expiry_secs(ttl))
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn multi_get(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn batch_exec(&self, ops: Vec<SetOp>) -> StoreResult<Vec<StoreResult<()>>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for op in &ops {
            pipe.cmd("SET").arg(&op.key).arg(&op.value);
            if let Some(ttl) = op.ttl {
                pipe.arg("EX").arg(expiry_secs(ttl));
            }
        }

        let mut conn = self.conn.clone();
        let replies: Vec<redis::Value> = pipe.query_async(&mut conn).await?;

        Ok(ops
            .iter()
            .zip(replies.iter())
            .enumerate()
            .map(|(index, (op, reply))| match reply {
                redis::Value::Okay => Ok(()),
                other => Err(StoreError::Operation {
                    index,
                    key: op.key.clone(),
                    message: format!("unexpected reply {other:?}"),
                }),
            })
            .collect())
    }
}
