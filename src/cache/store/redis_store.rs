use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{StoreError, TaggedStore};
use crate::config::CacheConfig;

// Deletes every entry named in the tag's index set, then the set itself.
// Runs server-side so the read of the index and the deletes are one atomic step.
const INVALIDATE_SCRIPT: &str = r"
local keys = redis.call('SMEMBERS', KEYS[1])
local removed = 0
for _, key in ipairs(keys) do
  removed = removed + redis.call('DEL', key)
end
redis.call('DEL', KEYS[1])
return removed
";

/// Redis-backed [`TaggedStore`].
///
/// Physical layout, with `P` the configured prefix (empty when `use_prefix`
/// is off):
///
/// | Key            | Type   | Holds                                    |
/// |----------------|--------|------------------------------------------|
/// | `P<key>`       | string | the encoded entry, with `EX ttl`         |
/// | `Ptags:<tag>`  | set    | physical keys of entries under the tag   |
///
/// One [`ConnectionManager`] is established on first use and cloned for every
/// operation afterwards; it reconnects on its own after a dropped connection.
/// If establishing it fails, the operation reports
/// [`StoreError::Unavailable`] and the next operation tries again.
pub struct RedisStore {
    client: Client,
    address: String,
    conn: OnceCell<ConnectionManager>,
    prefix: String,
    connect_timeout: Duration,
    operation_timeout: Duration,
    invalidate_script: Script,
}

impl RedisStore {
    /// Prepares a store for the configured host. No connection is made yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Redis`] if the connection URL is malformed.
    pub fn new(config: &CacheConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.store.url())?;
        Ok(Self {
            client,
            address: format!("{}:{}", config.store.host, config.store.port),
            conn: OnceCell::new(),
            prefix: config.physical_prefix().to_owned(),
            connect_timeout: config.store.connect_timeout,
            operation_timeout: config.store.operation_timeout,
            invalidate_script: Script::new(INVALIDATE_SCRIPT),
        })
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tags:{}", self.prefix, tag)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                debug!(address = %self.address, "connecting to redis");
                match tokio::time::timeout(
                    self.connect_timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                {
                    Ok(Ok(conn)) => Ok(conn),
                    Ok(Err(e)) => {
                        warn!(address = %self.address, error = %e, "redis connection failed");
                        Err(StoreError::Unavailable(e.to_string()))
                    }
                    Err(_) => {
                        warn!(address = %self.address, "redis connection timed out");
                        Err(StoreError::Timeout {
                            operation: "connect",
                        })
                    }
                }
            })
            .await?;
        Ok(conn.clone())
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout { operation }),
        }
    }
}

#[async_trait]
impl TaggedStore for RedisStore {
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        tags: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        // SETEX rejects a zero expiry.
        let ttl_secs = ttl.as_secs().max(1);
        let entry_key = self.entry_key(key);

        let mut pipe = redis::pipe();
        pipe.atomic().set_ex(&entry_key, value, ttl_secs).ignore();
        for tag in tags {
            let tag_key = self.tag_key(tag);
            pipe.sadd(&tag_key, &entry_key)
                .ignore()
                .expire(&tag_key, ttl_secs as i64)
                .ignore();
        }

        let _: () = self.bounded("set", pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        let entry_key = self.entry_key(key);
        self.bounded("get", conn.get(&entry_key)).await
    }

    async fn invalidate(&self, tag: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection().await?;
        let invocation = self.invalidate_script.key(self.tag_key(tag));
        let removed: i64 = self
            .bounded("invalidate", invocation.invoke_async(&mut conn))
            .await?;
        Ok(usize::try_from(removed).unwrap_or(0))
    }
}
