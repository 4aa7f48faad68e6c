//! Redis-backed session store.
//!
//! Each operation opens a multiplexed connection and is bounded by
//! `op_timeout`. Only `get` is retried: a retried write after a partial
//! failure could leave the session id pointing at a token the client never
//! saw.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use redis::{AsyncCommands, Client, RedisResult};
use tracing::{debug, warn};

use super::store::SessionStore;
use crate::config::StoreConfig;
use crate::{Error, Result};

/// Session store backed by a Redis server.
#[derive(Debug, Clone)]
pub struct RedisSessionStore {
    client: Client,
    key_prefix: String,
    op_timeout: Duration,
    read_retries: usize,
}

impl RedisSessionStore {
    /// Create a store for the given URI. No connection is made until the first
    /// operation; call [`ping`](Self::ping) to check reachability up front.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URI cannot be parsed.
    pub fn new(
        uri: &str,
        key_prefix: impl Into<String>,
        op_timeout: Duration,
        read_retries: usize,
    ) -> Result<Self> {
        let client = Client::open(uri)
            .map_err(|e| Error::Config(format!("invalid redis_uri: {e}")))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            op_timeout,
            read_retries,
        })
    }

    /// Build from the `store` config section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `redis_uri` is missing or invalid.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let uri = config
            .redis_uri
            .as_deref()
            .ok_or_else(|| Error::Config("store.redis_uri is required".to_string()))?;
        Self::new(uri, config.key_prefix.clone(), config.op_timeout, config.read_retries)
    }

    /// Round-trip a `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if Redis cannot be reached in time.
    pub async fn ping(&self) -> Result<()> {
        self.bounded("ping", async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await?;
        debug!("Redis connection established");
        Ok(())
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}{session_id}", self.key_prefix)
    }

    async fn bounded<T>(&self, op: &'static str, fut: impl Future<Output = RedisResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::StoreUnavailable(format!("redis {op} failed: {e}"))),
            Err(_) => Err(Error::StoreUnavailable(format!(
                "redis {op} timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }

    async fn get_once(&self, key: &str) -> Result<Option<String>> {
        self.bounded("get", async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.get::<_, Option<String>>(key).await
        })
        .await
    }
}

/// Redis TTLs are whole seconds and zero is rejected.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait::async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<String>> {
        let key = self.key(session_id);
        let key = key.as_str();
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(25))
            .with_max_times(self.read_retries);

        (|| async move { self.get_once(key).await })
            .retry(backoff)
            .when(Error::is_infrastructure)
            .notify(|err, delay| {
                warn!(error = %err, delay_ms = delay.as_millis(), "Retrying session lookup");
            })
            .await
    }

    async fn set(&self, session_id: &str, token: &str, ttl: Duration) -> Result<()> {
        let key = self.key(session_id);
        self.bounded("set", async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.set_ex::<_, _, ()>(&key, token, ttl_secs(ttl)).await
        })
        .await
    }

    async fn expire(&self, session_id: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(session_id);
        let secs = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);
        self.bounded("expire", async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.expire::<_, bool>(&key, secs).await
        })
        .await
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let key = self.key(session_id);
        self.bounded("del", async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.del::<_, usize>(&key).await
        })
        .await
        .map(|removed| removed > 0)
    }
}
