//! Redis-backed [`ExpiringKeyStore`]
//!
//! Enabled with the `redis-store` feature. Atomicity comes from single Redis
//! commands: `SET .. NX PX` for insert-if-absent and `GETDEL` for consume.
//! Expiry is native (`PX`), so `purge_expired` has nothing to do.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::store::{ExpiringKeyStore, StoreResult};

/// Redis store configuration and client
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Client,
    key_prefix: String,
    max_retries: u32,
}

impl RedisStore {
    /// Connect and verify the server responds to `PING`
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] if the client cannot connect
    pub async fn new(connection_string: &str) -> StoreResult<Self> {
        Self::with_prefix(connection_string, "oidclab:").await
    }

    /// Connect with a custom key prefix
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] if the client cannot connect
    pub async fn with_prefix(connection_string: &str, key_prefix: &str) -> StoreResult<Self> {
        let client = Client::open(connection_string)
            .map_err(|e| StoreError::Backend(format!("Failed to create Redis client: {e}")))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to connect to Redis: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis ping failed: {e}")))?;

        debug!("Redis connection established successfully");

        Ok(Self {
            client,
            key_prefix: key_prefix.to_string(),
            max_retries: 3,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }

    async fn connection(&self) -> RedisResult<MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    /// Whether a failed attempt may be repeated: commands that reached the
    /// server are repeated only if idempotent
    fn should_retry(&self, replay: Replay, sent: bool, attempts: u32) -> bool {
        attempts < self.max_retries && (!sent || replay == Replay::Safe)
    }

    /// Run a command with bounded retries on transport failure
    async fn with_retries<T, F>(&self, replay: Replay, command: F) -> StoreResult<T>
    where
        T: redis::FromRedisValue + Send,
        F: Fn() -> redis::Cmd + Send + Sync,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let (result, sent) = match self.connection().await {
                Ok(mut conn) => (command().query_async::<T>(&mut conn).await, true),
                Err(e) => (Err(e), false),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !self.should_retry(replay, sent, attempts) => {
                    error!("Redis operation failed after {} attempts: {}", attempts, e);
                    return Err(StoreError::Backend(format!("Redis operation failed: {e}")));
                }
                Err(e) => {
                    warn!("Redis operation failed (attempt {}): {}", attempts, e);
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempts))).await;
                }
            }
        }
    }
}

/// Whether repeating a command after a lost reply changes its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// `GET`, plain `SET`
    Safe,
    /// `SET NX`, `GETDEL`
    Unsafe,
}

#[async_trait]
impl ExpiringKeyStore for RedisStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        let key = self.key(key);
        let millis = Self::ttl_millis(ttl);
        self.with_retries::<(), _>(Replay::Safe, || {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(&value).arg("PX").arg(millis);
            cmd
        })
        .await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<bool> {
        let key = self.key(key);
        let millis = Self::ttl_millis(ttl);
        let reply: Option<String> = self
            .with_retries(Replay::Unsafe, || {
                let mut cmd = redis::cmd("SET");
                cmd.arg(&key).arg(&value).arg("NX").arg("PX").arg(millis);
                cmd
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn try_consume(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = self.key(key);
        self.with_retries(Replay::Unsafe, || {
            let mut cmd = redis::cmd("GETDEL");
            cmd.arg(&key);
            cmd
        })
        .await
    }

    async fn peek(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = self.key(key);
        self.with_retries(Replay::Safe, || {
            let mut cmd = redis::cmd("GET");
            cmd.arg(&key);
            cmd
        })
        .await
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        Ok(0)
    }
}
