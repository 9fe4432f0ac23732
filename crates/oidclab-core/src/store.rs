//! Expiring key store
//!
//! The store is the only shared mutable state in the core. Its contract:
//!
//! - `try_consume` deletes and returns in one atomic step; for any key at most
//!   one concurrent caller observes the value
//! - expired entries read as absent whether or not they have been purged
//! - `put_if_absent` is atomic, which makes the store usable as a replay cache
//!
//! [`RecordStore`] layers typed JSON records, namespaced keys and a bounded
//! timeout over any [`ExpiringKeyStore`]. A timeout is a store failure and the
//! calling operation fails closed.

use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::error::StoreError;

/// Store result type
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key/value store with per-entry expiry and atomic consume
#[async_trait]
pub trait ExpiringKeyStore: Send + Sync + Debug {
    /// Insert or overwrite `key`
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()>;

    /// Insert `key` only if no live entry exists; returns whether it was inserted
    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<bool>;

    /// Atomically remove and return a live entry
    async fn try_consume(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Read a live entry without removing it
    async fn peek(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Physically drop expired entries; returns how many were removed
    async fn purge_expired(&self) -> StoreResult<usize>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

/// In-memory store on a sharded concurrent map
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: SharedClock,
}

impl MemoryStore {
    /// Create an empty store reading time from `clock`
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of physical entries, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Spawn a task that purges expired entries every `interval`
    ///
    /// The task holds only a weak reference and exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let removed = store.purge_now();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired store entries");
                }
            }
        })
    }

    fn purge_now(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl ExpiringKeyStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        let expires_at = self.expiry(ttl);
        self.entries
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    Ok(false)
                } else {
                    occupied.insert(StoredValue { value, expires_at });
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue { value, expires_at });
                Ok(true)
            }
        }
    }

    async fn try_consume(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = self.clock.now();
        if let Some((_, entry)) = self.entries.remove_if(key, |_, entry| entry.expires_at > now) {
            return Ok(Some(entry.value));
        }
        // Lazy cleanup of an expired entry under the same key
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn peek(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        Ok(self.purge_now())
    }
}

/// Key namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Authorization codes
    Code,
    /// CSRF state records
    State,
    /// DPoP proof `jti` replay cache
    DpopJti,
    /// Refresh token families
    RefreshFamily,
    /// Refresh token hash to family index
    RefreshToken,
    /// Live access token registry
    AccessToken,
}

impl Namespace {
    /// Key prefix
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Code => "code:",
            Self::State => "state:",
            Self::DpopJti => "dpop-jti:",
            Self::RefreshFamily => "refresh-family:",
            Self::RefreshToken => "refresh-token:",
            Self::AccessToken => "access-token:",
        }
    }

    /// Full store key for `id`
    pub fn key(self, id: &str) -> String {
        format!("{}{id}", self.prefix())
    }
}

/// Result of a typed lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// Present and within its lifetime
    Live(T),
    /// Present but past its lifetime (kept only for the grace period)
    Expired,
    /// Never stored, already consumed, or purged
    Missing,
}

impl<T> Lookup<T> {
    /// The live record, if any
    pub fn live(self) -> Option<T> {
        match self {
            Self::Live(value) => Some(value),
            Self::Expired | Self::Missing => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    expires_at: i64,
    record: T,
}

/// Typed, namespaced, time-bounded access to an [`ExpiringKeyStore`]
#[derive(Debug, Clone)]
pub struct RecordStore {
    backend: Arc<dyn ExpiringKeyStore>,
    clock: SharedClock,
    timeout: Duration,
    grace: chrono::Duration,
}

impl RecordStore {
    /// Wrap `backend`; every call is bounded by `timeout`, and records stay
    /// physically present for `grace` after expiry so that late lookups can be
    /// told apart from misses
    pub fn new(
        backend: Arc<dyn ExpiringKeyStore>,
        clock: SharedClock,
        timeout: Duration,
        grace: chrono::Duration,
    ) -> Self {
        Self {
            backend,
            clock,
            timeout,
            grace,
        }
    }

    /// Underlying backend
    pub fn backend(&self) -> &Arc<dyn ExpiringKeyStore> {
        &self.backend
    }

    /// Clock used for record lifetimes
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let millis = self.timeout.as_millis() as u64;
                tracing::warn!(timeout_ms = millis, "Store operation timed out");
                Err(StoreError::Timeout(millis))
            }
        }
    }

    fn encode<T: Serialize>(expires_at: i64, record: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(&Envelope { expires_at, record })
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: Option<Vec<u8>>) -> StoreResult<Lookup<T>> {
        let Some(bytes) = bytes else {
            return Ok(Lookup::Missing);
        };
        let envelope: Envelope<T> = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if self.clock.unix_now() >= envelope.expires_at {
            Ok(Lookup::Expired)
        } else {
            Ok(Lookup::Live(envelope.record))
        }
    }

    fn physical_ttl(&self, expires_at: i64, grace: bool) -> Duration {
        let remaining = (expires_at - self.clock.unix_now()).max(0);
        let extra = if grace { self.grace.num_seconds().max(0) } else { 0 };
        Duration::from_secs((remaining + extra) as u64)
    }

    /// Store `record` until `expires_at` (Unix seconds), overwriting
    pub async fn put_until<T: Serialize + Sync>(
        &self,
        namespace: Namespace,
        id: &str,
        record: &T,
        expires_at: i64,
    ) -> StoreResult<()> {
        let bytes = Self::encode(expires_at, record)?;
        let ttl = self.physical_ttl(expires_at, true);
        self.bounded(self.backend.put(&namespace.key(id), bytes, ttl))
            .await
    }

    /// Store `record` for `ttl`, overwriting
    pub async fn put<T: Serialize + Sync>(
        &self,
        namespace: Namespace,
        id: &str,
        record: &T,
        ttl: chrono::Duration,
    ) -> StoreResult<()> {
        let expires_at = self.clock.unix_now() + ttl.num_seconds();
        self.put_until(namespace, id, record, expires_at).await
    }

    /// Store `record` for `ttl` unless a live record exists
    pub async fn put_if_absent<T: Serialize + Sync>(
        &self,
        namespace: Namespace,
        id: &str,
        record: &T,
        ttl: chrono::Duration,
    ) -> StoreResult<bool> {
        let expires_at = self.clock.unix_now() + ttl.num_seconds();
        let bytes = Self::encode(expires_at, record)?;
        let ttl = self.physical_ttl(expires_at, false);
        self.bounded(self.backend.put_if_absent(&namespace.key(id), bytes, ttl))
            .await
    }

    /// Atomically remove and return a record
    pub async fn consume<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        id: &str,
    ) -> StoreResult<Lookup<T>> {
        let bytes = self
            .bounded(self.backend.try_consume(&namespace.key(id)))
            .await?;
        self.decode(bytes)
    }

    /// Read a record without removing it
    pub async fn peek<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        id: &str,
    ) -> StoreResult<Lookup<T>> {
        let bytes = self.bounded(self.backend.peek(&namespace.key(id))).await?;
        self.decode(bytes)
    }

    /// Remove a record, reporting whether a live one was present
    pub async fn remove(&self, namespace: Namespace, id: &str) -> StoreResult<bool> {
        let bytes = self
            .bounded(self.backend.try_consume(&namespace.key(id)))
            .await?;
        Ok(bytes.is_some())
    }
}
