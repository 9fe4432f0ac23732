//! The core fails closed when the store is slow or broken

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use oidclab_core::store::StoreResult;
use oidclab_core::{
    ClientType, CoreConfig, CoreError, ExpiringKeyStore, MemoryStore, NoopEventSink,
    OAuthErrorCode, RefreshRequest, SecurityCore, StoreError, SystemClock, TokenIssueRequest,
    VulnerabilityPolicy,
};

/// Store whose every call takes longer than the configured bound
#[derive(Debug)]
struct SlowStore {
    delay: Duration,
}

#[async_trait]
impl ExpiringKeyStore for SlowStore {
    async fn put(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> StoreResult<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn put_if_absent(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> StoreResult<bool> {
        tokio::time::sleep(self.delay).await;
        Ok(true)
    }

    async fn try_consume(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }

    async fn peek(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        Ok(0)
    }
}

/// Store that rejects every call
#[derive(Debug)]
struct BrokenStore;

#[async_trait]
impl ExpiringKeyStore for BrokenStore {
    async fn put(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> StoreResult<()> {
        Err(StoreError::Backend("connection refused".to_string()))
    }

    async fn put_if_absent(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> StoreResult<bool> {
        Err(StoreError::Backend("connection refused".to_string()))
    }

    async fn try_consume(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        Err(StoreError::Backend("connection refused".to_string()))
    }

    async fn peek(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        Err(StoreError::Backend("connection refused".to_string()))
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        Err(StoreError::Backend("connection refused".to_string()))
    }
}

/// In-memory store that can refuse access token writes
#[derive(Debug)]
struct AccessTokenOutage {
    inner: MemoryStore,
    down: AtomicBool,
}

#[async_trait]
impl ExpiringKeyStore for AccessTokenOutage {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        if key.starts_with("access-token:") && self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("down".to_string()));
        }
        self.inner.put(key, value, ttl).await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<bool> {
        self.inner.put_if_absent(key, value, ttl).await
    }

    async fn try_consume(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.try_consume(key).await
    }

    async fn peek(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.peek(key).await
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        self.inner.purge_expired().await
    }
}

fn core_with(store: Arc<dyn ExpiringKeyStore>) -> SecurityCore {
    let config = CoreConfig {
        store_timeout_ms: 20,
        ..CoreConfig::default()
    };
    SecurityCore::builder()
        .config(config)
        .store(store)
        .events(Arc::new(NoopEventSink))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_slow_store_times_out() {
    let core = core_with(Arc::new(SlowStore {
        delay: Duration::from_millis(500),
    }));

    let error = core.issue_state("session").await.unwrap_err();
    assert!(matches!(error, CoreError::Store(StoreError::Timeout(20))));
    assert_eq!(error.oauth_error().error, OAuthErrorCode::ServerError);

    let error = core
        .validate_state("session", "value", &VulnerabilityPolicy::strict())
        .await
        .unwrap_err();
    assert!(matches!(error, CoreError::Store(_)));
}

/// Even `skip_state_validation` does not turn a store outage into success
#[tokio::test]
async fn test_broken_store_fails_closed() {
    let core = core_with(Arc::new(BrokenStore));
    let policy = VulnerabilityPolicy {
        skip_state_validation: true,
        ..VulnerabilityPolicy::strict()
    };

    let error = core
        .validate_state("session", "value", &policy)
        .await
        .unwrap_err();
    assert!(matches!(error, CoreError::Store(StoreError::Backend(_))));
    assert!(core.purge_expired().await.is_err());
}

/// A refresh that fails mid-rotation leaves the presented token current
#[tokio::test]
async fn test_failed_rotation_keeps_family_intact() {
    let store = Arc::new(AccessTokenOutage {
        inner: MemoryStore::new(Arc::new(SystemClock)),
        down: AtomicBool::new(false),
    });
    let core = core_with(store.clone());
    let strict = VulnerabilityPolicy::strict();
    let issued = core
        .issue_tokens(
            &TokenIssueRequest::builder()
                .subject_id("alice")
                .client_id("client-1")
                .client_type(ClientType::Public)
                .scope("read")
                .build(),
        )
        .await
        .unwrap();
    let family_id = issued.family_id.clone().unwrap();
    let request = RefreshRequest::builder()
        .refresh_token(issued.refresh_token.clone().unwrap())
        .client_id("client-1")
        .build();

    // GIVEN: the store drops access token writes during one refresh
    store.down.store(true, Ordering::SeqCst);
    let error = core.refresh_tokens(&request, &strict).await.unwrap_err();
    assert!(matches!(error, CoreError::Store(StoreError::Backend(_))));
    store.down.store(false, Ordering::SeqCst);

    // WHEN: the client retries with the only token it holds
    let rotated = core.refresh_tokens(&request, &strict).await.unwrap();

    // THEN: the retry is a normal rotation, not a replay
    assert!(rotated.refresh_token.is_some());
    let family = core.refresh_family(&family_id).await.unwrap().unwrap();
    assert!(!family.revoked);
    assert_eq!(family.generation_counter, 1);
}
