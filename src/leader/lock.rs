use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::LeaderConfig;
use crate::error::{QueueError, Result};

/// The single row that names the current refresher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderToken {
    pub key: String,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaderToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Cluster-wide lock storage with TTL semantics. An expired token is
/// indistinguishable from an absent one.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Write a token for `holder_id` unless a valid token already exists.
    async fn set_if_absent(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Extend the token only if `holder_id` still holds it and it has not expired.
    async fn renew_if_held(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete the token only if `holder_id` holds it.
    async fn delete_if_held(&self, key: &str, holder_id: &str) -> Result<bool>;

    async fn current(&self, key: &str, now: DateTime<Utc>) -> Result<Option<LeaderToken>>;
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| QueueError::InvalidConfig(format!("lock ttl out of range: {e}")))?;
    Ok(now + ttl)
}

/// Lock store shared by every simulated instance in one process.
///
/// Supports injected outages and latency so callers can exercise the
/// fail-safe paths.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    tokens: Mutex<HashMap<String, LeaderToken>>,
    unavailable: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn check(&self) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Storage("lock store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check().await?;
        let mut tokens = self.tokens.lock().await;
        if tokens.get(key).is_some_and(|t| t.is_valid(now)) {
            return Ok(false);
        }
        tokens.insert(
            key.to_string(),
            LeaderToken {
                key: key.to_string(),
                holder_id: holder_id.to_string(),
                expires_at: expiry(now, ttl)?,
            },
        );
        Ok(true)
    }

    async fn renew_if_held(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check().await?;
        let mut tokens = self.tokens.lock().await;
        match tokens.get_mut(key) {
            Some(token) if token.holder_id == holder_id && token.is_valid(now) => {
                token.expires_at = expiry(now, ttl)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_held(&self, key: &str, holder_id: &str) -> Result<bool> {
        self.check().await?;
        let mut tokens = self.tokens.lock().await;
        if tokens.get(key).is_some_and(|t| t.holder_id == holder_id) {
            tokens.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn current(&self, key: &str, now: DateTime<Utc>) -> Result<Option<LeaderToken>> {
        self.check().await?;
        let tokens = self.tokens.lock().await;
        Ok(tokens.get(key).filter(|t| t.is_valid(now)).cloned())
    }
}

/// One process's handle on the leader lock.
///
/// Every operation is bounded by the configured timeout and reports failure
/// as `false`: a process that cannot reach the lock store never believes it
/// is the leader.
#[derive(Clone)]
pub struct LeaderLock {
    store: Arc<dyn LockStore>,
    config: LeaderConfig,
}

impl LeaderLock {
    pub fn new(store: Arc<dyn LockStore>, config: LeaderConfig) -> Self {
        Self { store, config }
    }

    pub fn holder_id(&self) -> &str {
        &self.config.holder_id
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }

    pub fn config(&self) -> &LeaderConfig {
        &self.config
    }

    pub async fn try_acquire(&self) -> bool {
        let call = self.store.set_if_absent(
            &self.config.key,
            &self.config.holder_id,
            self.config.ttl,
            Utc::now(),
        );
        self.settle("acquire", call).await
    }

    pub async fn renew(&self) -> bool {
        let call = self.store.renew_if_held(
            &self.config.key,
            &self.config.holder_id,
            self.config.ttl,
            Utc::now(),
        );
        self.settle("renew", call).await
    }

    pub async fn release(&self) -> bool {
        let call = self
            .store
            .delete_if_held(&self.config.key, &self.config.holder_id);
        self.settle("release", call).await
    }

    /// Current holder as seen by the lock store, if any.
    pub async fn holder(&self) -> Result<Option<LeaderToken>> {
        match tokio::time::timeout(
            self.config.op_timeout,
            self.store.current(&self.config.key, Utc::now()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout("leader lock lookup")),
        }
    }

    async fn settle<F>(&self, op: &'static str, call: F) -> bool
    where
        F: std::future::Future<Output = Result<bool>>,
    {
        match tokio::time::timeout(self.config.op_timeout, call).await {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                tracing::warn!(
                    key = %self.config.key,
                    holder_id = %self.config.holder_id,
                    op,
                    error = %e,
                    "Leader lock unavailable"
                );
                false
            }
            Err(_) => {
                tracing::warn!(
                    key = %self.config.key,
                    holder_id = %self.config.holder_id,
                    op,
                    timeout_ms = self.config.op_timeout.as_millis() as u64,
                    "Leader lock call timed out"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(holder: &str) -> LeaderConfig {
        LeaderConfig {
            key: "test-lock".to_string(),
            holder_id: holder.to_string(),
            ttl: Duration::from_secs(60),
            renew_interval: Duration::from_secs(30),
            op_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn second_acquirer_fails_while_token_valid() {
        let store = Arc::new(MemoryLockStore::new());
        let a = LeaderLock::new(store.clone(), config("a"));
        let b = LeaderLock::new(store.clone(), config("b"));

        assert!(a.try_acquire().await);
        assert!(!b.try_acquire().await);
        assert!(a.renew().await);
        assert!(!b.renew().await);
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let store = Arc::new(MemoryLockStore::new());
        let a = LeaderLock::new(store.clone(), config("a"));
        let b = LeaderLock::new(store.clone(), config("b"));

        assert!(a.try_acquire().await);
        assert!(!b.release().await);
        assert!(a.release().await);
        assert!(b.try_acquire().await);
        assert_eq!(a.holder().await.unwrap().unwrap().holder_id, "b");
    }

    #[tokio::test]
    async fn expired_token_counts_as_absent() {
        let store = MemoryLockStore::new();
        let now = Utc::now();
        assert!(store
            .set_if_absent("k", "a", Duration::from_secs(1), now)
            .await
            .unwrap());

        let later = now + chrono::Duration::seconds(2);
        assert!(store.current("k", later).await.unwrap().is_none());
        assert!(!store
            .renew_if_held("k", "a", Duration::from_secs(1), later)
            .await
            .unwrap());
        assert!(store
            .set_if_absent("k", "b", Duration::from_secs(1), later)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_is_never_acquired() {
        let store = Arc::new(MemoryLockStore::new());
        store.set_available(false);
        let lock = LeaderLock::new(store.clone(), config("a"));
        assert!(!lock.try_acquire().await);

        store.set_available(true);
        assert!(lock.try_acquire().await);
    }

    #[tokio::test]
    async fn slow_store_counts_as_not_acquired() {
        let store = Arc::new(MemoryLockStore::new());
        store.set_delay(Duration::from_millis(300));
        let lock = LeaderLock::new(store.clone(), config("a"));
        assert!(!lock.try_acquire().await);
    }
}
