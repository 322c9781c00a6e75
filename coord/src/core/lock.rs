use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use common::error::CoreError;

const ACQUIRE_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    Decremented(u64),
    AlreadyZero,
}

/// TTL locks and atomic counters shared by every coordinator component.
/// A lock is identified by its key and owned by whoever holds the token
/// returned from `acquire`.
#[async_trait]
pub trait LockService: Send + Sync {
    /// `LockBusy` when another live token holds `key`.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<String, CoreError>;
    /// Stale or foreign tokens are ignored.
    async fn release(&self, key: &str, token: &str) -> Result<(), CoreError>;
    /// `LockExpired` when `token` no longer holds `key`.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<(), CoreError>;

    async fn set_counter(&self, key: &str, value: u64, ttl: Option<Duration>)
    -> Result<(), CoreError>;
    /// Sets the counter only when absent; returns the value now stored.
    async fn init_counter(&self, key: &str, value: u64, ttl: Option<Duration>)
    -> Result<u64, CoreError>;
    async fn get_counter(&self, key: &str) -> Result<Option<u64>, CoreError>;
    /// Missing counters count as zero.
    async fn decrement_if_positive(&self, key: &str) -> Result<CounterOutcome, CoreError>;
    async fn increment(&self, key: &str) -> Result<u64, CoreError>;
    async fn delete_counter(&self, key: &str) -> Result<(), CoreError>;
}

struct Held {
    token: String,
    expires_at: Instant,
}

struct Counter {
    value: u64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Single-process implementation. Every operation is one critical section,
/// so decrement-if-positive can never over-spend.
#[derive(Default)]
pub struct LocalLockService {
    locks: Mutex<HashMap<String, Held>>,
    counters: Mutex<HashMap<String, Counter>>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Held>>, CoreError> {
        self.locks
            .lock()
            .map_err(|e| CoreError::Any(anyhow::anyhow!("lock table poisoned: {}", e)))
    }

    fn counters(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Counter>>, CoreError> {
        self.counters
            .lock()
            .map_err(|e| CoreError::Any(anyhow::anyhow!("counter table poisoned: {}", e)))
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<String, CoreError> {
        let now = Instant::now();
        let mut locks = self.locks()?;
        if let Some(held) = locks.get(key)
            && held.expires_at > now
        {
            return Err(CoreError::LockBusy(key.to_string()));
        }
        let token = Uuid::new_v4().to_string();
        locks.insert(
            key.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(token)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), CoreError> {
        let mut locks = self.locks()?;
        if locks.get(key).is_some_and(|held| held.token == token) {
            locks.remove(key);
        }
        Ok(())
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<(), CoreError> {
        let now = Instant::now();
        let mut locks = self.locks()?;
        match locks.get_mut(key) {
            Some(held) if held.token == token && held.expires_at > now => {
                held.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(CoreError::LockExpired(key.to_string())),
        }
    }

    async fn set_counter(
        &self,
        key: &str,
        value: u64,
        ttl: Option<Duration>,
    ) -> Result<(), CoreError> {
        let now = Instant::now();
        self.counters()?.insert(
            key.to_string(),
            Counter {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    async fn init_counter(
        &self,
        key: &str,
        value: u64,
        ttl: Option<Duration>,
    ) -> Result<u64, CoreError> {
        let now = Instant::now();
        let mut counters = self.counters()?;
        if let Some(c) = counters.get(key)
            && c.live(now)
        {
            return Ok(c.value);
        }
        counters.insert(
            key.to_string(),
            Counter {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(value)
    }

    async fn get_counter(&self, key: &str) -> Result<Option<u64>, CoreError> {
        let now = Instant::now();
        Ok(self
            .counters()?
            .get(key)
            .filter(|c| c.live(now))
            .map(|c| c.value))
    }

    async fn decrement_if_positive(&self, key: &str) -> Result<CounterOutcome, CoreError> {
        let now = Instant::now();
        let mut counters = self.counters()?;
        match counters.get_mut(key) {
            Some(c) if c.live(now) && c.value > 0 => {
                c.value -= 1;
                Ok(CounterOutcome::Decremented(c.value))
            }
            _ => Ok(CounterOutcome::AlreadyZero),
        }
    }

    async fn increment(&self, key: &str) -> Result<u64, CoreError> {
        let now = Instant::now();
        let mut counters = self.counters()?;
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });
        if !counter.live(now) {
            counter.value = 0;
            counter.expires_at = None;
        }
        counter.value = counter.value.saturating_add(1);
        Ok(counter.value)
    }

    async fn delete_counter(&self, key: &str) -> Result<(), CoreError> {
        self.counters()?.remove(key);
        Ok(())
    }
}

/// Held lock; released explicitly or, failing that, on drop.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    key: String,
    token: String,
    armed: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn extend(&self, ttl: Duration) -> Result<(), CoreError> {
        self.service.extend(&self.key, &self.token, ttl).await
    }

    pub async fn release(mut self) -> Result<(), CoreError> {
        self.armed = false;
        self.service.release(&self.key, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "lock dropped outside a runtime, left to expire");
            return;
        };
        let service = self.service.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = service.release(&key, &token).await {
                warn!(%key, error = %e, "failed to release lock");
            }
        });
    }
}

/// Polls `acquire` until it succeeds or `wait` elapses.
pub async fn acquire_with_wait(
    service: &Arc<dyn LockService>,
    key: &str,
    ttl: Duration,
    wait: Duration,
) -> Result<LockGuard, CoreError> {
    let deadline = Instant::now() + wait;
    loop {
        match service.acquire(key, ttl).await {
            Ok(token) => {
                debug!(key, "lock acquired");
                return Ok(LockGuard {
                    service: service.clone(),
                    key: key.to_string(),
                    token,
                    armed: true,
                });
            }
            Err(CoreError::LockBusy(_)) if Instant::now() + ACQUIRE_POLL <= deadline => {
                sleep(ACQUIRE_POLL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn file_lock_key(file_id: &str) -> String {
    format!("file:{}", file_id)
}

pub fn download_lock_key(file_id: &str) -> String {
    format!("download:{}", file_id)
}

pub fn delete_lock_key(file_id: &str) -> String {
    format!("delete:{}", file_id)
}

pub fn upload_lock_key(checksum: &str) -> String {
    format!("upload:{}", checksum)
}

pub fn download_counter_key(file_id: &str) -> String {
    format!("downloads:{}", file_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lock_expires_after_ttl() {
        let svc = LocalLockService::new();
        let token = svc.acquire("k", Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            svc.acquire("k", Duration::from_secs(5)).await,
            Err(CoreError::LockBusy(_))
        ));

        tokio::time::advance(Duration::from_secs(6)).await;
        let second = svc.acquire("k", Duration::from_secs(5)).await.unwrap();
        assert_ne!(token, second);

        // the first holder lost the lock; its release must not free it
        svc.release("k", &token).await.unwrap();
        assert!(svc.acquire("k", Duration::from_secs(5)).await.is_err());
        assert!(matches!(
            svc.extend("k", &token, Duration::from_secs(5)).await,
            Err(CoreError::LockExpired(_))
        ));

        svc.extend("k", &second, Duration::from_secs(30)).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(svc.acquire("k", Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn counter_semantics() {
        let svc = LocalLockService::new();
        assert_eq!(svc.init_counter("c", 2, None).await.unwrap(), 2);
        assert_eq!(svc.init_counter("c", 9, None).await.unwrap(), 2);

        assert_eq!(
            svc.decrement_if_positive("c").await.unwrap(),
            CounterOutcome::Decremented(1)
        );
        assert_eq!(
            svc.decrement_if_positive("c").await.unwrap(),
            CounterOutcome::Decremented(0)
        );
        assert_eq!(
            svc.decrement_if_positive("c").await.unwrap(),
            CounterOutcome::AlreadyZero
        );
        assert_eq!(svc.increment("c").await.unwrap(), 1);
        assert_eq!(
            svc.decrement_if_positive("missing").await.unwrap(),
            CounterOutcome::AlreadyZero
        );

        svc.set_counter("t", 5, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(svc.get_counter("t").await.unwrap(), None);
        assert_eq!(
            svc.decrement_if_positive("t").await.unwrap(),
            CounterOutcome::AlreadyZero
        );

        svc.delete_counter("c").await.unwrap();
        assert_eq!(svc.get_counter("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let svc: Arc<dyn LockService> = Arc::new(LocalLockService::new());
        {
            let _guard = acquire_with_wait(&svc, "k", Duration::from_secs(30), Duration::ZERO)
                .await
                .unwrap();
        }
        let guard = acquire_with_wait(&svc, "k", Duration::from_secs(30), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            acquire_with_wait(&svc, "k", Duration::from_secs(30), Duration::ZERO).await,
            Err(CoreError::LockBusy(_))
        ));
        guard.release().await.unwrap();
        assert!(svc.acquire("k", Duration::from_secs(1)).await.is_ok());
    }
}
