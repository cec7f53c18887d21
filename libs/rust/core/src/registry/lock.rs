//! Named locks guarding registry read-modify-write cycles.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::warn;

use super::RegistryError;
use crate::metrics_ext::CORE_METRICS;

/// A held lock. Implementations may assume `release` is called at most once.
#[async_trait]
pub trait HeldLock: Send + Sync {
    async fn release(&self) -> Result<(), RegistryError>;
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Waits until the lock called `name` is free and takes it.
    async fn acquire(&self, name: &str) -> Result<Box<dyn HeldLock>, RegistryError>;
}

/// Wraps a held lock so that only the first `release` reaches the backend.
pub struct ReleaseOnce {
    name: String,
    held: Mutex<Option<Box<dyn HeldLock>>>,
}

impl ReleaseOnce {
    pub fn new(name: impl Into<String>, held: Box<dyn HeldLock>) -> Self { Self { name: name.into(), held: Mutex::new(Some(held)) } }

    pub fn is_released(&self) -> bool { self.held.lock().is_none() }

    /// Returns `true` for the call that actually released the lock. Backend
    /// failures are logged: the lock is considered gone either way.
    pub async fn release(&self) -> bool {
        let Some(held) = self.held.lock().take() else { return false };
        if let Err(e) = held.release().await { warn!(lock = %self.name, error = %e, "lock_release_failed"); }
        true
    }
}

/// Lock handle that force-releases itself at a deadline, even if the holder
/// hangs or is dropped.
pub struct ExpiringLock {
    held: Arc<ReleaseOnce>,
    key: String,
    deadline: Duration,
    acquired_at: Instant,
    expiry: JoinHandle<()>,
}

impl ExpiringLock {
    pub async fn acquire(locks: &dyn LockManager, name: &str, key: &str, deadline: Duration) -> Result<Self, RegistryError> {
        let held = Arc::new(ReleaseOnce::new(name, locks.acquire(name).await?));
        let timer = held.clone();
        let lock_name = name.to_string();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if timer.release().await {
                CORE_METRICS.registry.lock_timeouts_total.add(1, &[]);
                warn!(lock = %lock_name, deadline_ms = deadline.as_millis() as u64, "lock_force_released");
            }
        });
        Ok(Self { held, key: key.to_string(), deadline, acquired_at: Instant::now(), expiry })
    }

    /// Runs `op` while holding the lock. Whichever settles first, the
    /// operation or the deadline, owns the outcome; the loser is discarded.
    pub async fn run<T, F>(self, op: F) -> Result<T, RegistryError>
    where F: Future<Output = Result<T, RegistryError>> {
        let remaining = self.deadline.saturating_sub(self.acquired_at.elapsed());
        let outcome = tokio::time::timeout(remaining, op).await;
        let released_here = self.held.release().await;
        self.expiry.abort();
        match outcome {
            Ok(result) if released_here => result,
            _ => Err(RegistryError::LockTimeout { key: self.key.clone(), after: self.deadline }),
        }
    }
}

type LockTable = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// In-process named locks; one async mutex per name, dropped again once
/// nobody holds or waits on it.
#[derive(Default)]
pub struct LocalLockManager {
    locks: LockTable,
}

impl LocalLockManager {
    pub fn new() -> Self { Self::default() }

    /// True when `name` is currently held by someone.
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks.lock().get(name).map(|m| m.try_lock().is_err()).unwrap_or(false)
    }

    /// Names currently held or waited on.
    pub fn tracked(&self) -> usize { self.locks.lock().len() }
}

struct LocalLock {
    name: String,
    table: LockTable,
    guard: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl LocalLock {
    fn free(&self) {
        let Some(guard) = self.guard.lock().take() else { return };
        drop(guard);
        // acquirers clone the entry under the table lock, so a count of one
        // means the table holds the only reference
        let mut table = self.table.lock();
        if table.get(&self.name).is_some_and(|m| Arc::strong_count(m) == 1) { table.remove(&self.name); }
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) { self.free(); }
}

#[async_trait]
impl HeldLock for LocalLock {
    async fn release(&self) -> Result<(), RegistryError> {
        self.free();
        Ok(())
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire(&self, name: &str) -> Result<Box<dyn HeldLock>, RegistryError> {
        let mutex = self.locks.lock().entry(name.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        Ok(Box::new(LocalLock { name: name.to_string(), table: self.locks.clone(), guard: Mutex::new(Some(guard)) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_once_is_idempotent() {
        let locks = LocalLockManager::new();
        let held = ReleaseOnce::new("a", locks.acquire("a").await.unwrap());
        assert!(locks.is_locked("a"));
        assert!(held.release().await);
        assert!(!held.release().await);
        assert!(held.is_released());
        assert!(!locks.is_locked("a"));
    }

    #[tokio::test]
    async fn idle_lock_names_are_forgotten() {
        let locks = Arc::new(LocalLockManager::new());
        for name in ["a", "b", "c"] {
            locks.acquire(name).await.unwrap().release().await.unwrap();
        }
        assert_eq!(locks.tracked(), 0);

        let first = locks.acquire("k").await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("k").await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.release().await.unwrap();
        // the waiter still references the entry
        assert_eq!(locks.tracked(), 1);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(locks.is_locked("k"));
        drop(second);
        assert_eq!(locks.tracked(), 0);
        assert!(!locks.is_locked("k"));
    }

    #[tokio::test]
    async fn dropped_expiring_lock_frees_itself() {
        let locks = LocalLockManager::new();
        let lock = ExpiringLock::acquire(&locks, "k", "k", Duration::from_millis(30)).await.unwrap();
        drop(lock);
        let again = tokio::time::timeout(Duration::from_secs(2), locks.acquire("k")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn slow_operation_loses_to_deadline() {
        let locks = LocalLockManager::new();
        let lock = ExpiringLock::acquire(&locks, "k", "orders", Duration::from_millis(20)).await.unwrap();
        let res: Result<(), _> = lock.run(async { tokio::time::sleep(Duration::from_millis(200)).await; Ok(()) }).await;
        assert!(matches!(res, Err(RegistryError::LockTimeout { ref key, .. }) if key == "orders"));
        assert!(!locks.is_locked("k"));
    }

    #[tokio::test]
    async fn fast_operation_keeps_its_result() {
        let locks = LocalLockManager::new();
        let lock = ExpiringLock::acquire(&locks, "k", "k", Duration::from_secs(5)).await.unwrap();
        assert_eq!(lock.run(async { Ok(7) }).await.unwrap(), 7);
        assert!(!locks.is_locked("k"));
    }
}
