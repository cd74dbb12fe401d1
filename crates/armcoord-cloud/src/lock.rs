//! Named mutual exclusion for shared remote resources
//!
//! Many independent operations read-modify-write the same parent resource
//! (a virtual network's subnet list, a NIC's IP configurations, ...). The
//! management API replaces the whole object on every PUT, so two concurrent
//! writers silently drop each other's changes. Every such operation takes the
//! [`LockKey`]s of the resources it rewrites from a shared [`LockRegistry`]
//! before reading, and holds them until its change has converged.

use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Coordination token naming one remote resource
///
/// Keys compare exactly (case-sensitive) on both fields, and order
/// lexicographically on `(resource_type, name)`. That order is the global
/// acquisition order used by [`LockRegistry::acquire_all`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    resource_type: String,
    name: String,
}

impl LockKey {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// Sort into the global order and drop duplicates
///
/// Acquiring the same key twice from one caller would deadlock, and acquiring
/// in caller-chosen order allows circular waits between operations.
pub fn normalize_keys(keys: impl IntoIterator<Item = LockKey>) -> Vec<LockKey> {
    let mut keys: Vec<LockKey> = keys.into_iter().collect();
    keys.sort();
    keys.dedup();
    keys
}

#[derive(Default)]
struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    waiters: AtomicUsize,
}

impl LockEntry {
    async fn lock(&self) -> OwnedMutexGuard<()> {
        if let Ok(guard) = Arc::clone(&self.mutex).try_lock_owned() {
            return guard;
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        // Decrements even when the waiting future is dropped by a timeout
        let _waiting = WaiterCount(&self.waiters);
        Arc::clone(&self.mutex).lock_owned().await
    }
}

struct WaiterCount<'a>(&'a AtomicUsize);

impl Drop for WaiterCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-wide table of per-key locks
///
/// Entries are created on first use and kept for the registry's lifetime, so
/// a releasing holder never races a new acquirer over entry removal. The map
/// itself sits behind a short-lived mutex that is never held across an await.
#[derive(Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<LockKey, Arc<LockEntry>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &LockKey) -> Arc<LockEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(key.clone()).or_default())
    }

    fn existing(&self, key: &LockKey) -> Option<Arc<LockEntry>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Wait until `key` is free and take it
    ///
    /// Not reentrant: acquiring a key the caller already holds never returns.
    pub async fn acquire(&self, key: LockKey) -> LockGuard {
        let entry = self.entry(&key);
        tracing::debug!(key = %key, "Acquiring lock");
        let guard = entry.lock().await;
        tracing::debug!(key = %key, "Acquired lock");
        LockGuard { key, _guard: guard }
    }

    /// Like [`acquire`](Self::acquire), but gives up after `timeout`
    pub async fn acquire_timeout(&self, key: LockKey, timeout: Duration) -> Result<LockGuard> {
        match tokio::time::timeout(timeout, self.acquire(key.clone())).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(key = %key, waited = ?timeout, "Lock acquisition timed out");
                Err(CloudError::LockTimeout {
                    key: key.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    /// Take every key, in the global order, skipping duplicates
    pub async fn acquire_all(&self, keys: impl IntoIterator<Item = LockKey>) -> MultiLockGuard {
        let keys = normalize_keys(keys);
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.acquire(key).await);
        }
        MultiLockGuard { guards }
    }

    /// Like [`acquire_all`](Self::acquire_all), but gives up after `timeout`
    ///
    /// Keys taken before the timeout fired are released again.
    pub async fn acquire_all_timeout(
        &self,
        keys: impl IntoIterator<Item = LockKey>,
        timeout: Duration,
    ) -> Result<MultiLockGuard> {
        let keys = normalize_keys(keys);
        let label = keys
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        match tokio::time::timeout(timeout, self.acquire_all(keys)).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(keys = %label, waited = ?timeout, "Lock acquisition timed out");
                Err(CloudError::LockTimeout {
                    key: label,
                    waited: timeout,
                })
            }
        }
    }

    /// Whether some caller currently holds `key`
    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.existing(key)
            .is_some_and(|entry| entry.mutex.try_lock().is_err())
    }

    /// Number of callers blocked on `key`
    pub fn waiters(&self, key: &LockKey) -> usize {
        self.existing(key)
            .map_or(0, |entry| entry.waiters.load(Ordering::SeqCst))
    }

    /// Number of distinct keys ever acquired
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped hold on one key; dropping it releases the key
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    key: LockKey,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Release explicitly (same as dropping)
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        tracing::debug!(key = %self.key, "Released lock");
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Scoped hold on a batch of keys, released in reverse acquisition order
#[must_use = "the locks are released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct MultiLockGuard {
    guards: Vec<LockGuard>,
}

impl MultiLockGuard {
    /// Held keys, in acquisition order
    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.guards.iter().map(LockGuard::key)
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn release(self) {}
}

impl Drop for MultiLockGuard {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn nic(name: &str) -> LockKey {
        LockKey::new("azurerm_network_interface", name)
    }

    #[test]
    fn test_key_equality_is_exact() {
        assert_eq!(nic("nic-1"), nic("nic-1"));
        assert_ne!(nic("nic-1"), nic("NIC-1"));
        assert_ne!(
            LockKey::new("azurerm_virtual_network", "shared"),
            LockKey::new("azurerm_network_security_group", "shared")
        );
        assert_eq!(nic("nic-1").to_string(), "azurerm_network_interface.nic-1");
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let keys = normalize_keys(vec![
            LockKey::new("b", "2"),
            LockKey::new("a", "9"),
            LockKey::new("b", "1"),
            LockKey::new("a", "9"),
        ]);
        assert_eq!(
            keys,
            vec![
                LockKey::new("a", "9"),
                LockKey::new("b", "1"),
                LockKey::new("b", "2"),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_no_lost_updates() {
        let registry = Arc::new(LockRegistry::new());
        let counter = Arc::new(AtomicU64::new(0));
        let holders = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let counter = Arc::clone(&counter);
            let holders = Arc::clone(&holders);
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let _guard = registry.acquire(nic("nic-1")).await;
                    assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);

                    // read, yield, write: loses updates unless serialized
                    let current = counter.load(Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    counter.store(current + 1, Ordering::SeqCst);

                    holders.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 16 * 25);
        assert!(!registry.is_locked(&nic("nic-1")));
        assert_eq!(registry.waiters(&nic("nic-1")), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_acquire_all_opposite_orders_never_deadlock() {
        let registry = Arc::new(LockRegistry::new());
        let vnet = LockKey::new("azurerm_virtual_network", "vnet-a");
        let nsg = LockKey::new("azurerm_network_security_group", "nsg-b");

        let spawn_worker = |keys: Vec<LockKey>| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let guard = registry.acquire_all(keys.clone()).await;
                    assert_eq!(guard.len(), 2);
                    tokio::task::yield_now().await;
                }
            })
        };

        let forward = spawn_worker(vec![vnet.clone(), nsg.clone()]);
        let backward = spawn_worker(vec![nsg.clone(), vnet.clone()]);

        let both = async {
            forward.await.unwrap();
            backward.await.unwrap();
        };
        tokio::time::timeout(Duration::from_secs(10), both)
            .await
            .expect("acquire_all deadlocked");
    }

    #[tokio::test]
    async fn test_release_on_error_path() {
        async fn failing_section(registry: &LockRegistry) -> Result<()> {
            let _guard = registry.acquire(nic("nic-err")).await;
            Err(CloudError::ApiError("conflict".to_string()))?;
            Ok(())
        }

        let registry = LockRegistry::new();
        assert!(failing_section(&registry).await.is_err());
        assert!(!registry.is_locked(&nic("nic-err")));

        let guard = registry
            .acquire_timeout(nic("nic-err"), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(guard.key(), &nic("nic-err"));
    }

    #[tokio::test]
    async fn test_acquire_all_skips_duplicate_keys() {
        let registry = LockRegistry::new();
        let keys = vec![nic("nic-1"), nic("nic-1"), nic("nic-2")];

        let guard = registry
            .acquire_all_timeout(keys, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            guard.keys().cloned().collect::<Vec<_>>(),
            vec![nic("nic-1"), nic("nic-2")]
        );
        assert!(registry.is_locked(&nic("nic-1")));

        guard.release();
        assert!(!registry.is_locked(&nic("nic-1")));
        assert!(!registry.is_locked(&nic("nic-2")));
    }

    #[tokio::test]
    async fn test_acquire_timeout_while_held() {
        let registry = LockRegistry::new();
        let _held = registry.acquire(nic("busy")).await;

        let err = registry
            .acquire_timeout(nic("busy"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::LockTimeout { .. }));
        assert_eq!(registry.waiters(&nic("busy")), 0);
    }

    #[tokio::test]
    async fn test_acquire_all_timeout_releases_partial_batch() {
        let registry = LockRegistry::new();
        let vnet = LockKey::new("azurerm_virtual_network", "vnet-1");
        let nsg = LockKey::new("azurerm_network_security_group", "nsg-1");

        // nsg sorts first, vnet second: hold vnet so the batch stalls halfway
        let _held = registry.acquire(vnet.clone()).await;
        let result = registry
            .acquire_all_timeout(vec![vnet.clone(), nsg.clone()], Duration::from_millis(50))
            .await;

        assert!(matches!(result, Err(CloudError::LockTimeout { .. })));
        assert!(!registry.is_locked(&nsg));
        assert!(registry.is_locked(&vnet));
    }

    #[tokio::test]
    async fn test_same_name_different_types_do_not_collide() {
        let registry = LockRegistry::new();
        let _vnet = registry
            .acquire(LockKey::new("azurerm_virtual_network", "shared"))
            .await;

        let nsg = registry
            .acquire_timeout(
                LockKey::new("azurerm_network_security_group", "shared"),
                Duration::from_millis(50),
            )
            .await;
        assert!(nsg.is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_waiter_count_tracks_blocked_callers() {
        let registry = Arc::new(LockRegistry::new());
        let held = registry.acquire(nic("nic-w")).await;

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.acquire(nic("nic-w")).await.release() })
        };
        while registry.waiters(&nic("nic-w")) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.waiters(&nic("nic-w")), 1);

        held.release();
        waiter.await.unwrap();
        assert_eq!(registry.waiters(&nic("nic-w")), 0);
    }
}
