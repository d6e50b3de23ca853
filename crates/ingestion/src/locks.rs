//! Per-assembly import locks
//!
//! Two imports into the same assembly would race on the deduplication
//! index, so each job holds its assembly's lock for the whole transaction.
//! Imports into different assemblies proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Clone, Default)]
pub struct ImportLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl ImportLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `assembly_id`
    pub async fn acquire(&self, assembly_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            // Entries nobody else holds a handle to are idle
            locks.retain(|id, lock| *id == assembly_id || Arc::strong_count(lock) > 1);
            locks.entry(assembly_id).or_default().clone()
        };
        debug!(assembly_id, "Waiting for assembly lock");
        lock.lock_owned().await
    }

    /// Assemblies with a registered lock
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_assembly_is_serialized() {
        let locks = ImportLocks::new();
        let guard = locks.acquire(1).await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.acquire(1).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_assemblies_do_not_block() {
        let locks = ImportLocks::new();
        let _a = locks.acquire(1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(2)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = ImportLocks::new();
        drop(locks.acquire(1).await);
        drop(locks.acquire(2).await);
        let _c = locks.acquire(3).await;
        assert_eq!(locks.len().await, 1);
    }
}
