use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lazily-created per-resource async locks.
///
/// Entries appear on first use and are removed once nobody holds or
/// waits on them, so the table stays proportional to contention rather
/// than to the resource id space. Creation and removal both happen
/// under the table mutex, so two tasks can never end up serializing on
/// different locks for the same id.
#[derive(Default)]
pub struct ResourceLockTable {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ResourceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a resource id, creating the entry if
    /// needed. The returned guard releases on drop.
    pub async fn lock(&self, resource_id: &str) -> ResourceGuard<'_> {
        let entry = {
            let mut entries = self.entries.lock();
            Arc::clone(
                entries
                    .entry(resource_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let guard = entry.lock_owned().await;

        ResourceGuard {
            table: self,
            resource_id: resource_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of live entries.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn release(&self, resource_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(resource_id) {
            // The map's own reference is the last one standing exactly
            // when no task holds the lock or waits on it.
            if Arc::strong_count(entry) == 1 {
                entries.remove(resource_id);
            }
        }
    }
}

/// Holds one resource's lock until dropped.
pub struct ResourceGuard<'a> {
    table: &'a ResourceLockTable,
    resource_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        // The mutex guard must go before the refcount check, since it
        // keeps its own Arc to the entry alive.
        self.guard.take();
        self.table.release(&self.resource_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let table = ResourceLockTable::new();

        {
            let _guard = table.lock("i-1").await;
            assert_eq!(table.len(), 1);
        }

        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_separate_resources_do_not_contend() {
        let table = Arc::new(ResourceLockTable::new());

        let _a = table.lock("i-1").await;
        let _b = table.lock("i-2").await;
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_same_resource_serializes() {
        let table = Arc::new(ResourceLockTable::new());
        let busy = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            let busy = Arc::clone(&busy);
            tasks.push(tokio::spawn(async move {
                let _guard = table.lock("i-1").await;
                assert!(!busy.swap(true, Ordering::SeqCst), "critical section overlap");
                tokio::time::sleep(Duration::from_millis(5)).await;
                busy.store(false, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.expect("task should not panic");
        }

        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_entry_survives_while_contended() {
        let table = Arc::new(ResourceLockTable::new());

        let held = table.lock("i-1").await;

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                let _guard = table.lock("i-1").await;
            })
        };

        // Give the waiter time to queue on the same entry.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(table.len(), 1);

        drop(held);
        waiter.await.expect("waiter should finish");

        assert!(table.is_empty());
    }
}
