//! Per-container mutexes.
//!
//! Everything that acts on "the state of container C" serializes on the
//! same logical lock for C: the periodic processor, move preconditions, and
//! the replica-report update path. Entries nobody holds any more are pruned
//! on the next lookup, so the registry tracks live work, not every container
//! ever touched.

use data_types::ContainerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of per-container async mutexes.
#[derive(Debug, Default)]
pub struct ContainerLocks {
    locks: Mutex<HashMap<ContainerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContainerLocks {
    /// The mutex for `container`, created on first use.
    ///
    /// Callers must keep the returned `Arc` alive for as long as they hold
    /// the mutex; an entry only the registry still references belongs to no
    /// in-flight work and is dropped here.
    pub fn get(&self, container: ContainerId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(
            locks
                .entry(container)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// The number of containers currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no container lock is currently tracked.
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_container_same_lock() {
        let locks = ContainerLocks::default();
        let a = locks.get(ContainerId::new(1));
        let b = locks.get(ContainerId::new(1));
        assert!(Arc::ptr_eq(&a, &b));

        let other = locks.get(ContainerId::new(2));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let locks = ContainerLocks::default();

        let held = locks.get(ContainerId::new(1));
        let _guard = held.lock().await;

        let released = locks.get(ContainerId::new(2));
        drop(released);
        assert_eq!(locks.len(), 2);

        // the next lookup drops the entry nobody holds; the held one stays
        let other = locks.get(ContainerId::new(3));
        assert_eq!(locks.len(), 2);
        assert!(Arc::ptr_eq(&held, &locks.get(ContainerId::new(1))));

        drop(_guard);
        drop(held);
        drop(other);
        let _last = locks.get(ContainerId::new(4));
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_serializes_critical_sections() {
        let locks = Arc::new(ContainerLocks::default());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let lock = locks.get(ContainerId::new(7));
                let _guard = lock.lock().await;
                let seen = counter.load(std::sync::atomic::Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.store(seen + 1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 8);
    }
}
