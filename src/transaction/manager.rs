//! Transaction manager for coordinating transaction lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;

use super::id::{TransactionId, TransactionIdGenerator};
use super::scope::TransactionScope;
use crate::concurrency::{LockMode, LockTarget, ObjectLocks};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{PageAllocator, WalBuffer};

/// Locks to take before a transaction starts, and how long to wait for them.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub locks: Vec<(LockTarget, LockMode)>,
    /// Overrides the manager's default lock timeout.
    pub timeout: Option<Duration>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(mut self, target: LockTarget, mode: LockMode) -> Self {
        self.locks.push((target, mode));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Locks sorted by target, each target once in its strongest mode.
    fn ordered_locks(&self) -> Vec<(LockTarget, LockMode)> {
        let mut locks = self.locks.clone();
        locks.sort_by_key(|(target, mode)| (*target, *mode == LockMode::Shared));
        locks.dedup_by_key(|(target, _)| *target);
        locks
    }
}

/// The transaction manager hands out [`TransactionScope`]s, at most one per
/// thread.
pub struct TransactionManager {
    pub(super) allocator: Arc<PageAllocator>,
    pub(super) wal: Arc<WalBuffer>,
    pub(super) locks: Arc<dyn ObjectLocks>,
    pub(super) lock_timeout: Duration,
    id_generator: TransactionIdGenerator,
    threads: Mutex<HashMap<ThreadId, TransactionId>>,
    auto_checkpoint: bool,
}

impl TransactionManager {
    pub fn new(
        allocator: Arc<PageAllocator>,
        wal: Arc<WalBuffer>,
        locks: Arc<dyn ObjectLocks>,
        lock_timeout: Duration,
        auto_checkpoint: bool,
    ) -> Self {
        Self {
            allocator,
            wal,
            locks,
            lock_timeout,
            id_generator: TransactionIdGenerator::new(),
            threads: Mutex::new(HashMap::new()),
            auto_checkpoint,
        }
    }

    /// Begins a transaction on the current thread.
    ///
    /// Requested locks are taken in target order. If one times out, the ones
    /// already granted are released and `LockTimeout` is returned.
    pub fn begin(self: &Arc<Self>, options: TransactionOptions) -> StorageResult<TransactionScope> {
        let thread = thread::current().id();
        if self.threads.lock().contains_key(&thread) {
            return Err(StorageError::NestedTransactionDetected);
        }

        let id = self.id_generator.next();
        let timeout = options.timeout.unwrap_or(self.lock_timeout);
        for (target, mode) in options.ordered_locks() {
            if let Err(err) = self.locks.acquire(id, target, mode, timeout) {
                self.locks.release_all(id);
                debug!("{} could not lock {}: {}", id, target, err);
                return Err(err);
            }
        }

        // A closed gate with nothing running would never reopen.
        if self.wal.is_gate_closed() {
            if let Err(err) = self.allocator.checkpoint() {
                self.locks.release_all(id);
                return Err(err);
            }
        }
        let snapshot = self.wal.begin(id);
        self.threads.lock().insert(thread, id);
        trace!("began {} on {:?}", snapshot, thread);
        Ok(TransactionScope::new(Arc::clone(self), snapshot, thread))
    }

    /// Transaction active on the calling thread, if any.
    pub fn current(&self) -> Option<TransactionId> {
        self.threads.lock().get(&thread::current().id()).copied()
    }

    pub fn active_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Bookkeeping after a scope commits or rolls back.
    pub(super) fn finish(&self, id: TransactionId, thread: ThreadId) -> StorageResult<()> {
        {
            let mut threads = self.threads.lock();
            if threads.get(&thread) == Some(&id) {
                threads.remove(&thread);
            }
        }
        self.locks.release_all(id);
        if (self.auto_checkpoint || self.wal.is_gate_closed()) && self.wal.is_idle() {
            self.allocator.checkpoint()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::LockManager;
    use crate::storage::{MemoryStorage, PageBuffer, PageType, WalConfig};

    fn manager(auto_checkpoint: bool) -> Arc<TransactionManager> {
        let main = MemoryStorage::new();
        PageAllocator::format(&main).unwrap();
        let wal = Arc::new(
            WalBuffer::open(
                Arc::new(main),
                Arc::new(MemoryStorage::new()),
                WalConfig::default(),
            )
            .unwrap(),
        );
        let allocator = Arc::new(PageAllocator::new(Arc::clone(&wal), u32::MAX));
        Arc::new(TransactionManager::new(
            allocator,
            wal,
            Arc::new(LockManager::new()),
            Duration::from_millis(100),
            auto_checkpoint,
        ))
    }

    #[test]
    fn test_nested_transaction_detected() {
        let manager = manager(true);
        let scope = manager.begin(TransactionOptions::new()).unwrap();
        assert_eq!(manager.current(), Some(scope.id()));
        assert!(matches!(
            manager.begin(TransactionOptions::new()),
            Err(StorageError::NestedTransactionDetected)
        ));

        scope.rollback().unwrap();
        assert_eq!(manager.current(), None);
        manager.begin(TransactionOptions::new()).unwrap();
    }

    #[test]
    fn test_lock_timeout_releases_acquired_locks() {
        let manager = manager(true);
        let holder = manager
            .begin(TransactionOptions::new().lock(LockTarget(2), LockMode::Exclusive))
            .unwrap();

        let blocked = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                manager
                    .begin(
                        TransactionOptions::new()
                            .lock(LockTarget(1), LockMode::Exclusive)
                            .lock(LockTarget(2), LockMode::Shared)
                            .timeout(Duration::from_millis(30)),
                    )
                    .map(|_| ())
            })
        };
        assert!(matches!(
            blocked.join().unwrap(),
            Err(StorageError::LockTimeout { target: 2 })
        ));

        // Target 1 was released when target 2 timed out.
        let other = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let scope = manager
                    .begin(TransactionOptions::new().lock(LockTarget(1), LockMode::Exclusive))?;
                scope.commit().map(|_| ())
            })
        };
        other.join().unwrap().unwrap();
        holder.commit().unwrap();
    }

    #[test]
    fn test_ordered_locks_keep_strongest_mode() {
        let options = TransactionOptions::new()
            .lock(LockTarget(5), LockMode::Shared)
            .lock(LockTarget(1), LockMode::Shared)
            .lock(LockTarget(5), LockMode::Exclusive);
        assert_eq!(
            options.ordered_locks(),
            vec![
                (LockTarget(1), LockMode::Shared),
                (LockTarget(5), LockMode::Exclusive)
            ]
        );
    }

    #[test]
    fn test_auto_checkpoint_after_commit() {
        let manager = manager(true);
        let scope = manager.begin(TransactionOptions::new()).unwrap();
        let handle = scope.allocate().unwrap();
        scope.save(&PageBuffer::new(handle, PageType::Object)).unwrap();
        scope.commit().unwrap();
        assert_eq!(manager.wal.wal_page_count(), 0);

        let manager = self::manager(false);
        let scope = manager.begin(TransactionOptions::new()).unwrap();
        let handle = scope.allocate().unwrap();
        scope.save(&PageBuffer::new(handle, PageType::Object)).unwrap();
        scope.commit().unwrap();
        assert!(manager.wal.wal_page_count() > 0);
    }
}
