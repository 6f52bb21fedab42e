//! A handle to a transaction that rolls back on drop if still active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{trace, warn};

use super::id::{CommitId, TransactionId};
use super::manager::TransactionManager;
use super::snapshot::Snapshot;
use crate::concurrency::{LockMode, LockTarget};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageBuffer, PageHandle};

pub struct TransactionScope {
    manager: Arc<TransactionManager>,
    snapshot: Snapshot,
    thread: ThreadId,
    active: AtomicBool,
}

impl TransactionScope {
    pub(super) fn new(manager: Arc<TransactionManager>, snapshot: Snapshot, thread: ThreadId) -> Self {
        Self {
            manager,
            snapshot,
            thread,
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.snapshot.transaction_id
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> StorageResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StorageError::TransactionCompleted)
        }
    }

    fn ensure_owner_thread(&self) -> StorageResult<()> {
        if thread::current().id() == self.thread {
            Ok(())
        } else {
            Err(StorageError::TransactionScopeMismatch)
        }
    }

    /// Private copy of the page version this transaction sees.
    pub fn load(&self, handle: PageHandle) -> StorageResult<PageBuffer> {
        self.ensure_active()?;
        self.manager.wal.load(self.snapshot, handle)
    }

    pub fn save(&self, page: &PageBuffer) -> StorageResult<()> {
        self.ensure_active()?;
        self.manager.wal.save(self.snapshot, page)
    }

    /// Allocates a page handle. It is freed again if the transaction rolls
    /// back.
    pub fn allocate(&self) -> StorageResult<PageHandle> {
        self.ensure_active()?;
        self.manager.allocator.allocate(self.snapshot)
    }

    /// Frees `handle` once this transaction commits.
    pub fn deallocate(&self, handle: PageHandle) -> StorageResult<()> {
        self.ensure_active()?;
        self.manager.wal.record_deallocation(self.snapshot, handle)
    }

    /// Takes an additional object lock for the rest of the transaction.
    pub fn acquire(&self, target: LockTarget, mode: LockMode) -> StorageResult<()> {
        self.ensure_active()?;
        self.manager
            .locks
            .acquire(self.id(), target, mode, self.manager.lock_timeout)
    }

    /// Publishes everything this transaction saved.
    ///
    /// On failure the scope stays active and is rolled back when dropped.
    /// A checkpoint that fails after the commit record is durable is only
    /// logged; the WAL still holds the commit and the next checkpoint retries.
    pub fn commit(&self) -> StorageResult<CommitId> {
        self.ensure_active()?;
        self.ensure_owner_thread()?;
        let commit = self.manager.allocator.commit(self.snapshot)?;
        self.active.store(false, Ordering::SeqCst);
        trace!("{} committed as {}", self.id(), commit);
        self.finish();
        Ok(commit)
    }

    /// Discards everything this transaction saved. Rolling back a completed
    /// scope does nothing.
    pub fn rollback(&self) -> StorageResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.ensure_owner_thread()?;
        self.abandon()
    }

    fn abandon(&self) -> StorageResult<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.manager.allocator.rollback(self.snapshot);
        trace!("{} rolled back", self.id());
        self.finish();
        result
    }

    fn finish(&self) {
        if let Err(err) = self.manager.finish(self.id(), self.thread) {
            warn!("checkpoint after {} failed: {}", self.id(), err);
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if let Err(err) = self.abandon() {
            warn!("rollback of {} on drop failed: {}", self.id(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::concurrency::LockManager;
    use crate::storage::{MemoryStorage, PageAllocator, PageType, WalBuffer, WalConfig};
    use crate::transaction::TransactionOptions;

    fn manager() -> Arc<TransactionManager> {
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
            true,
        ))
    }

    fn write_page(scope: &TransactionScope, fill: u8) -> PageHandle {
        let handle = scope.allocate().unwrap();
        let mut page = PageBuffer::new(handle, PageType::Object);
        page.as_bytes_mut()[100] = fill;
        scope.save(&page).unwrap();
        handle
    }

    #[test]
    fn test_commit_makes_pages_visible() {
        let manager = manager();
        let scope = manager.begin(TransactionOptions::new()).unwrap();
        let handle = write_page(&scope, 42);
        scope.commit().unwrap();
        assert!(!scope.is_active());

        let reader = manager.begin(TransactionOptions::new()).unwrap();
        assert_eq!(reader.load(handle).unwrap().as_bytes()[100], 42);
    }

    #[test]
    fn test_completed_scope_rejects_operations() {
        let manager = manager();
        let scope = manager.begin(TransactionOptions::new()).unwrap();
        scope.commit().unwrap();

        assert!(matches!(scope.commit(), Err(StorageError::TransactionCompleted)));
        assert!(matches!(
            scope.load(PageHandle::ROOT),
            Err(StorageError::TransactionCompleted)
        ));
        assert!(matches!(scope.allocate(), Err(StorageError::TransactionCompleted)));
        scope.rollback().unwrap();
    }

    #[test]
    fn test_drop_rolls_back() {
        let manager = manager();
        let handle = {
            let scope = manager.begin(TransactionOptions::new()).unwrap();
            write_page(&scope, 1)
        };
        assert_eq!(manager.active_count(), 0);
        assert!(!manager.allocator.is_allocated(handle).unwrap());

        // The handle is reused by the next allocation.
        let scope = manager.begin(TransactionOptions::new()).unwrap();
        assert_eq!(scope.allocate().unwrap(), handle);
    }

    #[test]
    fn test_commit_from_other_thread_is_rejected() {
        let manager = manager();
        let scope = manager.begin(TransactionOptions::new()).unwrap();
        let scope = std::thread::spawn(move || {
            assert!(matches!(
                scope.commit(),
                Err(StorageError::TransactionScopeMismatch)
            ));
            assert!(matches!(
                scope.rollback(),
                Err(StorageError::TransactionScopeMismatch)
            ));
            scope
        })
        .join()
        .unwrap();
        assert!(scope.is_active());
        scope.commit().unwrap();
    }

    #[test]
    fn test_deallocate_is_deferred() {
        let manager = manager();
        let scope = manager.begin(TransactionOptions::new()).unwrap();
        let handle = write_page(&scope, 3);
        scope.commit().unwrap();

        let scope = manager.begin(TransactionOptions::new()).unwrap();
        scope.deallocate(handle).unwrap();
        assert!(manager.allocator.is_allocated(handle).unwrap());
        scope.commit().unwrap();
        assert!(!manager.allocator.is_allocated(handle).unwrap());
    }

    #[test]
    fn test_acquire_upgrade_attempt() {
        let manager = manager();
        let scope = manager
            .begin(TransactionOptions::new().lock(LockTarget(9), LockMode::Shared))
            .unwrap();
        assert!(matches!(
            scope.acquire(LockTarget(9), LockMode::Exclusive),
            Err(StorageError::TransactionUpgradeAttempt { target: 9 })
        ));
        scope.acquire(LockTarget(10), LockMode::Exclusive).unwrap();
    }
}
