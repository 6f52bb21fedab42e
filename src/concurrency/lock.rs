//! Object-level locking.
//!
//! Each lock target admits either many shared holders or one exclusive
//! holder. Requests queue per target and are granted in arrival order once
//! compatible with every granted request.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::transaction::TransactionId;

/// Lock modes supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared lock for read operations.
    Shared,
    /// Exclusive lock for write operations.
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Whether holding `self` already satisfies a request for `wanted`.
    pub fn covers(&self, wanted: LockMode) -> bool {
        *self == LockMode::Exclusive || wanted == LockMode::Shared
    }
}

/// Identifier of a lockable object, such as a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockTarget(pub u64);

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object{}", self.0)
    }
}

/// Locks transactions take on objects for their whole lifetime.
pub trait ObjectLocks: Send + Sync {
    /// Blocks until the lock is granted or `timeout` elapses
    /// (`LockTimeout`). Re-acquiring a held lock succeeds immediately;
    /// asking for exclusive while holding shared is
    /// `TransactionUpgradeAttempt`.
    fn acquire(
        &self,
        owner: TransactionId,
        target: LockTarget,
        mode: LockMode,
        timeout: Duration,
    ) -> StorageResult<()>;

    /// Grants the lock only if that is possible without waiting.
    fn try_acquire(
        &self,
        owner: TransactionId,
        target: LockTarget,
        mode: LockMode,
    ) -> StorageResult<bool>;

    /// Releases every lock `owner` holds or waits for.
    fn release_all(&self, owner: TransactionId);
}

#[derive(Debug, Clone)]
struct LockRequest {
    owner: TransactionId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockQueue {
    requests: VecDeque<LockRequest>,
}

impl LockQueue {
    fn granted(&self) -> impl Iterator<Item = &LockRequest> {
        self.requests.iter().filter(|r| r.granted)
    }

    fn held_by(&self, owner: TransactionId) -> Option<LockMode> {
        self.granted().find(|r| r.owner == owner).map(|r| r.mode)
    }

    fn is_compatible(&self, mode: LockMode) -> bool {
        self.granted().all(|r| r.mode.is_compatible_with(&mode))
    }

    fn has_waiters(&self) -> bool {
        self.requests.iter().any(|r| !r.granted)
    }

    /// Grants waiting requests front to back, stopping at the first one that
    /// is still incompatible. Returns whether anything was granted.
    fn grant_waiting(&mut self) -> bool {
        let mut granted_any = false;
        for i in 0..self.requests.len() {
            if self.requests[i].granted {
                continue;
            }
            let mode = self.requests[i].mode;
            if !self.is_compatible(mode) {
                break;
            }
            self.requests[i].granted = true;
            granted_any = true;
        }
        granted_any
    }
}

#[derive(Debug, Default)]
struct LockTable {
    queues: HashMap<LockTarget, LockQueue>,
    owned: HashMap<TransactionId, HashSet<LockTarget>>,
}

impl LockTable {
    /// Removes `owner`'s request for `target` and wakes whoever can now run.
    fn withdraw(&mut self, owner: TransactionId, target: LockTarget) -> bool {
        let mut granted_any = false;
        if let Some(queue) = self.queues.get_mut(&target) {
            queue.requests.retain(|r| r.owner != owner);
            if queue.requests.is_empty() {
                self.queues.remove(&target);
            } else {
                granted_any = queue.grant_waiting();
            }
        }
        granted_any
    }
}

/// Default [`ObjectLocks`] implementation.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    granted: Condvar,
}

impl LockManager {
    /// Creates a new lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode in which `owner` currently holds `target`.
    pub fn held_mode(&self, owner: TransactionId, target: LockTarget) -> Option<LockMode> {
        self.table.lock().queues.get(&target)?.held_by(owner)
    }

    /// Targets `owner` holds.
    pub fn held_targets(&self, owner: TransactionId) -> Vec<LockTarget> {
        let table = self.table.lock();
        let mut targets: Vec<LockTarget> = table
            .owned
            .get(&owner)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }

    /// Already-held check shared by `acquire` and `try_acquire`.
    fn check_held(
        queue: &LockQueue,
        owner: TransactionId,
        target: LockTarget,
        mode: LockMode,
    ) -> StorageResult<bool> {
        match queue.held_by(owner) {
            Some(held) if held.covers(mode) => Ok(true),
            Some(_) => Err(StorageError::TransactionUpgradeAttempt { target: target.0 }),
            None => Ok(false),
        }
    }
}

impl ObjectLocks for LockManager {
    fn acquire(
        &self,
        owner: TransactionId,
        target: LockTarget,
        mode: LockMode,
        timeout: Duration,
    ) -> StorageResult<()> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();

        {
            let queue = table.queues.entry(target).or_default();
            if Self::check_held(queue, owner, target, mode)? {
                return Ok(());
            }
            let granted = !queue.has_waiters() && queue.is_compatible(mode);
            queue.requests.push_back(LockRequest {
                owner,
                mode,
                granted,
            });
        }
        table.owned.entry(owner).or_default().insert(target);

        loop {
            let granted = table
                .queues
                .get(&target)
                .and_then(|queue| queue.requests.iter().find(|r| r.owner == owner))
                .is_some_and(|r| r.granted);
            if granted {
                return Ok(());
            }

            if self.granted.wait_until(&mut table, deadline).timed_out() {
                let still_waiting = table
                    .queues
                    .get(&target)
                    .and_then(|queue| queue.requests.iter().find(|r| r.owner == owner))
                    .is_some_and(|r| !r.granted);
                if !still_waiting {
                    continue;
                }
                if table.withdraw(owner, target) {
                    self.granted.notify_all();
                }
                if let Some(set) = table.owned.get_mut(&owner) {
                    set.remove(&target);
                    if set.is_empty() {
                        table.owned.remove(&owner);
                    }
                }
                return Err(StorageError::LockTimeout { target: target.0 });
            }
        }
    }

    fn try_acquire(
        &self,
        owner: TransactionId,
        target: LockTarget,
        mode: LockMode,
    ) -> StorageResult<bool> {
        let mut table = self.table.lock();
        let queue = table.queues.entry(target).or_default();
        if Self::check_held(queue, owner, target, mode)? {
            return Ok(true);
        }
        if queue.has_waiters() || !queue.is_compatible(mode) {
            if queue.requests.is_empty() {
                table.queues.remove(&target);
            }
            return Ok(false);
        }
        queue.requests.push_back(LockRequest {
            owner,
            mode,
            granted: true,
        });
        table.owned.entry(owner).or_default().insert(target);
        Ok(true)
    }

    fn release_all(&self, owner: TransactionId) {
        let mut table = self.table.lock();
        let Some(targets) = table.owned.remove(&owner) else {
            return;
        };
        let mut granted_any = false;
        for target in targets {
            granted_any |= table.withdraw(owner, target);
        }
        if granted_any {
            self.granted.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_lock_compatibility() {
        assert!(LockMode::Shared.is_compatible_with(&LockMode::Shared));
        assert!(!LockMode::Shared.is_compatible_with(&LockMode::Exclusive));
        assert!(!LockMode::Exclusive.is_compatible_with(&LockMode::Shared));
        assert!(!LockMode::Exclusive.is_compatible_with(&LockMode::Exclusive));
    }

    #[test]
    fn test_multiple_shared_locks() {
        let manager = LockManager::new();
        let target = LockTarget(1);

        for owner in 1..=3 {
            manager
                .acquire(TransactionId(owner), target, LockMode::Shared, LONG)
                .unwrap();
        }
        for owner in 1..=3 {
            assert_eq!(
                manager.held_mode(TransactionId(owner), target),
                Some(LockMode::Shared)
            );
        }
    }

    #[test]
    fn test_reacquire_and_upgrade() {
        let manager = LockManager::new();
        let owner = TransactionId(1);

        manager
            .acquire(owner, LockTarget(1), LockMode::Exclusive, LONG)
            .unwrap();
        manager
            .acquire(owner, LockTarget(1), LockMode::Shared, LONG)
            .unwrap();

        manager
            .acquire(owner, LockTarget(2), LockMode::Shared, LONG)
            .unwrap();
        assert!(matches!(
            manager.acquire(owner, LockTarget(2), LockMode::Exclusive, LONG),
            Err(StorageError::TransactionUpgradeAttempt { target: 2 })
        ));
        assert_eq!(
            manager.held_targets(owner),
            vec![LockTarget(1), LockTarget(2)]
        );
    }

    #[test]
    fn test_exclusive_lock_times_out() {
        let manager = LockManager::new();
        manager
            .acquire(TransactionId(1), LockTarget(7), LockMode::Exclusive, LONG)
            .unwrap();

        let result = manager.acquire(
            TransactionId(2),
            LockTarget(7),
            LockMode::Shared,
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(StorageError::LockTimeout { target: 7 })));
        assert_eq!(manager.held_mode(TransactionId(2), LockTarget(7)), None);
        assert!(manager.held_targets(TransactionId(2)).is_empty());
        assert!(!manager
            .try_acquire(TransactionId(3), LockTarget(7), LockMode::Shared)
            .unwrap());
    }

    #[test]
    fn test_waiter_granted_on_release() {
        let manager = Arc::new(LockManager::new());
        let barrier = Arc::new(Barrier::new(2));
        manager
            .acquire(TransactionId(1), LockTarget(3), LockMode::Exclusive, LONG)
            .unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.acquire(TransactionId(2), LockTarget(3), LockMode::Exclusive, LONG)
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        manager.release_all(TransactionId(1));

        waiter.join().unwrap().unwrap();
        assert_eq!(
            manager.held_mode(TransactionId(2), LockTarget(3)),
            Some(LockMode::Exclusive)
        );
    }

    #[test]
    fn test_release_all_locks() {
        let manager = LockManager::new();
        let owner = TransactionId(1);
        for target in 1..=3 {
            assert!(manager
                .try_acquire(owner, LockTarget(target), LockMode::Exclusive)
                .unwrap());
        }
        assert_eq!(manager.held_targets(owner).len(), 3);

        manager.release_all(owner);
        assert!(manager.held_targets(owner).is_empty());
        assert!(manager
            .try_acquire(TransactionId(2), LockTarget(2), LockMode::Exclusive)
            .unwrap());
    }
}
