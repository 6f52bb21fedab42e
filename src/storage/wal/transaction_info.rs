use std::collections::{HashMap, HashSet};

use crate::storage::page::{PageBuffer, PageHandle};
use crate::transaction::Snapshot;

/// WAL-side state of one active transaction.
#[derive(Debug)]
pub struct WalTransactionInfo {
    pub snapshot: Snapshot,
    /// Pages saved but not yet appended to the WAL file.
    pub pages: HashMap<PageHandle, PageBuffer>,
    /// Pages already appended to the WAL file, by offset of the page image.
    pub flushed: HashMap<PageHandle, u64>,
    /// Handles this transaction allocated; released again on rollback.
    pub allocated: HashSet<PageHandle>,
    /// Handles this transaction freed; released in the bitmap on commit.
    pub deallocated: HashSet<PageHandle>,
}

impl WalTransactionInfo {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            pages: HashMap::new(),
            flushed: HashMap::new(),
            allocated: HashSet::new(),
            deallocated: HashSet::new(),
        }
    }

    /// Every handle this transaction wrote, buffered or flushed.
    pub fn written_handles(&self) -> Vec<PageHandle> {
        let mut handles: Vec<PageHandle> = self
            .pages
            .keys()
            .chain(self.flushed.keys())
            .copied()
            .collect();
        handles.sort();
        handles.dedup();
        handles
    }

    pub fn is_read_only(&self) -> bool {
        self.pages.is_empty() && self.flushed.is_empty()
    }
}
