//! Cache of committed page images shared by all snapshots.
//!
//! Each entry is tagged with the version it holds: `Some(commit)` for a page
//! read from the WAL, `None` for a page read from the main file. A lookup
//! only hits when the caller asks for exactly that version.

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::storage::page::{PageBuffer, PageHandle};
use crate::transaction::CommitId;

#[derive(Clone)]
struct CachedPage {
    version: Option<CommitId>,
    page: PageBuffer,
}

/// Least-recently-used ordering over cached handles.
#[derive(Debug, Default)]
struct Recency {
    tick: u64,
    by_handle: HashMap<PageHandle, u64>,
    by_tick: BTreeMap<u64, PageHandle>,
}

impl Recency {
    fn touch(&mut self, handle: PageHandle) {
        self.tick += 1;
        if let Some(old) = self.by_handle.insert(handle, self.tick) {
            self.by_tick.remove(&old);
        }
        self.by_tick.insert(self.tick, handle);
    }

    fn forget(&mut self, handle: PageHandle) {
        if let Some(old) = self.by_handle.remove(&handle) {
            self.by_tick.remove(&old);
        }
    }

    fn evict(&mut self) -> Option<PageHandle> {
        let (_, handle) = self.by_tick.pop_first()?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    fn clear(&mut self) {
        self.by_handle.clear();
        self.by_tick.clear();
    }
}

pub struct PageCache {
    entries: DashMap<PageHandle, CachedPage>,
    recency: Mutex<Recency>,
    capacity: usize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            recency: Mutex::new(Recency::default()),
            capacity,
        }
    }

    /// Copy of the cached image of `handle` if it holds `version`.
    pub fn get(&self, handle: PageHandle, version: Option<CommitId>) -> Option<PageBuffer> {
        let page = {
            let entry = self.entries.get(&handle)?;
            if entry.version != version {
                return None;
            }
            entry.page.clone()
        };
        self.recency.lock().touch(handle);
        Some(page)
    }

    pub fn insert(&self, handle: PageHandle, version: Option<CommitId>, page: PageBuffer) {
        if self.capacity == 0 {
            return;
        }
        let mut recency = self.recency.lock();
        self.entries.insert(handle, CachedPage { version, page });
        recency.touch(handle);
        while self.entries.len() > self.capacity {
            match recency.evict() {
                Some(victim) => {
                    self.entries.remove(&victim);
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, handle: PageHandle) {
        let mut recency = self.recency.lock();
        self.entries.remove(&handle);
        recency.forget(handle);
    }

    /// After a checkpoint the main file holds `folded[handle]` for every
    /// folded page. Entries holding that version now describe the main file;
    /// any other entry for a folded page is stale.
    pub fn rebase(&self, folded: &HashMap<PageHandle, CommitId>) {
        let mut recency = self.recency.lock();
        for (handle, newest) in folded {
            let stale = match self.entries.get_mut(handle) {
                Some(mut entry) if entry.version == Some(*newest) => {
                    entry.version = None;
                    false
                }
                Some(_) => true,
                None => false,
            };
            if stale {
                self.entries.remove(handle);
                recency.forget(*handle);
            }
        }
    }

    pub fn clear(&self) {
        let mut recency = self.recency.lock();
        self.entries.clear();
        recency.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    fn page(handle: u32, fill: u8) -> PageBuffer {
        let mut page = PageBuffer::new(PageHandle(handle), PageType::Object);
        page.as_bytes_mut()[100] = fill;
        page
    }

    #[test]
    fn test_version_must_match() {
        let cache = PageCache::new(8);
        cache.insert(PageHandle(5), Some(CommitId(3)), page(5, 1));

        assert!(cache.get(PageHandle(5), Some(CommitId(3))).is_some());
        assert!(cache.get(PageHandle(5), Some(CommitId(2))).is_none());
        assert!(cache.get(PageHandle(5), None).is_none());
        assert!(cache.get(PageHandle(6), Some(CommitId(3))).is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = PageCache::new(2);
        cache.insert(PageHandle(1), None, page(1, 1));
        cache.insert(PageHandle(2), None, page(2, 2));
        // Touch 1 so 2 becomes least recently used.
        assert!(cache.get(PageHandle(1), None).is_some());
        cache.insert(PageHandle(3), None, page(3, 3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(PageHandle(1), None).is_some());
        assert!(cache.get(PageHandle(2), None).is_none());
        assert!(cache.get(PageHandle(3), None).is_some());
    }

    #[test]
    fn test_rebase_after_checkpoint() {
        let cache = PageCache::new(8);
        cache.insert(PageHandle(1), Some(CommitId(4)), page(1, 1));
        cache.insert(PageHandle(2), Some(CommitId(2)), page(2, 2));
        cache.insert(PageHandle(3), None, page(3, 3));
        cache.insert(PageHandle(4), None, page(4, 4));

        let folded: HashMap<PageHandle, CommitId> = [
            (PageHandle(1), CommitId(4)),
            (PageHandle(2), CommitId(5)),
            (PageHandle(3), CommitId(1)),
        ]
        .into_iter()
        .collect();
        cache.rebase(&folded);

        let retagged = cache.get(PageHandle(1), None).unwrap();
        assert_eq!(retagged.as_bytes()[100], 1);
        assert!(cache.get(PageHandle(2), None).is_none());
        assert!(cache.get(PageHandle(3), None).is_none());
        assert!(cache.get(PageHandle(4), None).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = PageCache::new(0);
        cache.insert(PageHandle(1), None, page(1, 1));
        assert!(cache.is_empty());
    }
}
