//! Page allocation over a chain of bitmap pages.
//!
//! The root page and every bitmap page are only ever read and written through
//! the WAL's virtual transaction. Transactions see the effect of their
//! allocations immediately; the bitmap pages themselves become durable when
//! [`PageAllocator::commit`] copies them into a committing transaction, or at
//! the next checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::storage::disk::Storage;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{
    AllocationPage, PageBuffer, PageHandle, PageType, RootPage, TreeKind, TreeRootPage,
};
use crate::storage::wal::WalBuffer;
use crate::transaction::{CommitId, Snapshot};

/// First allocation bitmap page of a freshly formatted file.
pub const FIRST_ALLOCATION_PAGE: PageHandle = PageHandle(2);
/// Anchor of the collection catalog tree in a freshly formatted file.
pub const CATALOG_ANCHOR_PAGE: PageHandle = PageHandle(3);

pub struct PageAllocator {
    wal: Arc<WalBuffer>,
    max_page_count: u32,
    /// Serialises every allocator operation. Always taken before the WAL lock.
    sync: Mutex<()>,
}

impl PageAllocator {
    pub fn new(wal: Arc<WalBuffer>, max_page_count: u32) -> Self {
        Self {
            wal,
            max_page_count,
            sync: Mutex::new(()),
        }
    }

    /// Writes the initial Null, Root, bitmap and catalog anchor pages straight
    /// into an empty main file.
    pub fn format(main: &dyn Storage) -> StorageResult<()> {
        let mut null = PageBuffer::new(PageHandle::NULL, PageType::Free);

        let mut root = PageBuffer::new(PageHandle::ROOT, PageType::Root);
        {
            let mut view = RootPage::init(&mut root);
            view.set_next_available(PageHandle(CATALOG_ANCHOR_PAGE.0 + 1));
            view.set_allocation_head(FIRST_ALLOCATION_PAGE);
            view.set_allocation_tail(FIRST_ALLOCATION_PAGE);
            view.set_metadata_root(CATALOG_ANCHOR_PAGE);
        }

        let mut bitmap = PageBuffer::new(FIRST_ALLOCATION_PAGE, PageType::Allocation);
        {
            let mut view = AllocationPage::init(&mut bitmap, PageHandle::NULL);
            for handle in [
                PageHandle::NULL,
                PageHandle::ROOT,
                FIRST_ALLOCATION_PAGE,
                CATALOG_ANCHOR_PAGE,
            ] {
                view.set_allocated(handle, true);
            }
        }

        let mut catalog = PageBuffer::new(CATALOG_ANCHOR_PAGE, PageType::BTreeRoot);
        TreeRootPage::init(&mut catalog, TreeKind::Index);

        for page in [&mut null, &mut root, &mut bitmap, &mut catalog] {
            page.update_checksum();
            main.write_at(page.handle().offset(), page.as_bytes())?;
        }
        main.persist()?;
        debug!("formatted main file with {} pages", CATALOG_ANCHOR_PAGE.0 + 1);
        Ok(())
    }

    /// Allocates a handle for `owner`, reusing the lowest free handle or
    /// growing the file.
    pub fn allocate(&self, owner: Snapshot) -> StorageResult<PageHandle> {
        let _sync = self.sync.lock();
        let snapshot = self.wal.virtual_snapshot();
        let mut root = self.wal.load(snapshot, PageHandle::ROOT)?;
        let (next_available, head, tail) = {
            let view = RootPage::new(&root);
            (
                view.next_available(),
                view.allocation_head(),
                view.allocation_tail(),
            )
        };

        let mut current = head;
        while !current.is_null() {
            let mut bitmap = self.wal.load(snapshot, current)?;
            let (free, next) = {
                let view = AllocationPage::new(&bitmap);
                (view.find_free(next_available), view.next())
            };
            if let Some(handle) = free {
                AllocationPage::new(&mut bitmap).set_allocated(handle, true);
                self.wal.save(snapshot, &bitmap)?;
                return self.hand_out(owner, handle, "reused");
            }
            current = next;
        }

        let mut tail_page = self.wal.load(snapshot, tail)?;
        let handle = if AllocationPage::new(&tail_page).covers(next_available) {
            let grown = self.checked_growth(next_available, 1)?;
            AllocationPage::new(&mut tail_page).set_allocated(next_available, true);
            self.wal.save(snapshot, &tail_page)?;
            RootPage::new(&mut root).set_next_available(grown);
            next_available
        } else {
            // The tail bitmap is exhausted: `next_available` becomes the next
            // bitmap page and the handle after it is handed out.
            let grown = self.checked_growth(next_available, 2)?;
            let bitmap_handle = next_available;
            let handle = PageHandle(bitmap_handle.0 + 1);

            let mut bitmap = PageBuffer::new(bitmap_handle, PageType::Allocation);
            {
                let mut view = AllocationPage::init(&mut bitmap, bitmap_handle);
                view.set_allocated(bitmap_handle, true);
                view.set_allocated(handle, true);
            }
            AllocationPage::new(&mut tail_page).set_next(bitmap_handle);
            self.wal.save(snapshot, &bitmap)?;
            self.wal.save(snapshot, &tail_page)?;

            let mut view = RootPage::new(&mut root);
            view.set_allocation_tail(bitmap_handle);
            view.set_next_available(grown);
            debug!("appended allocation bitmap {}", bitmap_handle);
            handle
        };
        self.wal.save(snapshot, &root)?;
        self.wal
            .ensure_main_pages(RootPage::new(&root).next_available().0)?;
        self.hand_out(owner, handle, "extended")
    }

    fn checked_growth(&self, next_available: PageHandle, pages: u32) -> StorageResult<PageHandle> {
        match next_available.0.checked_add(pages) {
            Some(grown) if grown <= self.max_page_count => Ok(PageHandle(grown)),
            _ => Err(StorageError::MaxPageCountReached {
                max: self.max_page_count,
            }),
        }
    }

    fn hand_out(&self, owner: Snapshot, handle: PageHandle, how: &str) -> StorageResult<PageHandle> {
        if !owner.is_virtual() {
            self.wal.record_allocation(owner, handle)?;
        }
        trace!("allocated {} for {} ({})", handle, owner.transaction_id, how);
        Ok(handle)
    }

    /// Marks `handles` free. Page contents are left as they are.
    pub fn release(&self, handles: &[PageHandle]) -> StorageResult<()> {
        let _sync = self.sync.lock();
        self.mark_locked(handles, false)
    }

    fn mark_locked(&self, handles: &[PageHandle], live: bool) -> StorageResult<()> {
        if handles.is_empty() {
            return Ok(());
        }
        let snapshot = self.wal.virtual_snapshot();
        let head = RootPage::new(&self.wal.load(snapshot, PageHandle::ROOT)?).allocation_head();

        let mut touched: BTreeMap<PageHandle, PageBuffer> = BTreeMap::new();
        let mut chain = Vec::new();
        let mut current = head;
        while !current.is_null() {
            let page = self.wal.load(snapshot, current)?;
            current = AllocationPage::new(&page).next();
            chain.push(page);
        }

        for &handle in handles {
            debug_assert!(
                handle != PageHandle::NULL && handle != PageHandle::ROOT,
                "reserved page {} released",
                handle
            );
            if let Some(bitmap) = chain
                .iter_mut()
                .find(|page| AllocationPage::new(&**page).covers(handle))
            {
                AllocationPage::new(&mut *bitmap).set_allocated(handle, live);
                touched.insert(bitmap.handle(), bitmap.clone());
            }
            trace!("marked {} {}", handle, if live { "live" } else { "free" });
        }

        for page in touched.values() {
            self.wal.save(snapshot, page)?;
        }
        Ok(())
    }

    /// Commits `snapshot`, first applying its deferred deallocations and
    /// carrying the allocator's pending bitmap and root pages along with it.
    ///
    /// If the commit fails the deallocated handles are marked live again, so
    /// a later rollback of `snapshot` leaves the bitmap as it was.
    pub fn commit(&self, snapshot: Snapshot) -> StorageResult<CommitId> {
        let _sync = self.sync.lock();
        let deallocated = self.wal.deallocated(snapshot)?;
        let result = self
            .mark_locked(&deallocated, false)
            .and_then(|()| self.carry_and_commit(snapshot, !deallocated.is_empty()));
        if let Err(err) = &result {
            if !deallocated.is_empty() {
                warn!(
                    "commit of {} failed ({}), restoring {} deallocated pages",
                    snapshot.transaction_id,
                    err,
                    deallocated.len()
                );
                self.mark_locked(&deallocated, true)?;
            }
        }
        result
    }

    fn carry_and_commit(&self, snapshot: Snapshot, deallocated: bool) -> StorageResult<CommitId> {
        let writes = !self.wal.written_handles(snapshot)?.is_empty();
        if writes || deallocated {
            let virtual_snapshot = self.wal.virtual_snapshot();
            for handle in self.wal.written_handles(virtual_snapshot)? {
                let page = self.wal.load(virtual_snapshot, handle)?;
                self.wal.save(snapshot, &page)?;
            }
        }
        self.wal.commit(snapshot)
    }

    /// Discards `snapshot` and frees every handle it allocated.
    pub fn rollback(&self, snapshot: Snapshot) -> StorageResult<()> {
        let _sync = self.sync.lock();
        let allocated = self.wal.rollback(snapshot);
        self.mark_locked(&allocated, false)
    }

    /// Runs a WAL checkpoint while holding the allocator lock.
    pub fn checkpoint(&self) -> StorageResult<Option<Snapshot>> {
        let _sync = self.sync.lock();
        self.wal.checkpoint()
    }

    /// Anchor of the collection catalog tree.
    pub fn metadata_root(&self) -> StorageResult<PageHandle> {
        let _sync = self.sync.lock();
        let root = self.wal.load(self.wal.virtual_snapshot(), PageHandle::ROOT)?;
        Ok(RootPage::new(&root).metadata_root())
    }

    pub fn next_available(&self) -> StorageResult<PageHandle> {
        let _sync = self.sync.lock();
        let root = self.wal.load(self.wal.virtual_snapshot(), PageHandle::ROOT)?;
        Ok(RootPage::new(&root).next_available())
    }

    pub fn is_allocated(&self, handle: PageHandle) -> StorageResult<bool> {
        Ok(self.live_handles()?.binary_search(&handle).is_ok())
    }

    /// Every live handle below `next_available`, ascending.
    pub fn live_handles(&self) -> StorageResult<Vec<PageHandle>> {
        let _sync = self.sync.lock();
        let snapshot = self.wal.virtual_snapshot();
        let root = self.wal.load(snapshot, PageHandle::ROOT)?;
        let (next_available, head) = {
            let view = RootPage::new(&root);
            (view.next_available(), view.allocation_head())
        };

        let mut live = Vec::new();
        let mut current = head;
        while !current.is_null() {
            let page = self.wal.load(snapshot, current)?;
            let view = AllocationPage::new(&page);
            live.extend(view.allocated().take_while(|handle| *handle < next_available));
            current = view.next();
        }
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::MemoryStorage;
    use crate::storage::page::allocation_page::ALLOCATION_BITMAP_PAGE_COUNT;
    use crate::storage::wal::WalConfig;
    use crate::transaction::TransactionId;

    fn setup(max_page_count: u32) -> (Arc<WalBuffer>, PageAllocator) {
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
        let allocator = PageAllocator::new(Arc::clone(&wal), max_page_count);
        (wal, allocator)
    }

    #[test]
    fn test_format_layout() {
        let (_wal, allocator) = setup(u32::MAX);
        assert_eq!(allocator.next_available().unwrap(), PageHandle(4));
        assert_eq!(allocator.metadata_root().unwrap(), CATALOG_ANCHOR_PAGE);
        assert_eq!(
            allocator.live_handles().unwrap(),
            vec![PageHandle(0), PageHandle(1), PageHandle(2), PageHandle(3)]
        );
    }

    #[test]
    fn test_allocate_extends_then_reuses() {
        let (wal, allocator) = setup(u32::MAX);
        let tx = wal.begin(TransactionId(1));

        let a = allocator.allocate(tx).unwrap();
        let b = allocator.allocate(tx).unwrap();
        assert_eq!((a, b), (PageHandle(4), PageHandle(5)));
        assert_eq!(allocator.next_available().unwrap(), PageHandle(6));

        allocator.release(&[a]).unwrap();
        assert!(!allocator.is_allocated(a).unwrap());
        assert_eq!(allocator.allocate(tx).unwrap(), a);
        // Reuse never moves next_available backwards.
        assert_eq!(allocator.next_available().unwrap(), PageHandle(6));
    }

    #[test]
    fn test_rollback_frees_allocations() {
        let (wal, allocator) = setup(u32::MAX);
        let tx = wal.begin(TransactionId(1));
        let handle = allocator.allocate(tx).unwrap();
        assert!(allocator.is_allocated(handle).unwrap());

        allocator.rollback(tx).unwrap();
        assert!(!allocator.is_allocated(handle).unwrap());
    }

    #[test]
    fn test_commit_applies_deferred_deallocations() {
        let (wal, allocator) = setup(u32::MAX);
        let tx = wal.begin(TransactionId(1));
        let handle = allocator.allocate(tx).unwrap();
        wal.save(tx, &PageBuffer::new(handle, PageType::Object))
            .unwrap();
        allocator.commit(tx).unwrap();

        let tx = wal.begin(TransactionId(2));
        wal.record_deallocation(tx, handle).unwrap();
        assert!(allocator.is_allocated(handle).unwrap());
        allocator.commit(tx).unwrap();
        assert!(!allocator.is_allocated(handle).unwrap());
    }

    #[test]
    fn test_max_page_count() {
        let (wal, allocator) = setup(5);
        let tx = wal.begin(TransactionId(1));
        assert_eq!(allocator.allocate(tx).unwrap(), PageHandle(4));
        assert!(matches!(
            allocator.allocate(tx),
            Err(StorageError::MaxPageCountReached { max: 5 })
        ));
    }

    #[test]
    fn test_bitmap_chain_grows() {
        let (wal, allocator) = setup(u32::MAX);
        let snapshot = wal.virtual_snapshot();

        // Pretend the first bitmap is full up to its last tracked handle.
        let mut root = wal.load(snapshot, PageHandle::ROOT).unwrap();
        RootPage::new(&mut root).set_next_available(PageHandle(ALLOCATION_BITMAP_PAGE_COUNT));
        wal.save(snapshot, &root).unwrap();
        let mut bitmap = wal.load(snapshot, FIRST_ALLOCATION_PAGE).unwrap();
        {
            let mut view = AllocationPage::new(&mut bitmap);
            for handle in 4..ALLOCATION_BITMAP_PAGE_COUNT {
                view.set_allocated(PageHandle(handle), true);
            }
        }
        wal.save(snapshot, &bitmap).unwrap();

        let owner = wal.begin(TransactionId(1));
        let handle = allocator.allocate(owner).unwrap();
        assert_eq!(handle, PageHandle(ALLOCATION_BITMAP_PAGE_COUNT + 1));
        assert_eq!(
            allocator.next_available().unwrap(),
            PageHandle(ALLOCATION_BITMAP_PAGE_COUNT + 2)
        );

        let live = allocator.live_handles().unwrap();
        assert!(live.contains(&PageHandle(ALLOCATION_BITMAP_PAGE_COUNT)));
        assert!(live.contains(&handle));

        allocator.release(&[PageHandle(100)]).unwrap();
        assert_eq!(allocator.allocate(owner).unwrap(), PageHandle(100));
    }
}
