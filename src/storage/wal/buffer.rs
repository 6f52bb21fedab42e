//! Snapshot-isolated page buffering over an append-only WAL file.
//!
//! Transactions save whole page images. Saved pages stay in memory until the
//! transaction commits or the global buffered-page limit is hit, at which
//! point they are appended to the WAL as `Page` records. A `Commit` record
//! publishes a transaction's pages under a new commit id. Readers resolve a
//! page to the newest version their snapshot can see. A checkpoint folds the
//! newest committed version of every page into the main file and truncates the
//! WAL back to its header.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::page_cache::PageCache;
use super::record::{self, WalRecord, WAL_HEADER_SIZE, WAL_RECORD_SIZE};
use super::recovery::{self, RecoveryStats};
use super::transaction_info::WalTransactionInfo;
use crate::storage::disk::{Storage, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageBuffer, PageHandle};
use crate::transaction::{CommitId, Snapshot, TransactionId};

/// WAL buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalConfig {
    /// Committed pages the WAL may hold before new transactions wait for a
    /// checkpoint.
    pub checkpoint_page_limit: usize,
    /// Pages buffered in memory across all transactions before every buffer is
    /// appended to the WAL file.
    pub buffered_page_limit: usize,
    /// Committed page images kept in the shared cache.
    pub page_cache_capacity: usize,
    /// Whether to sync the WAL file on every commit.
    pub sync_on_commit: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            checkpoint_page_limit: 4096,
            buffered_page_limit: 1024,
            page_cache_capacity: 2048,
            sync_on_commit: true,
        }
    }
}

/// One committed version of a page in the WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommittedVersion {
    pub commit: CommitId,
    /// Offset of the page image.
    pub offset: u64,
}

struct WalState {
    transactions: HashMap<TransactionId, WalTransactionInfo>,
    /// Committed versions of each page, oldest first.
    committed: HashMap<PageHandle, Vec<CommittedVersion>>,
    latest_commit: CommitId,
    wal_length: u64,
    /// Committed page records since the last checkpoint.
    wal_page_count: usize,
    /// In-memory pages across all transactions.
    buffered_page_count: usize,
    gate_closed: bool,
}

impl WalState {
    fn info(&self, snapshot: Snapshot) -> StorageResult<&WalTransactionInfo> {
        self.transactions
            .get(&snapshot.transaction_id)
            .ok_or(StorageError::TransactionDoesNotExist(snapshot.transaction_id.0))
    }

    fn info_mut(&mut self, snapshot: Snapshot) -> StorageResult<&mut WalTransactionInfo> {
        self.transactions
            .get_mut(&snapshot.transaction_id)
            .ok_or(StorageError::TransactionDoesNotExist(snapshot.transaction_id.0))
    }

    fn has_active_transactions(&self) -> bool {
        self.transactions.keys().any(|id| !id.is_virtual())
    }

    /// Newest committed version of `handle` visible at `latest`.
    fn visible_version(&self, handle: PageHandle, latest: CommitId) -> Option<CommittedVersion> {
        self.committed
            .get(&handle)?
            .iter()
            .rev()
            .find(|version| version.commit <= latest)
            .copied()
    }
}

pub struct WalBuffer {
    main: Arc<dyn Storage>,
    wal: Arc<dyn Storage>,
    config: WalConfig,
    state: Mutex<WalState>,
    gate: Condvar,
    cache: PageCache,
}

enum PageSource {
    OwnWal(u64),
    Committed(CommittedVersion),
    MainFile,
}

impl WalBuffer {
    /// Opens the WAL over `wal`, writing a fresh header if it is empty.
    ///
    /// Existing records are not replayed; call [`WalBuffer::restore`] before
    /// starting transactions.
    pub fn open(
        main: Arc<dyn Storage>,
        wal: Arc<dyn Storage>,
        config: WalConfig,
    ) -> StorageResult<Self> {
        let length = wal.len()?;
        if length < WAL_HEADER_SIZE as u64 {
            wal.set_len(0)?;
            wal.write_at(0, &record::encode_header())?;
            wal.persist()?;
        } else {
            let mut header = [0u8; WAL_HEADER_SIZE];
            wal.read_at(0, &mut header)?;
            record::verify_header(&header)?;
        }
        let wal_length = wal.len()?;

        Ok(Self {
            main,
            wal,
            cache: PageCache::new(config.page_cache_capacity),
            config,
            state: Mutex::new(WalState {
                transactions: HashMap::new(),
                committed: HashMap::new(),
                latest_commit: CommitId::default(),
                wal_length,
                wal_page_count: 0,
                buffered_page_count: 0,
                gate_closed: false,
            }),
            gate: Condvar::new(),
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Registers a transaction, waiting first while the checkpoint gate is
    /// closed.
    pub fn begin(&self, id: TransactionId) -> Snapshot {
        let mut state = self.state.lock();
        while state.gate_closed {
            self.gate.wait(&mut state);
        }
        let snapshot = Snapshot::new(id, state.latest_commit);
        state
            .transactions
            .insert(id, WalTransactionInfo::new(snapshot));
        trace!("begin {}", snapshot);
        snapshot
    }

    /// Snapshot of the allocator's virtual transaction, opening it at the
    /// current commit id if it is not open.
    pub fn virtual_snapshot(&self) -> Snapshot {
        let mut state = self.state.lock();
        let latest = state.latest_commit;
        state
            .transactions
            .entry(TransactionId::VIRTUAL)
            .or_insert_with(|| {
                WalTransactionInfo::new(Snapshot::new(TransactionId::VIRTUAL, latest))
            })
            .snapshot
    }

    /// Stores a copy of `page` (with a fresh checksum) for the transaction.
    pub fn save(&self, snapshot: Snapshot, page: &PageBuffer) -> StorageResult<()> {
        let mut copy = page.clone();
        copy.update_checksum();

        let mut state = self.state.lock();
        let is_new = state
            .info_mut(snapshot)?
            .pages
            .insert(copy.handle(), copy)
            .is_none();
        if is_new {
            state.buffered_page_count += 1;
        }
        if state.buffered_page_count >= self.config.buffered_page_limit {
            debug!(
                "buffered page limit reached ({} pages), appending to WAL",
                state.buffered_page_count
            );
            self.append_pages(&mut state, None)?;
        }
        Ok(())
    }

    /// Resolves the version of `handle` visible to `snapshot`.
    ///
    /// Lookup order: the transaction's in-memory pages, its pages already in
    /// the WAL file, the page cache, committed WAL pages, the main file.
    pub fn load(&self, snapshot: Snapshot, handle: PageHandle) -> StorageResult<PageBuffer> {
        let source = {
            let state = self.state.lock();
            let info = state.info(snapshot)?;
            if let Some(page) = info.pages.get(&handle) {
                return Ok(page.clone());
            }
            match info.flushed.get(&handle) {
                Some(&offset) => PageSource::OwnWal(offset),
                None => {
                    let version = state.visible_version(handle, snapshot.latest_commit_id);
                    if let Some(page) = self.cache.get(handle, version.map(|v| v.commit)) {
                        return Ok(page);
                    }
                    match version {
                        Some(version) => PageSource::Committed(version),
                        None => PageSource::MainFile,
                    }
                }
            }
        };

        match source {
            PageSource::OwnWal(offset) => self.read_wal_page(offset),
            PageSource::Committed(version) => {
                let page = self.read_wal_page(version.offset)?;
                self.cache.insert(handle, Some(version.commit), page.clone());
                Ok(page)
            }
            PageSource::MainFile => {
                let page = self.read_main_page(handle)?;
                self.cache.insert(handle, None, page.clone());
                Ok(page)
            }
        }
    }

    pub fn record_allocation(&self, snapshot: Snapshot, handle: PageHandle) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.info_mut(snapshot)?.allocated.insert(handle);
        Ok(())
    }

    pub fn record_deallocation(&self, snapshot: Snapshot, handle: PageHandle) -> StorageResult<()> {
        let mut state = self.state.lock();
        let info = state.info_mut(snapshot)?;
        info.deallocated.insert(handle);
        Ok(())
    }

    /// Handles the transaction freed, sorted.
    pub fn deallocated(&self, snapshot: Snapshot) -> StorageResult<Vec<PageHandle>> {
        let state = self.state.lock();
        let mut handles: Vec<PageHandle> =
            state.info(snapshot)?.deallocated.iter().copied().collect();
        handles.sort();
        Ok(handles)
    }

    /// Handles the transaction has written, buffered or flushed.
    pub fn written_handles(&self, snapshot: Snapshot) -> StorageResult<Vec<PageHandle>> {
        let state = self.state.lock();
        Ok(state.info(snapshot)?.written_handles())
    }

    /// Appends the transaction's pages and a `Commit` record, then publishes
    /// the pages under a new commit id.
    ///
    /// A transaction that wrote nothing is simply closed and keeps the current
    /// commit id.
    pub fn commit(&self, snapshot: Snapshot) -> StorageResult<CommitId> {
        let mut state = self.state.lock();
        state.info(snapshot)?;
        self.commit_locked(&mut state, snapshot.transaction_id)
    }

    fn commit_locked(&self, state: &mut WalState, id: TransactionId) -> StorageResult<CommitId> {
        let read_only = state
            .transactions
            .get(&id)
            .map_or(true, |info| info.is_read_only());
        if read_only {
            state.transactions.remove(&id);
            return Ok(state.latest_commit);
        }

        let commit = state
            .latest_commit
            .next()
            .ok_or(StorageError::MaxWalCommitNumberReached)?;
        self.append_pages(state, Some(id))?;
        self.wal
            .write_at(state.wal_length, &WalRecord::commit(id).encode())?;
        state.wal_length += WAL_RECORD_SIZE as u64;
        if self.config.sync_on_commit {
            self.wal.persist()?;
        }

        if let Some(info) = state.transactions.remove(&id) {
            state.wal_page_count += info.flushed.len();
            for (handle, offset) in info.flushed {
                state
                    .committed
                    .entry(handle)
                    .or_default()
                    .push(CommittedVersion { commit, offset });
            }
        }
        state.latest_commit = commit;
        trace!("{} committed as {}", id, commit);

        if state.wal_page_count >= self.config.checkpoint_page_limit && !state.gate_closed {
            debug!(
                "WAL holds {} committed pages, closing checkpoint gate",
                state.wal_page_count
            );
            state.gate_closed = true;
        }
        Ok(commit)
    }

    /// Discards the transaction and returns the handles it allocated.
    /// Rolling back an unknown or finished transaction returns nothing.
    pub fn rollback(&self, snapshot: Snapshot) -> Vec<PageHandle> {
        let mut state = self.state.lock();
        match state.transactions.remove(&snapshot.transaction_id) {
            Some(info) => {
                state.buffered_page_count -= info.pages.len();
                trace!("rolled back {}", snapshot);
                let mut allocated: Vec<PageHandle> = info.allocated.into_iter().collect();
                allocated.sort();
                allocated
            }
            None => Vec::new(),
        }
    }

    /// Appends buffered pages (of one transaction, or all) to the WAL file.
    fn append_pages(&self, state: &mut WalState, only: Option<TransactionId>) -> StorageResult<()> {
        let mut bytes = Vec::new();
        let mut placed = Vec::new();
        let mut offset = state.wal_length;
        for (id, info) in &state.transactions {
            if only.is_some_and(|only| only != *id) {
                continue;
            }
            let mut handles: Vec<&PageHandle> = info.pages.keys().collect();
            handles.sort();
            for handle in handles {
                bytes.extend_from_slice(&WalRecord::page(*id).encode());
                bytes.extend_from_slice(info.pages[handle].as_bytes());
                placed.push((*id, *handle, offset + WAL_RECORD_SIZE as u64));
                offset += (WAL_RECORD_SIZE + PAGE_SIZE) as u64;
            }
        }
        if placed.is_empty() {
            return Ok(());
        }

        self.wal.write_at(state.wal_length, &bytes)?;
        state.wal_length = offset;
        state.buffered_page_count -= placed.len();
        for (id, handle, page_offset) in placed {
            if let Some(info) = state.transactions.get_mut(&id) {
                info.pages.remove(&handle);
                info.flushed.insert(handle, page_offset);
            }
        }
        Ok(())
    }

    /// Folds committed pages into the main file.
    ///
    /// Does nothing and returns `None` while any real transaction is active.
    /// Otherwise commits the virtual transaction, writes the newest version of
    /// every committed page to the main file, truncates the WAL, opens the
    /// gate and reopens the virtual transaction, returning its new snapshot.
    pub fn checkpoint(&self) -> StorageResult<Option<Snapshot>> {
        let mut state = self.state.lock();
        if state.has_active_transactions() {
            return Ok(None);
        }
        self.commit_locked(&mut state, TransactionId::VIRTUAL)?;

        let mut folded = HashMap::new();
        if !state.committed.is_empty() {
            let mut handles: Vec<PageHandle> = state.committed.keys().copied().collect();
            handles.sort();
            for handle in handles {
                let newest = state.committed[&handle]
                    .last()
                    .copied()
                    .ok_or(StorageError::TransactionDoesNotExist(TransactionId::VIRTUAL.0))?;
                let page = self.read_wal_page(newest.offset)?;
                self.main.write_at(handle.offset(), page.as_bytes())?;
                folded.insert(handle, newest.commit);
            }
            self.main.persist()?;
        }

        if self.wal.len()? > WAL_HEADER_SIZE as u64 {
            self.wal.truncate(WAL_HEADER_SIZE as u64)?;
            self.wal.persist()?;
        }
        state.wal_length = WAL_HEADER_SIZE as u64;
        self.cache.rebase(&folded);
        state.committed.clear();
        state.wal_page_count = 0;
        if state.gate_closed {
            state.gate_closed = false;
            self.gate.notify_all();
        }

        let snapshot = Snapshot::new(TransactionId::VIRTUAL, state.latest_commit);
        state
            .transactions
            .insert(TransactionId::VIRTUAL, WalTransactionInfo::new(snapshot));
        if !folded.is_empty() {
            debug!(
                "checkpoint folded {} pages into the main file at {}",
                folded.len(),
                state.latest_commit
            );
        }
        Ok(Some(snapshot))
    }

    /// Replays the WAL file and checkpoints the recovered commits.
    pub fn restore(&self) -> StorageResult<RecoveryStats> {
        let start = self.state.lock().latest_commit;
        let outcome = recovery::replay(self.wal.as_ref(), start)?;
        {
            let mut state = self.state.lock();
            state.wal_page_count = outcome.stats.pages_restored;
            state.committed = outcome.committed;
            state.latest_commit = outcome.latest_commit;
            state.wal_length = outcome.valid_length;
        }
        self.checkpoint()?;

        let stats = outcome.stats;
        if stats.committed_transactions > 0 || stats.discarded_transactions > 0 {
            info!(
                "WAL restore: {} committed transactions ({} pages) replayed, {} discarded",
                stats.committed_transactions, stats.pages_restored, stats.discarded_transactions
            );
        }
        Ok(stats)
    }

    fn read_wal_page(&self, offset: u64) -> StorageResult<PageBuffer> {
        let mut page = PageBuffer::zeroed();
        self.wal.read_at(offset, page.as_bytes_mut())?;
        page.verified("WAL")
    }

    fn read_main_page(&self, handle: PageHandle) -> StorageResult<PageBuffer> {
        let mut page = PageBuffer::zeroed();
        self.main.read_at(handle.offset(), page.as_bytes_mut())?;
        page.verified("main file")
    }

    /// Grows the main file so it holds `page_count` pages.
    pub fn ensure_main_pages(&self, page_count: u32) -> StorageResult<()> {
        self.main.ensure_len(page_count as u64 * PAGE_SIZE as u64)
    }

    pub fn is_idle(&self) -> bool {
        !self.state.lock().has_active_transactions()
    }

    pub fn is_gate_closed(&self) -> bool {
        self.state.lock().gate_closed
    }

    pub fn latest_commit_id(&self) -> CommitId {
        self.state.lock().latest_commit
    }

    /// Committed page records in the WAL since the last checkpoint.
    pub fn wal_page_count(&self) -> usize {
        self.state.lock().wal_page_count
    }

    /// Real (non-virtual) transactions currently registered.
    pub fn active_transaction_count(&self) -> usize {
        self.state
            .lock()
            .transactions
            .keys()
            .filter(|id| !id.is_virtual())
            .count()
    }
}
