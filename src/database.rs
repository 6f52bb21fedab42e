//! Database entry point.
//!
//! A database is a main page file plus a WAL file next to it, named after the
//! main file with a `-wal` suffix. Opening a database replays the WAL before
//! anything else reads the main file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::concurrency::{LockManager, ObjectLocks};
use crate::storage::disk::{FileStorage, Storage};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::root_page::{DATABASE_MAGIC, DATABASE_VERSION};
use crate::storage::page::{PageHandle, PageType, PageView, RootPage};
use crate::storage::{PageAllocator, RecoveryStats, WalBuffer, WalConfig};
use crate::transaction::{TransactionManager, TransactionOptions, TransactionScope};

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Committed WAL pages after which new transactions wait for a
    /// checkpoint.
    pub checkpoint_page_limit: usize,
    /// Pages buffered in memory before they are appended to the WAL.
    pub buffered_page_limit: usize,
    pub page_cache_capacity: usize,
    /// Upper bound on the main file size in pages.
    pub max_page_count: u32,
    /// Default wait for object locks when a transaction begins.
    pub lock_timeout: Duration,
    pub sync_on_commit: bool,
    /// Checkpoint whenever the last active transaction finishes. When off,
    /// checkpoints run on demand or once the WAL reaches its page limit.
    pub auto_checkpoint: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let wal = WalConfig::default();
        DatabaseConfig {
            checkpoint_page_limit: wal.checkpoint_page_limit,
            buffered_page_limit: wal.buffered_page_limit,
            page_cache_capacity: wal.page_cache_capacity,
            max_page_count: u32::MAX,
            lock_timeout: Duration::from_secs(5),
            sync_on_commit: wal.sync_on_commit,
            auto_checkpoint: true,
        }
    }
}

impl DatabaseConfig {
    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            checkpoint_page_limit: self.checkpoint_page_limit,
            buffered_page_limit: self.buffered_page_limit,
            page_cache_capacity: self.page_cache_capacity,
            sync_on_commit: self.sync_on_commit,
        }
    }
}

/// Path of the WAL file belonging to the main file at `path`.
pub fn wal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}

pub struct Database {
    config: DatabaseConfig,
    wal: Arc<WalBuffer>,
    allocator: Arc<PageAllocator>,
    transactions: Arc<TransactionManager>,
    recovery: RecoveryStats,
}

impl Database {
    /// Creates a new database file and its WAL.
    pub fn create(path: &Path, config: DatabaseConfig) -> StorageResult<Self> {
        if path.exists() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("database file already exists at {}", path.display()),
            )));
        }
        let main = FileStorage::create(path)?;
        PageAllocator::format(&main)?;
        let wal = FileStorage::create(&wal_path(path))?;
        info!("created database at {}", path.display());
        Self::with_storage(Arc::new(main), Arc::new(wal), config)
    }

    /// Opens an existing database, replaying its WAL.
    pub fn open(path: &Path, config: DatabaseConfig) -> StorageResult<Self> {
        if !path.exists() {
            return Err(StorageError::DatabaseDoesNotExist {
                path: path.display().to_string(),
            });
        }
        let main = FileStorage::open(path)?;
        let wal = FileStorage::open_or_create(&wal_path(path))?;
        Self::with_storage(Arc::new(main), Arc::new(wal), config)
    }

    /// Opens a database over arbitrary storage. An empty main storage is
    /// formatted first.
    pub fn with_storage(
        main: Arc<dyn Storage>,
        wal: Arc<dyn Storage>,
        config: DatabaseConfig,
    ) -> StorageResult<Self> {
        Self::with_locks(main, wal, Arc::new(LockManager::new()), config)
    }

    /// Like [`Database::with_storage`], with a caller-supplied lock manager.
    pub fn with_locks(
        main: Arc<dyn Storage>,
        wal: Arc<dyn Storage>,
        locks: Arc<dyn ObjectLocks>,
        config: DatabaseConfig,
    ) -> StorageResult<Self> {
        if main.is_empty()? {
            PageAllocator::format(main.as_ref())?;
        }
        let wal = Arc::new(WalBuffer::open(main, wal, config.wal_config())?);
        let recovery = wal.restore()?;

        let root = wal.load(wal.virtual_snapshot(), PageHandle::ROOT)?;
        root.expect_type(&[PageType::Root])?;
        let view = RootPage::new(&root);
        if view.magic() != DATABASE_MAGIC {
            return Err(StorageError::VersionMismatch {
                what: "database magic",
                expected: DATABASE_MAGIC,
                found: view.magic(),
            });
        }
        if view.version() != DATABASE_VERSION {
            return Err(StorageError::VersionMismatch {
                what: "database version",
                expected: u64::from(DATABASE_VERSION),
                found: u64::from(view.version()),
            });
        }

        let allocator = Arc::new(PageAllocator::new(Arc::clone(&wal), config.max_page_count));
        let transactions = Arc::new(TransactionManager::new(
            Arc::clone(&allocator),
            Arc::clone(&wal),
            locks,
            config.lock_timeout,
            config.auto_checkpoint,
        ));
        debug!("opened database: {:?}", recovery);
        Ok(Self {
            config,
            wal,
            allocator,
            transactions,
            recovery,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// What the WAL replay found when the database was opened.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn allocator(&self) -> &Arc<PageAllocator> {
        &self.allocator
    }

    pub fn begin(&self) -> StorageResult<TransactionScope> {
        self.transactions.begin(TransactionOptions::new())
    }

    pub fn begin_with(&self, options: TransactionOptions) -> StorageResult<TransactionScope> {
        self.transactions.begin(options)
    }

    pub fn catalog(&self) -> StorageResult<Catalog> {
        Ok(Catalog::open(self.allocator.metadata_root()?))
    }

    /// Folds the WAL into the main file. Returns `false` if a transaction is
    /// still active.
    pub fn checkpoint(&self) -> StorageResult<bool> {
        Ok(self.allocator.checkpoint()?.is_some())
    }

    /// Reads every live page through a fresh transaction, checking its
    /// checksum, its recorded handle and its type marker. Returns the number
    /// of pages checked.
    ///
    /// Meant for a quiescent database: pages allocated by transactions that
    /// have not committed yet fail the check.
    pub fn verify(&self) -> StorageResult<usize> {
        let tx = self.begin()?;
        let handles = self.allocator.live_handles()?;
        for &handle in &handles {
            if handle.is_null() {
                continue;
            }
            let page = tx.load(handle)?;
            if page.handle() != handle {
                return Err(StorageError::Corrupted(format!(
                    "page {} records handle {}",
                    handle,
                    page.handle()
                )));
            }
            if matches!(page.view()?, PageView::Free) {
                return Err(StorageError::InvalidPageType {
                    handle,
                    marker: page.marker(),
                });
            }
        }
        tx.commit()?;
        debug!("verified {} pages", handles.len());
        Ok(handles.len().saturating_sub(1))
    }

    pub fn wal(&self) -> &Arc<WalBuffer> {
        &self.wal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_config_defaults_match_wal() {
        let config = DatabaseConfig::default();
        assert_eq!(config.wal_config(), WalConfig::default());
        assert!(config.auto_checkpoint);
    }

    #[test]
    fn test_wal_path() {
        assert_eq!(
            wal_path(Path::new("/tmp/data.leaf")),
            PathBuf::from("/tmp/data.leaf-wal")
        );
    }

    #[test]
    fn test_with_storage_formats_empty_main() {
        let main = Arc::new(MemoryStorage::new());
        let db = Database::with_storage(
            Arc::clone(&main) as Arc<dyn Storage>,
            Arc::new(MemoryStorage::new()),
            DatabaseConfig::default(),
        )
        .unwrap();
        assert_eq!(db.verify().unwrap(), 3);
        assert_eq!(db.recovery_stats(), &RecoveryStats::default());
        assert!(main.len().unwrap() >= 4 * crate::storage::PAGE_SIZE as u64);
    }

    #[test]
    fn test_verify_reports_misplaced_page() {
        let main = MemoryStorage::new();
        PageAllocator::format(&main).unwrap();
        let mut page = crate::storage::PageBuffer::new(PageHandle(9), PageType::BTreeRoot);
        page.update_checksum();
        main.write_at(PageHandle(3).offset(), page.as_bytes()).unwrap();

        let db = Database::with_storage(
            Arc::new(main),
            Arc::new(MemoryStorage::new()),
            DatabaseConfig::default(),
        )
        .unwrap();
        assert!(matches!(db.verify(), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn test_wrong_magic_is_rejected() {
        let main = MemoryStorage::new();
        PageAllocator::format(&main).unwrap();
        let mut root = vec![0u8; crate::storage::PAGE_SIZE];
        main.read_at(PageHandle::ROOT.offset(), &mut root).unwrap();
        let mut page = crate::storage::PageBuffer::from_bytes(&root);
        page.as_bytes_mut()[crate::storage::page::PAGE_HEADER_SIZE] ^= 0xFF;
        page.update_checksum();
        main.write_at(PageHandle::ROOT.offset(), page.as_bytes()).unwrap();

        let result = Database::with_storage(
            Arc::new(main),
            Arc::new(MemoryStorage::new()),
            DatabaseConfig::default(),
        );
        assert!(matches!(result, Err(StorageError::VersionMismatch { .. })));
    }
}
