//! Random-access storage backing the main database file and the WAL.
//!
//! Everything above this layer addresses storage by byte offset; page
//! arithmetic (handle × [`PAGE_SIZE`]) lives in the WAL buffer and the
//! allocator.

pub mod file_storage;
pub mod memory_storage;

use crate::storage::error::StorageResult;

pub use file_storage::FileStorage;
pub use memory_storage::MemoryStorage;

/// Size of every page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A byte-addressable storage handle.
pub trait Storage: Send + Sync {
    /// Fills `buf` from `offset`. Reading past the end is
    /// [`StorageError::UnexpectedEndOfFile`](crate::storage::error::StorageError::UnexpectedEndOfFile).
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Writes `data` at `offset`, extending the storage if needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Flushes written data to durable media.
    fn persist(&self) -> StorageResult<()>;

    /// Shrinks the storage to `len` bytes. Longer lengths are ignored.
    fn truncate(&self, len: u64) -> StorageResult<()>;

    /// Sets the storage length exactly.
    fn set_len(&self, len: u64) -> StorageResult<()>;

    /// Current length in bytes.
    fn len(&self) -> StorageResult<u64>;

    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Grows the storage to at least `len` bytes.
    fn ensure_len(&self, len: u64) -> StorageResult<()> {
        if self.len()? < len {
            self.set_len(len)?;
        }
        Ok(())
    }
}
