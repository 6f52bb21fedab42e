//! Storage layer.
//!
//! - **disk**: byte-addressable storage for the main file and the WAL
//! - **page**: fixed-size pages and the typed views over them
//! - **wal**: snapshot-isolated page versions, checkpoints and recovery
//! - **allocator**: bitmap page allocation through the WAL's virtual transaction
//!
//! Everything above this layer works with private [`PageBuffer`] copies
//! obtained through a transaction.

pub mod allocator;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use allocator::PageAllocator;
pub use disk::{FileStorage, MemoryStorage, Storage, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{PageBuffer, PageHandle, PageType};
pub use wal::{RecoveryStats, WalBuffer, WalConfig};
