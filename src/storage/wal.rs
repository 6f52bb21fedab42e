//! Write-ahead log.
//!
//! Page images are appended to a separate WAL file and published by commit
//! records. The main file only changes during a checkpoint, so a crash at any
//! point leaves either the old or the new committed state recoverable.

pub mod buffer;
pub mod page_cache;
pub mod record;
pub mod recovery;
pub mod transaction_info;

pub use buffer::{WalBuffer, WalConfig};
pub use recovery::RecoveryStats;
pub use record::{WalRecord, WalRecordKind, WAL_HEADER_SIZE, WAL_RECORD_SIZE};
