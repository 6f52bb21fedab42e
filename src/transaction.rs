//! Transactions.
//!
//! A transaction reads pages as of the snapshot it began with and publishes
//! everything it saved atomically on commit. At most one transaction is
//! active per thread; its [`TransactionScope`] rolls it back when dropped.

pub mod id;
pub mod manager;
pub mod scope;
pub mod snapshot;

pub use id::{CommitId, TransactionId, TransactionIdGenerator};
pub use manager::{TransactionManager, TransactionOptions};
pub use scope::TransactionScope;
pub use snapshot::Snapshot;
