//! Concurrency control.
//!
//! Transactions lock the objects they touch for their whole lifetime; page
//! level isolation comes from WAL snapshots instead of locks.

pub mod lock;

pub use lock::{LockManager, LockMode, LockTarget, ObjectLocks};
