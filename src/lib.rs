//! leafdb: an embedded single-file document storage engine.
//!
//! Pages live in one main file and reach it through a write-ahead log that
//! gives every transaction a consistent snapshot. Objects and indexes are
//! B-trees over slotted pages.
//!
//! ```no_run
//! use std::path::Path;
//! use leafdb::{Database, DatabaseConfig};
//!
//! # fn main() -> leafdb::StorageResult<()> {
//! let db = Database::create(Path::new("data.leaf"), DatabaseConfig::default())?;
//! let tx = db.begin()?;
//! let catalog = db.catalog()?;
//! if let Some(users) = catalog.create_collection(&tx, "users")? {
//!     users.insert(&tx, "alice")?;
//! }
//! tx.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod catalog;
pub mod concurrency;
pub mod database;
pub mod storage;
pub mod transaction;

pub use access::{BTree, Direction, NormalisedValue, Value, ValueBuffer};
pub use catalog::{Catalog, Collection, ObjectId};
pub use database::{Database, DatabaseConfig};
pub use storage::{StorageError, StorageResult};
pub use transaction::{TransactionOptions, TransactionScope};
