//! Access layer over transactional pages.
//!
//! - **BTree**: ordered byte-key map anchored at a fixed page
//! - **NormalisedValue**: typed keys encoded so byte order matches value order
//! - **ValueBuffer**: opaque record bytes handed in by callers

pub mod btree;
pub mod normalised;
pub mod value;

pub use btree::{BTree, Cursor, Direction};
pub use normalised::{NormalisedValue, NormalisedValueSpan};
pub use value::{DataType, Value, ValueBuffer};
