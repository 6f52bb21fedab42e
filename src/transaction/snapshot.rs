use std::fmt;

use serde::{Deserialize, Serialize};

use super::id::{CommitId, TransactionId};

/// The WAL version a transaction observes, fixed for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot {
    pub transaction_id: TransactionId,
    pub latest_commit_id: CommitId,
}

impl Snapshot {
    pub fn new(transaction_id: TransactionId, latest_commit_id: CommitId) -> Self {
        Self {
            transaction_id,
            latest_commit_id,
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.transaction_id.is_virtual()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.transaction_id, self.latest_commit_id)
    }
}
