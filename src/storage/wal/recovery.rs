//! WAL replay after a crash.
//!
//! Records are scanned from the header onward. `Page` records are grouped by
//! transaction id until that transaction's `Commit` record appears, at which
//! point the group is published under the next commit id. Groups still open
//! when the scan ends never committed and are discarded.

use std::collections::HashMap;

use log::{debug, warn};

use super::buffer::CommittedVersion;
use super::record::{WalRecord, WalRecordKind, WAL_HEADER_SIZE, WAL_RECORD_SIZE};
use crate::storage::disk::{Storage, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageBuffer, PageHandle};
use crate::transaction::{CommitId, TransactionId};

/// Summary of a WAL replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub committed_transactions: usize,
    /// Transactions with page records but no commit record.
    pub discarded_transactions: usize,
    pub pages_restored: usize,
    /// Whether the WAL ended in a partially written record.
    pub torn_tail: bool,
}

pub(crate) struct ReplayOutcome {
    pub committed: HashMap<PageHandle, Vec<CommittedVersion>>,
    pub latest_commit: CommitId,
    /// End of the last complete record.
    pub valid_length: u64,
    pub stats: RecoveryStats,
}

#[derive(Default)]
struct PendingGroup {
    pages: Vec<(PageHandle, u64)>,
    /// First page image in the group whose checksum did not verify.
    corrupt_at: Option<u64>,
}

/// Scans `wal` and rebuilds the committed page index, numbering commits
/// after `latest_commit`.
///
/// A torn final record ends the scan quietly. So does a complete record that
/// fails its checksum when no commit record follows it anywhere in the file;
/// with a later commit it is fatal, as is a corrupt page image belonging to a
/// transaction that committed.
pub(crate) fn replay(wal: &dyn Storage, mut latest_commit: CommitId) -> StorageResult<ReplayOutcome> {
    let length = wal.len()?;
    let mut offset = WAL_HEADER_SIZE as u64;
    let mut pending: HashMap<TransactionId, PendingGroup> = HashMap::new();
    let mut committed: HashMap<PageHandle, Vec<CommittedVersion>> = HashMap::new();
    let mut stats = RecoveryStats::default();

    while offset < length {
        if offset + WAL_RECORD_SIZE as u64 > length {
            stats.torn_tail = true;
            break;
        }
        let mut header = [0u8; WAL_RECORD_SIZE];
        wal.read_at(offset, &mut header)?;
        let record = match WalRecord::decode(&header) {
            Some(record) => record,
            None if commit_follows(wal, offset, length)? => {
                return Err(StorageError::ChecksumVerificationFailed(format!(
                    "WAL record at offset {}",
                    offset
                )));
            }
            None => {
                // Nothing after this point ever committed.
                warn!("undecodable WAL record at offset {} ends the log", offset);
                stats.torn_tail = true;
                break;
            }
        };

        match record.kind {
            WalRecordKind::Page => {
                let image_offset = offset + WAL_RECORD_SIZE as u64;
                if image_offset + PAGE_SIZE as u64 > length {
                    stats.torn_tail = true;
                    break;
                }
                let mut page = PageBuffer::zeroed();
                wal.read_at(image_offset, page.as_bytes_mut())?;
                let group = pending.entry(record.transaction_id).or_default();
                if page.verify_checksum() {
                    group.pages.push((page.handle(), image_offset));
                } else if group.corrupt_at.is_none() {
                    group.corrupt_at = Some(image_offset);
                }
                offset = image_offset + PAGE_SIZE as u64;
            }
            WalRecordKind::Commit => {
                let group = pending.remove(&record.transaction_id).unwrap_or_default();
                if let Some(corrupt) = group.corrupt_at {
                    return Err(StorageError::ChecksumVerificationFailed(format!(
                        "page image at WAL offset {} committed by {}",
                        corrupt, record.transaction_id
                    )));
                }
                latest_commit = latest_commit
                    .next()
                    .ok_or(StorageError::MaxWalCommitNumberReached)?;
                stats.pages_restored += group.pages.len();
                for (handle, image_offset) in group.pages {
                    committed.entry(handle).or_default().push(CommittedVersion {
                        commit: latest_commit,
                        offset: image_offset,
                    });
                }
                stats.committed_transactions += 1;
                offset += WAL_RECORD_SIZE as u64;
            }
        }
    }

    stats.discarded_transactions = pending.len();
    for (id, group) in &pending {
        warn!(
            "discarding {} uncommitted WAL pages of {}",
            group.pages.len(),
            id
        );
    }
    if stats.torn_tail {
        debug!("WAL ends in a torn record at offset {}", offset);
    }

    Ok(ReplayOutcome {
        committed,
        latest_commit,
        valid_length: offset,
        stats,
    })
}

/// Whether a decodable `Commit` record starts anywhere after `offset`.
fn commit_follows(wal: &dyn Storage, offset: u64, length: u64) -> StorageResult<bool> {
    let start = offset + 1;
    if start + WAL_RECORD_SIZE as u64 > length {
        return Ok(false);
    }
    let mut rest = vec![0u8; (length - start) as usize];
    wal.read_at(start, &mut rest)?;
    Ok(rest.windows(WAL_RECORD_SIZE).any(|window| {
        <&[u8; WAL_RECORD_SIZE]>::try_from(window)
            .ok()
            .and_then(WalRecord::decode)
            .is_some_and(|record| record.kind == WalRecordKind::Commit)
    }))
}
