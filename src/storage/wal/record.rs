//! WAL file header and record framing.
//!
//! ```text
//! header: | file magic: u64 | wal magic: u64 | version: u32 |
//! record: | checksum: u32 | transaction id: i64 | marker: u8 |
//! ```
//!
//! A `Page` record is immediately followed by a full page image, which
//! carries its own checksum. A `Commit` record stands alone. The record
//! checksum is a CRC32 over the transaction id and marker.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::root_page::DATABASE_MAGIC;
use crate::transaction::TransactionId;

/// Tags the WAL as belonging to a leafdb database.
pub const WAL_FILE_MAGIC: u64 = DATABASE_MAGIC;
/// Identifies the WAL format ("WAL" + format family).
pub const WAL_MAGIC: u64 = 0x0057_414C_0000_0001;
pub const WAL_VERSION: u32 = 1;

pub const WAL_HEADER_SIZE: usize = 20;
pub const WAL_RECORD_SIZE: usize = 13;

/// Encodes the WAL header.
pub fn encode_header() -> [u8; WAL_HEADER_SIZE] {
    let mut bytes = [0u8; WAL_HEADER_SIZE];
    LittleEndian::write_u64(&mut bytes[0..8], WAL_FILE_MAGIC);
    LittleEndian::write_u64(&mut bytes[8..16], WAL_MAGIC);
    LittleEndian::write_u32(&mut bytes[16..20], WAL_VERSION);
    bytes
}

/// Checks magic numbers and version of an existing WAL header.
pub fn verify_header(bytes: &[u8; WAL_HEADER_SIZE]) -> StorageResult<()> {
    let file_magic = LittleEndian::read_u64(&bytes[0..8]);
    if file_magic != WAL_FILE_MAGIC {
        return Err(StorageError::VersionMismatch {
            what: "WAL file magic",
            expected: WAL_FILE_MAGIC,
            found: file_magic,
        });
    }
    let wal_magic = LittleEndian::read_u64(&bytes[8..16]);
    if wal_magic != WAL_MAGIC {
        return Err(StorageError::VersionMismatch {
            what: "WAL magic",
            expected: WAL_MAGIC,
            found: wal_magic,
        });
    }
    let version = LittleEndian::read_u32(&bytes[16..20]);
    if version != WAL_VERSION {
        return Err(StorageError::VersionMismatch {
            what: "WAL version",
            expected: WAL_VERSION as u64,
            found: version as u64,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordKind {
    Page = 1,
    Commit = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalRecord {
    pub transaction_id: TransactionId,
    pub kind: WalRecordKind,
}

impl WalRecord {
    pub fn page(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            kind: WalRecordKind::Page,
        }
    }

    pub fn commit(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            kind: WalRecordKind::Commit,
        }
    }

    pub fn encode(&self) -> [u8; WAL_RECORD_SIZE] {
        let mut bytes = [0u8; WAL_RECORD_SIZE];
        LittleEndian::write_i64(&mut bytes[4..12], self.transaction_id.0);
        bytes[12] = self.kind as u8;
        let checksum = crc32fast::hash(&bytes[4..]);
        LittleEndian::write_u32(&mut bytes[0..4], checksum);
        bytes
    }

    /// Decodes a record, returning `None` if its checksum or marker is
    /// invalid.
    pub fn decode(bytes: &[u8; WAL_RECORD_SIZE]) -> Option<Self> {
        if LittleEndian::read_u32(&bytes[0..4]) != crc32fast::hash(&bytes[4..]) {
            return None;
        }
        let kind = match bytes[12] {
            1 => WalRecordKind::Page,
            2 => WalRecordKind::Commit,
            _ => return None,
        };
        Some(Self {
            transaction_id: TransactionId(LittleEndian::read_i64(&bytes[4..12])),
            kind,
        })
    }
}

impl fmt::Display for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.transaction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let bytes = WalRecord::page(TransactionId(5)).encode();
        assert_eq!(&bytes[4..12], &5i64.to_le_bytes());
        assert_eq!(bytes[12], WalRecordKind::Page as u8);

        let virtual_commit = WalRecord::commit(TransactionId::VIRTUAL);
        assert_eq!(WalRecord::decode(&virtual_commit.encode()), Some(virtual_commit));
    }

    #[test]
    fn test_record_checksum_detects_corruption() {
        let mut bytes = WalRecord::commit(TransactionId(9)).encode();
        bytes[6] ^= 0x01;
        assert_eq!(WalRecord::decode(&bytes), None);

        let mut bytes = WalRecord::commit(TransactionId(9)).encode();
        bytes[0] ^= 0x80;
        assert_eq!(WalRecord::decode(&bytes), None);
    }

    #[test]
    fn test_header_verification() {
        let header = encode_header();
        assert!(verify_header(&header).is_ok());

        let mut bad = header;
        bad[16] = 2;
        assert!(matches!(
            verify_header(&bad),
            Err(StorageError::VersionMismatch {
                what: "WAL version",
                ..
            })
        ));

        let mut bad = header;
        bad[0] ^= 0xFF;
        assert!(matches!(
            verify_header(&bad),
            Err(StorageError::VersionMismatch { .. })
        ));
    }
}
