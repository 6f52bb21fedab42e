//! Out-of-line storage for B-tree entries.
//!
//! Large values and external-key buckets are written as chains of overflow
//! pages. The first page of a chain records the total length; every page
//! records its own chunk length and the next page of the chain.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::overflow_page::OVERFLOW_CHUNK_CAPACITY;
use crate::storage::page::{OverflowPage, PageBuffer, PageHandle, PageType};
use crate::transaction::TransactionScope;

/// Writes `bytes` to a new chain of `page_type` pages and returns its head.
pub(crate) fn write_chain(
    tx: &TransactionScope,
    page_type: PageType,
    bytes: &[u8],
) -> StorageResult<PageHandle> {
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&bytes[..0]]
    } else {
        bytes.chunks(OVERFLOW_CHUNK_CAPACITY).collect()
    };
    let handles = chunks
        .iter()
        .map(|_| tx.allocate())
        .collect::<StorageResult<Vec<_>>>()?;

    for (index, chunk) in chunks.iter().enumerate() {
        let mut page = PageBuffer::new(handles[index], page_type);
        let mut view = OverflowPage::init(&mut page, page_type);
        view.set_next(handles.get(index + 1).copied().unwrap_or(PageHandle::NULL));
        if index == 0 {
            view.set_total_length(bytes.len());
        }
        view.set_chunk(chunk);
        tx.save(&page)?;
    }
    Ok(handles[0])
}

/// Reads a whole chain back.
pub(crate) fn read_chain(tx: &TransactionScope, head: PageHandle) -> StorageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut expected = None;
    let mut current = head;
    while !current.is_null() {
        let page = tx.load(current)?;
        page.expect_type(&[PageType::BTreeLeafOverflow, PageType::ObjectOverflow])?;
        let view = OverflowPage::new(&page);
        if expected.is_none() {
            expected = Some(view.total_length());
            bytes.reserve(view.total_length());
        }
        bytes.extend_from_slice(view.chunk());
        current = view.next();
    }
    debug_assert_eq!(Some(bytes.len()), expected, "overflow chain length mismatch");
    Ok(bytes)
}

/// Every page handle of a chain, head first.
pub(crate) fn chain_pages(tx: &TransactionScope, head: PageHandle) -> StorageResult<Vec<PageHandle>> {
    let mut handles = Vec::new();
    let mut current = head;
    while !current.is_null() {
        handles.push(current);
        current = OverflowPage::new(&tx.load(current)?).next();
    }
    Ok(handles)
}

/// Deallocates every page of a chain.
pub(crate) fn free_chain(tx: &TransactionScope, head: PageHandle) -> StorageResult<()> {
    for handle in chain_pages(tx, head)? {
        tx.deallocate(handle)?;
    }
    Ok(())
}

/// Every external key sharing one inline prefix, with its value.
///
/// ```text
/// | count: u32 | (suffix length: u32 | suffix | value length: u32 | value)* |
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Bucket {
    /// Sorted by suffix.
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Bucket {
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let mut cursor = 0usize;
        let count = LittleEndian::read_u32(take(bytes, &mut cursor, 4)?) as usize;
        let mut entries = Vec::with_capacity(count.min(bytes.len()));
        for _ in 0..count {
            let suffix_length = LittleEndian::read_u32(take(bytes, &mut cursor, 4)?) as usize;
            let suffix = take(bytes, &mut cursor, suffix_length)?.to_vec();
            let value_length = LittleEndian::read_u32(take(bytes, &mut cursor, 4)?) as usize;
            let value = take(bytes, &mut cursor, value_length)?.to_vec();
            entries.push((suffix, value));
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let size: usize = 4 + self
            .entries
            .iter()
            .map(|(suffix, value)| 8 + suffix.len() + value.len())
            .sum::<usize>();
        let mut bytes = vec![0u8; size];
        LittleEndian::write_u32(&mut bytes[0..4], self.entries.len() as u32);
        let mut at = 4;
        for (suffix, value) in &self.entries {
            for part in [suffix, value] {
                LittleEndian::write_u32(&mut bytes[at..at + 4], part.len() as u32);
                bytes[at + 4..at + 4 + part.len()].copy_from_slice(part);
                at += 4 + part.len();
            }
        }
        bytes
    }

    pub fn get(&self, suffix: &[u8]) -> Option<&[u8]> {
        self.position(suffix)
            .ok()
            .map(|index| self.entries[index].1.as_slice())
    }

    /// Adds an entry; `false` if the suffix is already present.
    pub fn insert(&mut self, suffix: &[u8], value: &[u8]) -> bool {
        match self.position(suffix) {
            Ok(_) => false,
            Err(index) => {
                self.entries.insert(index, (suffix.to_vec(), value.to_vec()));
                true
            }
        }
    }

    /// Replaces the value of an existing entry.
    pub fn update(&mut self, suffix: &[u8], value: &[u8]) -> bool {
        match self.position(suffix) {
            Ok(index) => {
                self.entries[index].1 = value.to_vec();
                true
            }
            Err(_) => false,
        }
    }

    pub fn remove(&mut self, suffix: &[u8]) -> bool {
        match self.position(suffix) {
            Ok(index) => {
                self.entries.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    fn position(&self, suffix: &[u8]) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|(existing, _)| existing.as_slice().cmp(suffix))
    }
}

fn take<'a>(bytes: &'a [u8], cursor: &mut usize, length: usize) -> StorageResult<&'a [u8]> {
    let end = cursor
        .checked_add(length)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| StorageError::Corrupted("external key bucket".into()))?;
    let slice = &bytes[*cursor..end];
    *cursor = end;
    Ok(slice)
}
