//! Overflow pages hold one chunk of an out-of-line byte string.
//!
//! ```text
//! | page header (9) | next: u32 | total length: u32 | chunk length: u32 | chunk |
//! ```
//!
//! The total length is meaningful on the first page of a chain only.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::disk::PAGE_SIZE;
use crate::storage::page::{PageHandle, PageType, PAGE_HEADER_SIZE, PAGE_TYPE_OFFSET};

const NEXT_OFFSET: usize = PAGE_HEADER_SIZE;
const TOTAL_LENGTH_OFFSET: usize = PAGE_HEADER_SIZE + 4;
const CHUNK_LENGTH_OFFSET: usize = PAGE_HEADER_SIZE + 8;
const CHUNK_OFFSET: usize = PAGE_HEADER_SIZE + 12;

/// Bytes of payload each overflow page carries.
pub const OVERFLOW_CHUNK_CAPACITY: usize = PAGE_SIZE - CHUNK_OFFSET;

pub struct OverflowPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> OverflowPage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    pub fn next(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), NEXT_OFFSET)
    }

    pub fn total_length(&self) -> usize {
        let bytes = self.data.as_ref();
        LittleEndian::read_u32(&bytes[TOTAL_LENGTH_OFFSET..TOTAL_LENGTH_OFFSET + 4]) as usize
    }

    pub fn chunk(&self) -> &[u8] {
        let bytes = self.data.as_ref();
        let length =
            LittleEndian::read_u32(&bytes[CHUNK_LENGTH_OFFSET..CHUNK_LENGTH_OFFSET + 4]) as usize;
        &bytes[CHUNK_OFFSET..CHUNK_OFFSET + length.min(OVERFLOW_CHUNK_CAPACITY)]
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> OverflowPage<B> {
    pub fn init(mut data: B, page_type: PageType) -> Self {
        debug_assert!(matches!(
            page_type,
            PageType::BTreeLeafOverflow | PageType::ObjectOverflow
        ));
        data.as_mut()[PAGE_TYPE_OFFSET] = page_type as u8;
        let mut page = Self { data };
        page.set_next(PageHandle::NULL);
        page.set_total_length(0);
        page.set_chunk(&[]);
        page
    }

    pub fn set_next(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), NEXT_OFFSET);
    }

    pub fn set_total_length(&mut self, length: usize) {
        let bytes = self.data.as_mut();
        LittleEndian::write_u32(
            &mut bytes[TOTAL_LENGTH_OFFSET..TOTAL_LENGTH_OFFSET + 4],
            length as u32,
        );
    }

    /// Stores `chunk`, which must fit in [`OVERFLOW_CHUNK_CAPACITY`].
    pub fn set_chunk(&mut self, chunk: &[u8]) {
        assert!(chunk.len() <= OVERFLOW_CHUNK_CAPACITY);
        let bytes = self.data.as_mut();
        LittleEndian::write_u32(
            &mut bytes[CHUNK_LENGTH_OFFSET..CHUNK_LENGTH_OFFSET + 4],
            chunk.len() as u32,
        );
        bytes[CHUNK_OFFSET..CHUNK_OFFSET + chunk.len()].copy_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageBuffer;

    #[test]
    fn test_chunk_fields() {
        let mut buf = PageBuffer::new(PageHandle(30), PageType::ObjectOverflow);
        let mut page = OverflowPage::init(&mut buf, PageType::ObjectOverflow);
        page.set_next(PageHandle(31));
        page.set_total_length(10_000);
        page.set_chunk(&[5u8; OVERFLOW_CHUNK_CAPACITY]);

        let page = OverflowPage::new(buf.as_bytes());
        assert_eq!(page.next(), PageHandle(31));
        assert_eq!(page.total_length(), 10_000);
        assert_eq!(page.chunk().len(), OVERFLOW_CHUNK_CAPACITY);
        assert!(page.chunk().iter().all(|&b| b == 5));
    }
}
