//! The database root page (handle 1).
//!
//! ```text
//! | page header (9) | magic: u64 | version: u32 | next available: u32 |
//! | allocation head: u32 | allocation tail: u32 | metadata root: u32 |
//! ```
//!
//! Only the allocator mutates this page, under its own lock.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::page::{PageHandle, PageType, PAGE_HEADER_SIZE, PAGE_TYPE_OFFSET};

const MAGIC_OFFSET: usize = PAGE_HEADER_SIZE;
const VERSION_OFFSET: usize = PAGE_HEADER_SIZE + 8;
const NEXT_AVAILABLE_OFFSET: usize = PAGE_HEADER_SIZE + 12;
const ALLOCATION_HEAD_OFFSET: usize = PAGE_HEADER_SIZE + 16;
const ALLOCATION_TAIL_OFFSET: usize = PAGE_HEADER_SIZE + 20;
const METADATA_ROOT_OFFSET: usize = PAGE_HEADER_SIZE + 24;

/// Identifies a leafdb main file ("LEAFDB" + format family).
pub const DATABASE_MAGIC: u64 = 0x4C45_4146_4442_0001;
/// Page format version.
pub const DATABASE_VERSION: u32 = 1;

pub struct RootPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> RootPage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.data.as_ref()[offset..offset + 4])
    }

    pub fn magic(&self) -> u64 {
        LittleEndian::read_u64(&self.data.as_ref()[MAGIC_OFFSET..MAGIC_OFFSET + 8])
    }

    pub fn version(&self) -> u32 {
        self.read_u32(VERSION_OFFSET)
    }

    /// Lowest handle never handed out; the file holds at least this many
    /// pages.
    pub fn next_available(&self) -> PageHandle {
        PageHandle(self.read_u32(NEXT_AVAILABLE_OFFSET))
    }

    pub fn allocation_head(&self) -> PageHandle {
        PageHandle(self.read_u32(ALLOCATION_HEAD_OFFSET))
    }

    pub fn allocation_tail(&self) -> PageHandle {
        PageHandle(self.read_u32(ALLOCATION_TAIL_OFFSET))
    }

    /// Anchor of the collection catalog tree.
    pub fn metadata_root(&self) -> PageHandle {
        PageHandle(self.read_u32(METADATA_ROOT_OFFSET))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> RootPage<B> {
    pub fn init(mut data: B) -> Self {
        data.as_mut()[PAGE_TYPE_OFFSET] = PageType::Root as u8;
        LittleEndian::write_u64(
            &mut data.as_mut()[MAGIC_OFFSET..MAGIC_OFFSET + 8],
            DATABASE_MAGIC,
        );
        LittleEndian::write_u32(
            &mut data.as_mut()[VERSION_OFFSET..VERSION_OFFSET + 4],
            DATABASE_VERSION,
        );
        Self { data }
    }

    pub fn set_next_available(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), NEXT_AVAILABLE_OFFSET);
    }

    pub fn set_allocation_head(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), ALLOCATION_HEAD_OFFSET);
    }

    pub fn set_allocation_tail(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), ALLOCATION_TAIL_OFFSET);
    }

    pub fn set_metadata_root(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), METADATA_ROOT_OFFSET);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageBuffer;

    #[test]
    fn test_root_fields() {
        let mut buf = PageBuffer::new(PageHandle::ROOT, PageType::Root);
        let mut root = RootPage::init(&mut buf);
        root.set_next_available(PageHandle(4));
        root.set_allocation_head(PageHandle(2));
        root.set_allocation_tail(PageHandle(2));
        root.set_metadata_root(PageHandle(3));

        let root = RootPage::new(buf.as_bytes());
        assert_eq!(root.magic(), DATABASE_MAGIC);
        assert_eq!(root.version(), DATABASE_VERSION);
        assert_eq!(root.next_available(), PageHandle(4));
        assert_eq!(root.allocation_head(), PageHandle(2));
        assert_eq!(root.allocation_tail(), PageHandle(2));
        assert_eq!(root.metadata_root(), PageHandle(3));
    }
}
