//! B-tree leaf pages.
//!
//! Layout:
//!
//! ```text
//! | page header (9) | previous: u32 | next: u32 | slotted region |
//! ```
//!
//! Leaves of index trees carry the `BTreeLeaf` marker; leaves of object
//! trees carry `Object`. Both share this layout. Slot data is either the
//! inline value or, when a flag is set, a pointer to an overflow chain.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::page::slotted_page::{SlottedPage, SLOTTED_HEADER_SIZE};
use crate::storage::page::{PageHandle, PageType, PAGE_HEADER_SIZE, PAGE_TYPE_OFFSET};

const PREVIOUS_OFFSET: usize = PAGE_HEADER_SIZE;
const NEXT_OFFSET: usize = PAGE_HEADER_SIZE + 4;
/// Start of the slotted region.
pub const LEAF_SLOTS_BASE: usize = PAGE_HEADER_SIZE + 8;

/// Slot flag: the slot key is an inline prefix followed by `0xFF` and the data
/// is the head of an overflow chain holding every external key with that
/// prefix.
pub const EXTERNAL_KEYS: u8 = 0x01;
/// Slot flag: the data is a [`ChunkPointer`] to an overflow chain holding
/// the value.
pub const CHUNKED: u8 = 0x02;

/// Pointer to a chunked value stored as an overflow chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPointer {
    pub length: u32,
    pub head: PageHandle,
}

impl ChunkPointer {
    pub const SIZE: usize = 8;

    pub fn decode(data: &[u8]) -> Self {
        Self {
            length: LittleEndian::read_u32(&data[0..4]),
            head: PageHandle::read(data, 4),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.length);
        self.head.write(&mut bytes, 4);
        bytes
    }
}

pub struct LeafPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> LeafPage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    pub fn handle(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), 4)
    }

    pub fn previous(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), PREVIOUS_OFFSET)
    }

    pub fn next(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), NEXT_OFFSET)
    }

    pub fn slots(&self) -> SlottedPage<&[u8]> {
        SlottedPage::new(self.data.as_ref(), LEAF_SLOTS_BASE)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> LeafPage<B> {
    /// Formats an empty, unlinked leaf.
    pub fn init(mut data: B, page_type: PageType) -> Self {
        debug_assert!(matches!(page_type, PageType::BTreeLeaf | PageType::Object));
        let bytes = data.as_mut();
        bytes[PAGE_TYPE_OFFSET] = page_type as u8;
        PageHandle::NULL.write(bytes, PREVIOUS_OFFSET);
        PageHandle::NULL.write(bytes, NEXT_OFFSET);
        SlottedPage::init(&mut bytes[..], LEAF_SLOTS_BASE);
        Self { data }
    }

    pub fn set_previous(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), PREVIOUS_OFFSET);
    }

    pub fn set_next(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), NEXT_OFFSET);
    }

    pub fn slots_mut(&mut self) -> SlottedPage<&mut [u8]> {
        SlottedPage::new(self.data.as_mut(), LEAF_SLOTS_BASE)
    }
}

/// Usable bytes of a leaf's slotted region.
pub const LEAF_CAPACITY: usize =
    crate::storage::disk::PAGE_SIZE - LEAF_SLOTS_BASE - SLOTTED_HEADER_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageBuffer;

    #[test]
    fn test_leaf_links_and_slots() {
        let mut buf = PageBuffer::new(PageHandle(12), PageType::BTreeLeaf);
        let mut leaf = LeafPage::init(&mut buf, PageType::BTreeLeaf);
        assert!(leaf.previous().is_null());
        assert!(leaf.next().is_null());

        leaf.set_previous(PageHandle(3));
        leaf.set_next(PageHandle(44));
        assert!(leaf.slots_mut().try_insert(b"k1", b"v1", 0));
        assert!(leaf.slots_mut().try_insert(b"k0", b"v0", CHUNKED));

        let leaf = LeafPage::new(buf.as_bytes());
        assert_eq!(leaf.handle(), PageHandle(12));
        assert_eq!(leaf.previous(), PageHandle(3));
        assert_eq!(leaf.next(), PageHandle(44));
        assert_eq!(leaf.slots().capacity(), LEAF_CAPACITY);
        let slots = leaf.slots();
        let keys: Vec<&[u8]> = slots.keys().collect();
        assert_eq!(keys, vec![&b"k0"[..], b"k1"]);
        assert_eq!(leaf.slots().try_get_flags(b"k0"), Some(CHUNKED));
    }

    #[test]
    fn test_chunk_pointer_layout() {
        let pointer = ChunkPointer {
            length: 70_000,
            head: PageHandle(99),
        };
        let bytes = pointer.encode();
        assert_eq!(&bytes[4..8], &99u32.to_le_bytes());
        assert_eq!(ChunkPointer::decode(&bytes), pointer);
    }
}
