//! Anchor page identifying one B-tree.
//!
//! The anchor keeps a fixed handle while the tree's root node changes through
//! splits and collapses.
//!
//! ```text
//! | page header (9) | root: u32 | first leaf: u32 | last leaf: u32 |
//! | kind: u8 | height: u16 | entry count: u64 |
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::page::{PageHandle, PageType, PAGE_HEADER_SIZE, PAGE_TYPE_OFFSET};

const ROOT_OFFSET: usize = PAGE_HEADER_SIZE;
const FIRST_LEAF_OFFSET: usize = PAGE_HEADER_SIZE + 4;
const LAST_LEAF_OFFSET: usize = PAGE_HEADER_SIZE + 8;
const KIND_OFFSET: usize = PAGE_HEADER_SIZE + 12;
const HEIGHT_OFFSET: usize = PAGE_HEADER_SIZE + 13;
const COUNT_OFFSET: usize = PAGE_HEADER_SIZE + 15;

/// Which page markers a tree's leaves and overflow pages carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeKind {
    /// Secondary indexes and the catalog: `BTreeLeaf` / `BTreeLeafOverflow`.
    Index,
    /// Object records: `Object` / `ObjectOverflow`.
    Object,
}

impl TreeKind {
    pub fn leaf_type(&self) -> PageType {
        match self {
            TreeKind::Index => PageType::BTreeLeaf,
            TreeKind::Object => PageType::Object,
        }
    }

    pub fn overflow_type(&self) -> PageType {
        match self {
            TreeKind::Index => PageType::BTreeLeafOverflow,
            TreeKind::Object => PageType::ObjectOverflow,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => TreeKind::Object,
            _ => TreeKind::Index,
        }
    }

    fn as_u8(&self) -> u8 {
        match self {
            TreeKind::Index => 0,
            TreeKind::Object => 1,
        }
    }
}

pub struct TreeRootPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> TreeRootPage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    /// Current root node, or null for an empty tree.
    pub fn root(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), ROOT_OFFSET)
    }

    pub fn first_leaf(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), FIRST_LEAF_OFFSET)
    }

    pub fn last_leaf(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), LAST_LEAF_OFFSET)
    }

    pub fn kind(&self) -> TreeKind {
        TreeKind::from_u8(self.data.as_ref()[KIND_OFFSET])
    }

    /// Number of levels; zero for an empty tree, one for a single leaf.
    pub fn height(&self) -> u16 {
        LittleEndian::read_u16(&self.data.as_ref()[HEIGHT_OFFSET..HEIGHT_OFFSET + 2])
    }

    pub fn entry_count(&self) -> u64 {
        LittleEndian::read_u64(&self.data.as_ref()[COUNT_OFFSET..COUNT_OFFSET + 8])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TreeRootPage<B> {
    pub fn init(mut data: B, kind: TreeKind) -> Self {
        data.as_mut()[PAGE_TYPE_OFFSET] = PageType::BTreeRoot as u8;
        let mut page = Self { data };
        page.data.as_mut()[KIND_OFFSET] = kind.as_u8();
        page.set_root(PageHandle::NULL);
        page.set_first_leaf(PageHandle::NULL);
        page.set_last_leaf(PageHandle::NULL);
        page.set_height(0);
        page.set_entry_count(0);
        page
    }

    pub fn set_root(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), ROOT_OFFSET);
    }

    pub fn set_first_leaf(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), FIRST_LEAF_OFFSET);
    }

    pub fn set_last_leaf(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), LAST_LEAF_OFFSET);
    }

    pub fn set_height(&mut self, height: u16) {
        LittleEndian::write_u16(
            &mut self.data.as_mut()[HEIGHT_OFFSET..HEIGHT_OFFSET + 2],
            height,
        );
    }

    pub fn set_entry_count(&mut self, count: u64) {
        LittleEndian::write_u64(&mut self.data.as_mut()[COUNT_OFFSET..COUNT_OFFSET + 8], count);
    }
}
