//! B-tree navigation (internal) pages.
//!
//! Layout:
//!
//! ```text
//! | page header (9) | level: u16 | slotted region |
//! ```
//!
//! Each slot maps a separator key to a 4-byte child handle. Every key in a
//! child's subtree is `<=` its separator, except for the last child, which
//! covers everything above the previous separator up to this page's own bound
//! in its parent.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::disk::PAGE_SIZE;
use crate::storage::page::slotted_page::{SlotEntry, SlottedPage, SLOTTED_HEADER_SIZE};
use crate::storage::page::{PageHandle, PageType, PAGE_HEADER_SIZE, PAGE_TYPE_OFFSET};

const LEVEL_OFFSET: usize = PAGE_HEADER_SIZE;
/// Start of the slotted region.
pub const NAVIGATION_SLOTS_BASE: usize = PAGE_HEADER_SIZE + 2;
pub const NAVIGATION_CAPACITY: usize = PAGE_SIZE - NAVIGATION_SLOTS_BASE - SLOTTED_HEADER_SIZE;

pub struct NavigationPage<B> {
    data: B,
}

/// Decodes the child handle stored in a navigation slot.
pub fn child_of(entry: &SlotEntry<'_>) -> PageHandle {
    PageHandle::read(entry.data, 0)
}

impl<B: AsRef<[u8]>> NavigationPage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    /// Height above the leaves; children of a level 1 page are leaves.
    pub fn level(&self) -> u16 {
        LittleEndian::read_u16(&self.data.as_ref()[LEVEL_OFFSET..LEVEL_OFFSET + 2])
    }

    pub fn slots(&self) -> SlottedPage<&[u8]> {
        SlottedPage::new(self.data.as_ref(), NAVIGATION_SLOTS_BASE)
    }

    /// The child covering `key`: the first separator `>= key`, otherwise the
    /// last child.
    pub fn find_child(&self, key: &[u8]) -> Option<PageHandle> {
        let slots = self.slots();
        slots
            .lower_bound(key)
            .or_else(|| slots.last())
            .map(|entry| child_of(&entry))
    }

    /// Separator and child pairs in key order.
    pub fn children(&self) -> Vec<(Vec<u8>, PageHandle)> {
        self.slots()
            .entries()
            .map(|entry| (entry.key.to_vec(), child_of(&entry)))
            .collect()
    }

    pub fn child_count(&self) -> usize {
        self.slots().live_count()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> NavigationPage<B> {
    pub fn init(mut data: B, level: u16) -> Self {
        let bytes = data.as_mut();
        bytes[PAGE_TYPE_OFFSET] = PageType::BTreeNode as u8;
        LittleEndian::write_u16(&mut bytes[LEVEL_OFFSET..LEVEL_OFFSET + 2], level);
        SlottedPage::init(&mut bytes[..], NAVIGATION_SLOTS_BASE);
        Self { data }
    }

    pub fn slots_mut(&mut self) -> SlottedPage<&mut [u8]> {
        SlottedPage::new(self.data.as_mut(), NAVIGATION_SLOTS_BASE)
    }

    /// Adds a separator; fails when the page is full or the separator exists.
    pub fn try_insert(&mut self, separator: &[u8], child: PageHandle) -> bool {
        self.slots_mut()
            .try_insert(separator, &child.0.to_le_bytes(), 0)
    }

    pub fn try_remove(&mut self, separator: &[u8]) -> bool {
        self.slots_mut().try_remove(separator)
    }
}
