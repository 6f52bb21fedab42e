//! Fixed-size pages and the typed views over them.
//!
//! Every page starts with the same nine byte header:
//!
//! ```text
//! | checksum: u32 | handle: u32 | type marker: u8 | type header | payload |
//! ```
//!
//! The CRC32 checksum covers every byte after itself. It is recomputed when a
//! page is saved into the WAL and verified whenever a page is read back from
//! the WAL or the main file.

pub mod allocation_page;
pub mod collection_page;
pub mod leaf_page;
pub mod navigation_page;
pub mod overflow_page;
pub mod root_page;
pub mod slotted_page;
pub mod tree_root_page;

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::storage::disk::PAGE_SIZE;
use crate::storage::error::{StorageError, StorageResult};

pub use allocation_page::AllocationPage;
pub use collection_page::CollectionPage;
pub use leaf_page::LeafPage;
pub use navigation_page::NavigationPage;
pub use overflow_page::OverflowPage;
pub use root_page::RootPage;
pub use slotted_page::{Descriptor, SlotEntry, SlottedPage};
pub use tree_root_page::{TreeKind, TreeRootPage};

pub const CHECKSUM_OFFSET: usize = 0;
pub const HANDLE_OFFSET: usize = 4;
pub const PAGE_TYPE_OFFSET: usize = 8;
/// Size of the header shared by every page type.
pub const PAGE_HEADER_SIZE: usize = 9;

/// Address of a page in the main file. The byte position is
/// `handle * PAGE_SIZE`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PageHandle(pub u32);

impl PageHandle {
    /// Reserved sentinel; permanently marked allocated.
    pub const NULL: PageHandle = PageHandle(0);
    /// The database root page.
    pub const ROOT: PageHandle = PageHandle(1);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Byte position of this page in the main file.
    pub fn offset(&self) -> u64 {
        self.0 as u64 * PAGE_SIZE as u64
    }

    pub(crate) fn read(data: &[u8], offset: usize) -> Self {
        PageHandle(LittleEndian::read_u32(&data[offset..offset + 4]))
    }

    pub(crate) fn write(&self, data: &mut [u8], offset: usize) {
        LittleEndian::write_u32(&mut data[offset..offset + 4], self.0);
    }
}

impl fmt::Display for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page{}", self.0)
    }
}

/// Type marker stored in byte 8 of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    Free = 0,
    Root = 1,
    Allocation = 2,
    Collection = 3,
    BTreeRoot = 4,
    BTreeNode = 5,
    BTreeLeaf = 6,
    BTreeLeafOverflow = 7,
    Object = 8,
    ObjectOverflow = 9,
}

impl PageType {
    pub fn from_u8(marker: u8) -> Option<Self> {
        match marker {
            0 => Some(Self::Free),
            1 => Some(Self::Root),
            2 => Some(Self::Allocation),
            3 => Some(Self::Collection),
            4 => Some(Self::BTreeRoot),
            5 => Some(Self::BTreeNode),
            6 => Some(Self::BTreeLeaf),
            7 => Some(Self::BTreeLeafOverflow),
            8 => Some(Self::Object),
            9 => Some(Self::ObjectOverflow),
            _ => None,
        }
    }
}

/// An owned copy of one page.
///
/// Pages are always handed out as private copies; mutating a buffer has no
/// effect until it is saved back through a transaction.
#[derive(Clone, PartialEq, Eq)]
pub struct PageBuffer {
    data: Box<[u8; PAGE_SIZE]>,
}

impl PageBuffer {
    /// A zeroed page stamped with `handle` and `page_type`.
    pub fn new(handle: PageHandle, page_type: PageType) -> Self {
        let mut page = Self::zeroed();
        page.set_handle(handle);
        page.set_page_type(page_type);
        page
    }

    pub fn zeroed() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Copies a page image. `bytes` must be exactly one page long.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), PAGE_SIZE, "page image must be PAGE_SIZE bytes");
        let mut page = Self::zeroed();
        page.data.copy_from_slice(bytes);
        page
    }

    pub fn handle(&self) -> PageHandle {
        PageHandle::read(&self.data[..], HANDLE_OFFSET)
    }

    pub fn set_handle(&mut self, handle: PageHandle) {
        handle.write(&mut self.data[..], HANDLE_OFFSET);
    }

    pub fn marker(&self) -> u8 {
        self.data[PAGE_TYPE_OFFSET]
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u8(self.marker())
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.data[PAGE_TYPE_OFFSET] = page_type as u8;
    }

    /// Returns the page type, or `InvalidPageType` if the marker is not one of
    /// `expected`.
    pub fn expect_type(&self, expected: &[PageType]) -> StorageResult<PageType> {
        match self.page_type() {
            Some(page_type) if expected.contains(&page_type) => Ok(page_type),
            _ => Err(StorageError::InvalidPageType {
                handle: self.handle(),
                marker: self.marker(),
            }),
        }
    }

    pub fn stored_checksum(&self) -> u32 {
        LittleEndian::read_u32(&self.data[CHECKSUM_OFFSET..HANDLE_OFFSET])
    }

    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.data[HANDLE_OFFSET..])
    }

    pub fn update_checksum(&mut self) {
        let checksum = self.compute_checksum();
        LittleEndian::write_u32(&mut self.data[CHECKSUM_OFFSET..HANDLE_OFFSET], checksum);
    }

    pub fn verify_checksum(&self) -> bool {
        self.stored_checksum() == self.compute_checksum()
    }

    /// Fails with `ChecksumVerificationFailed` unless the stored checksum
    /// matches the contents.
    pub fn verified(self, source: &str) -> StorageResult<Self> {
        if self.verify_checksum() {
            Ok(self)
        } else {
            Err(StorageError::ChecksumVerificationFailed(format!(
                "{} read from {}",
                self.handle(),
                source
            )))
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Dispatches on the type marker to the matching read-only view.
    pub fn view(&self) -> StorageResult<PageView<'_>> {
        let bytes = self.as_bytes();
        let view = match self.page_type() {
            Some(PageType::Free) => PageView::Free,
            Some(PageType::Root) => PageView::Root(RootPage::new(bytes)),
            Some(PageType::Allocation) => PageView::Allocation(AllocationPage::new(bytes)),
            Some(PageType::Collection) => PageView::Collection(CollectionPage::new(bytes)),
            Some(PageType::BTreeRoot) => PageView::TreeRoot(TreeRootPage::new(bytes)),
            Some(PageType::BTreeNode) => PageView::Navigation(NavigationPage::new(bytes)),
            Some(PageType::BTreeLeaf) | Some(PageType::Object) => {
                PageView::Leaf(LeafPage::new(bytes))
            }
            Some(PageType::BTreeLeafOverflow) | Some(PageType::ObjectOverflow) => {
                PageView::Overflow(OverflowPage::new(bytes))
            }
            None => {
                return Err(StorageError::InvalidPageType {
                    handle: self.handle(),
                    marker: self.marker(),
                })
            }
        };
        Ok(view)
    }
}

impl AsRef<[u8]> for PageBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsMut<[u8]> for PageBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_bytes_mut()
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuffer")
            .field("handle", &self.handle())
            .field("marker", &self.marker())
            .field("checksum", &self.stored_checksum())
            .finish()
    }
}

/// Read-only view chosen by a page's type marker.
pub enum PageView<'a> {
    Free,
    Root(RootPage<&'a [u8]>),
    Allocation(AllocationPage<&'a [u8]>),
    Collection(CollectionPage<&'a [u8]>),
    TreeRoot(TreeRootPage<&'a [u8]>),
    Navigation(NavigationPage<&'a [u8]>),
    Leaf(LeafPage<&'a [u8]>),
    Overflow(OverflowPage<&'a [u8]>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields() {
        let page = PageBuffer::new(PageHandle(42), PageType::BTreeLeaf);
        assert_eq!(page.handle(), PageHandle(42));
        assert_eq!(page.page_type(), Some(PageType::BTreeLeaf));
        assert_eq!(PageHandle(3).offset(), 3 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_checksum_detects_flipped_bit() {
        let mut page = PageBuffer::new(PageHandle(7), PageType::Object);
        page.as_bytes_mut()[100] = 0xAB;
        page.update_checksum();
        assert!(page.verify_checksum());

        page.as_bytes_mut()[2000] ^= 0x10;
        assert!(!page.verify_checksum());
        assert!(matches!(
            page.verified("test"),
            Err(StorageError::ChecksumVerificationFailed(_))
        ));
    }

    #[test]
    fn test_view_dispatches_on_marker() {
        let mut page = PageBuffer::new(PageHandle(9), PageType::Object);
        LeafPage::init(&mut page, PageType::Object);
        assert!(matches!(page.view(), Ok(PageView::Leaf(_))));

        let mut page = PageBuffer::new(PageHandle(9), PageType::BTreeNode);
        NavigationPage::init(&mut page, 1);
        assert!(matches!(page.view(), Ok(PageView::Navigation(_))));

        let mut page = PageBuffer::zeroed();
        page.as_bytes_mut()[PAGE_TYPE_OFFSET] = 200;
        assert!(matches!(
            page.view(),
            Err(StorageError::InvalidPageType { marker: 200, .. })
        ));
    }

    #[test]
    fn test_expect_type() {
        let page = PageBuffer::new(PageHandle(5), PageType::Allocation);
        assert!(page.expect_type(&[PageType::Allocation]).is_ok());
        assert!(page.expect_type(&[PageType::Root]).is_err());
    }
}
