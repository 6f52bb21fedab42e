//! Collection pages.
//!
//! ```text
//! | page header (9) | object tree anchor: u32 | next object id: u64 | slotted region |
//! ```
//!
//! The slotted region maps index names to index tree anchors.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::page::slotted_page::SlottedPage;
use crate::storage::page::{PageHandle, PageType, PAGE_HEADER_SIZE, PAGE_TYPE_OFFSET};

const OBJECTS_OFFSET: usize = PAGE_HEADER_SIZE;
const NEXT_OBJECT_ID_OFFSET: usize = PAGE_HEADER_SIZE + 4;
const INDEX_SLOTS_BASE: usize = PAGE_HEADER_SIZE + 12;

pub struct CollectionPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> CollectionPage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    pub fn objects(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), OBJECTS_OFFSET)
    }

    pub fn next_object_id(&self) -> u64 {
        let bytes = self.data.as_ref();
        LittleEndian::read_u64(&bytes[NEXT_OBJECT_ID_OFFSET..NEXT_OBJECT_ID_OFFSET + 8])
    }

    pub fn index(&self, name: &str) -> Option<PageHandle> {
        let slots = SlottedPage::new(self.data.as_ref(), INDEX_SLOTS_BASE);
        slots
            .try_read(name.as_bytes())
            .map(|data| PageHandle::read(data, 0))
    }

    pub fn indexes(&self) -> Vec<(String, PageHandle)> {
        SlottedPage::new(self.data.as_ref(), INDEX_SLOTS_BASE)
            .entries()
            .map(|entry| {
                (
                    String::from_utf8_lossy(entry.key).into_owned(),
                    PageHandle::read(entry.data, 0),
                )
            })
            .collect()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> CollectionPage<B> {
    pub fn init(mut data: B, objects: PageHandle) -> Self {
        let bytes = data.as_mut();
        bytes[PAGE_TYPE_OFFSET] = PageType::Collection as u8;
        objects.write(bytes, OBJECTS_OFFSET);
        SlottedPage::init(&mut bytes[..], INDEX_SLOTS_BASE);
        let mut page = Self { data };
        page.set_next_object_id(1);
        page
    }

    pub fn set_next_object_id(&mut self, id: u64) {
        let bytes = self.data.as_mut();
        LittleEndian::write_u64(
            &mut bytes[NEXT_OBJECT_ID_OFFSET..NEXT_OBJECT_ID_OFFSET + 8],
            id,
        );
    }

    pub fn try_add_index(&mut self, name: &str, anchor: PageHandle) -> bool {
        let mut slots = SlottedPage::new(self.data.as_mut(), INDEX_SLOTS_BASE);
        slots.try_insert(name.as_bytes(), &anchor.0.to_le_bytes(), 0)
    }

    pub fn try_remove_index(&mut self, name: &str) -> bool {
        SlottedPage::new(self.data.as_mut(), INDEX_SLOTS_BASE).try_remove(name.as_bytes())
    }
}
