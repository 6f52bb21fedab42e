//! Allocation bitmap pages.
//!
//! ```text
//! | page header (9) | next: u32 | base handle: u32 | pad | bitmap (u64 words) |
//! ```
//!
//! Bit `i` (least significant first within each little-endian word) tracks
//! handle `base + i`; a set bit means the handle is live.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::disk::PAGE_SIZE;
use crate::storage::page::{PageHandle, PageType, PAGE_HEADER_SIZE, PAGE_TYPE_OFFSET};

const NEXT_OFFSET: usize = PAGE_HEADER_SIZE;
const BASE_OFFSET: usize = PAGE_HEADER_SIZE + 4;
const BITMAP_OFFSET: usize = 24;
const BITMAP_WORDS: usize = (PAGE_SIZE - BITMAP_OFFSET) / 8;

/// Number of handles one bitmap page tracks.
pub const ALLOCATION_BITMAP_PAGE_COUNT: u32 = (BITMAP_WORDS * 64) as u32;

pub struct AllocationPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> AllocationPage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    pub fn next(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), NEXT_OFFSET)
    }

    /// First handle tracked by this page.
    pub fn base(&self) -> PageHandle {
        PageHandle::read(self.data.as_ref(), BASE_OFFSET)
    }

    pub fn covers(&self, handle: PageHandle) -> bool {
        let base = self.base().0;
        handle.0 >= base && handle.0 - base < ALLOCATION_BITMAP_PAGE_COUNT
    }

    fn word(&self, index: usize) -> u64 {
        let at = BITMAP_OFFSET + index * 8;
        LittleEndian::read_u64(&self.data.as_ref()[at..at + 8])
    }

    pub fn is_allocated(&self, handle: PageHandle) -> bool {
        debug_assert!(self.covers(handle));
        let bit = (handle.0 - self.base().0) as usize;
        self.word(bit / 64) & (1u64 << (bit % 64)) != 0
    }

    /// First clear bit whose handle is below `limit`.
    pub fn find_free(&self, limit: PageHandle) -> Option<PageHandle> {
        let base = self.base().0;
        for index in 0..BITMAP_WORDS {
            let word = self.word(index);
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros();
            let candidate = base + index as u32 * 64 + bit;
            return (candidate < limit.0).then_some(PageHandle(candidate));
        }
        None
    }

    /// Live handles tracked by this page.
    pub fn allocated(&self) -> impl Iterator<Item = PageHandle> + '_ {
        let base = self.base().0;
        (0..BITMAP_WORDS).flat_map(move |index| {
            let word = self.word(index);
            (0..64u32)
                .filter(move |&bit| word & (1u64 << bit) != 0)
                .map(move |bit| PageHandle(base + index as u32 * 64 + bit))
        })
    }

    pub fn allocated_count(&self) -> u32 {
        (0..BITMAP_WORDS).map(|i| self.word(i).count_ones()).sum()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> AllocationPage<B> {
    /// Formats an empty bitmap page tracking handles from `base`.
    pub fn init(mut data: B, base: PageHandle) -> Self {
        let bytes = data.as_mut();
        bytes[PAGE_TYPE_OFFSET] = PageType::Allocation as u8;
        PageHandle::NULL.write(bytes, NEXT_OFFSET);
        base.write(bytes, BASE_OFFSET);
        bytes[BITMAP_OFFSET..].fill(0);
        Self { data }
    }

    pub fn set_next(&mut self, handle: PageHandle) {
        handle.write(self.data.as_mut(), NEXT_OFFSET);
    }

    pub fn set_allocated(&mut self, handle: PageHandle, allocated: bool) {
        debug_assert!(self.covers(handle));
        let bit = (handle.0 - self.base().0) as usize;
        let at = BITMAP_OFFSET + (bit / 64) * 8;
        let mask = 1u64 << (bit % 64);
        let bytes = self.data.as_mut();
        let word = LittleEndian::read_u64(&bytes[at..at + 8]);
        let word = if allocated { word | mask } else { word & !mask };
        LittleEndian::write_u64(&mut bytes[at..at + 8], word);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageBuffer;

    #[test]
    fn test_bitmap_capacity() {
        assert_eq!(ALLOCATION_BITMAP_PAGE_COUNT, 509 * 64);
    }

    #[test]
    fn test_find_free_prefers_lowest() {
        let mut buf = PageBuffer::new(PageHandle(2), PageType::Allocation);
        let mut page = AllocationPage::init(&mut buf, PageHandle(0));
        for h in 0..70 {
            page.set_allocated(PageHandle(h), true);
        }
        assert_eq!(page.find_free(PageHandle(100)), Some(PageHandle(70)));
        assert_eq!(page.find_free(PageHandle(70)), None);

        page.set_allocated(PageHandle(5), false);
        assert_eq!(page.find_free(PageHandle(100)), Some(PageHandle(5)));
        assert!(!page.is_allocated(PageHandle(5)));
        assert!(page.is_allocated(PageHandle(6)));
        assert_eq!(page.allocated_count(), 69);
    }

    #[test]
    fn test_base_offset_and_iteration() {
        let mut buf = PageBuffer::new(PageHandle(32_576), PageType::Allocation);
        let mut page = AllocationPage::init(&mut buf, PageHandle(32_576));
        page.set_allocated(PageHandle(32_576), true);
        page.set_allocated(PageHandle(32_700), true);

        assert!(page.covers(PageHandle(32_576)));
        assert!(!page.covers(PageHandle(32_575)));
        assert!(!page.covers(PageHandle(32_576 * 2)));
        let live: Vec<PageHandle> = page.allocated().collect();
        assert_eq!(live, vec![PageHandle(32_576), PageHandle(32_700)]);
        assert_eq!(page.find_free(PageHandle(40_000)), Some(PageHandle(32_577)));
    }
}
