//! Variable-length keyed slots packed into the tail of a page.
//!
//! A slotted region starts at a caller-chosen `base` offset (after the page's
//! type-specific header) and runs to the end of the page:
//!
//! ```text
//! base
//!  | header (9) | descriptors -> ...  virgin space  ... <- slot data |
//!                                                                  PAGE_SIZE
//! ```
//!
//! Header layout (all little-endian):
//!
//! ```text
//! | payload offset: u16 | total free space: u16 | first slot offset: u16 |
//! | slot count: u16 | flags: u8 |
//! ```
//!
//! Descriptors are kept sorted by key; each slot holds the key bytes followed
//! by the data bytes and then any trailing free space. Removing an entry only
//! marks its descriptor as garbage; the bytes are reclaimed by reuse or by
//! [`SlottedPage::compact`].

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::disk::PAGE_SIZE;

const PAYLOAD_OFFSET: usize = 0;
const TOTAL_FREE_SPACE_OFFSET: usize = 2;
const FIRST_SLOT_OFFSET: usize = 4;
const SLOT_COUNT_OFFSET: usize = 6;
const FLAGS_OFFSET: usize = 8;
pub const SLOTTED_HEADER_SIZE: usize = 9;

pub const DESCRIPTOR_SIZE: usize = 8;

const CAN_COMPACT: u8 = 0x01;

/// Slot metadata bit-packed into a little-endian `u64`, least significant
/// bits first:
///
/// | bits    | field              |
/// |---------|--------------------|
/// | 0..13   | offset             |
/// | 13..26  | length             |
/// | 26..39  | key length         |
/// | 39..52  | free space length  |
/// | 52..60  | flags              |
/// | 60      | garbage            |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor(u64);

impl Descriptor {
    const FIELD_BITS: u32 = 13;
    const FIELD_MASK: u64 = (1 << Self::FIELD_BITS) - 1;
    const OFFSET_SHIFT: u32 = 0;
    const LENGTH_SHIFT: u32 = 13;
    const KEY_LENGTH_SHIFT: u32 = 26;
    const FREE_SPACE_SHIFT: u32 = 39;
    const FLAGS_SHIFT: u32 = 52;
    const GARBAGE_SHIFT: u32 = 60;

    /// Largest value any length field can hold.
    pub const MAX_FIELD: usize = Self::FIELD_MASK as usize;

    pub fn new(offset: usize, length: usize, key_length: usize, free_space: usize, flags: u8) -> Self {
        let mut descriptor = Descriptor(0);
        descriptor.set_offset(offset);
        descriptor.set_length(length);
        descriptor.set_key_length(key_length);
        descriptor.set_free_space(free_space);
        descriptor.set_flags(flags);
        descriptor
    }

    pub fn from_bits(bits: u64) -> Self {
        Descriptor(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    fn field(&self, shift: u32) -> usize {
        ((self.0 >> shift) & Self::FIELD_MASK) as usize
    }

    fn set_field(&mut self, shift: u32, value: usize) {
        debug_assert!(value <= Self::MAX_FIELD, "descriptor field overflow: {}", value);
        self.0 = (self.0 & !(Self::FIELD_MASK << shift)) | ((value as u64 & Self::FIELD_MASK) << shift);
    }

    pub fn offset(&self) -> usize {
        self.field(Self::OFFSET_SHIFT)
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.set_field(Self::OFFSET_SHIFT, offset);
    }

    /// Total slot length: key, data and trailing free space.
    pub fn length(&self) -> usize {
        self.field(Self::LENGTH_SHIFT)
    }

    pub fn set_length(&mut self, length: usize) {
        self.set_field(Self::LENGTH_SHIFT, length);
    }

    pub fn key_length(&self) -> usize {
        self.field(Self::KEY_LENGTH_SHIFT)
    }

    pub fn set_key_length(&mut self, key_length: usize) {
        self.set_field(Self::KEY_LENGTH_SHIFT, key_length);
    }

    pub fn free_space(&self) -> usize {
        self.field(Self::FREE_SPACE_SHIFT)
    }

    pub fn set_free_space(&mut self, free_space: usize) {
        self.set_field(Self::FREE_SPACE_SHIFT, free_space);
    }

    pub fn data_length(&self) -> usize {
        self.length() - self.key_length() - self.free_space()
    }

    pub fn flags(&self) -> u8 {
        ((self.0 >> Self::FLAGS_SHIFT) & 0xFF) as u8
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.0 = (self.0 & !(0xFF << Self::FLAGS_SHIFT)) | ((flags as u64) << Self::FLAGS_SHIFT);
    }

    pub fn is_garbage(&self) -> bool {
        (self.0 >> Self::GARBAGE_SHIFT) & 1 == 1
    }

    pub fn set_garbage(&mut self, garbage: bool) {
        if garbage {
            self.0 |= 1 << Self::GARBAGE_SHIFT;
        } else {
            self.0 &= !(1 << Self::GARBAGE_SHIFT);
        }
    }
}

/// A live entry borrowed from a slotted page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry<'a> {
    pub key: &'a [u8],
    pub data: &'a [u8],
    pub flags: u8,
}

/// An entry copied out of a page, used when moving entries between pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedSlot {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub flags: u8,
}

impl SlotEntry<'_> {
    pub fn to_owned(&self) -> OwnedSlot {
        OwnedSlot {
            key: self.key.to_vec(),
            data: self.data.to_vec(),
            flags: self.flags,
        }
    }

    /// Bytes this entry occupies including its descriptor.
    pub fn footprint(&self) -> usize {
        DESCRIPTOR_SIZE + self.key.len() + self.data.len()
    }
}

impl OwnedSlot {
    pub fn footprint(&self) -> usize {
        DESCRIPTOR_SIZE + self.key.len() + self.data.len()
    }
}

/// Slotted view over a page image.
///
/// `B` is `&[u8]` for read-only access or `&mut [u8]` (or a mutable page
/// buffer) for updates.
pub struct SlottedPage<B> {
    data: B,
    base: usize,
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    /// Views an already initialised slotted region at `base`.
    pub fn new(data: B, base: usize) -> Self {
        debug_assert_eq!(data.as_ref().len(), PAGE_SIZE);
        Self { data, base }
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn header_u16(&self, field: usize) -> usize {
        let at = self.base + field;
        LittleEndian::read_u16(&self.bytes()[at..at + 2]) as usize
    }

    /// Absolute offset of the first descriptor.
    pub fn payload_offset(&self) -> usize {
        self.header_u16(PAYLOAD_OFFSET)
    }

    /// Bytes available to new entries (descriptor and slot) once the page is
    /// compacted.
    pub fn total_free_space(&self) -> usize {
        self.header_u16(TOTAL_FREE_SPACE_OFFSET)
    }

    /// Lowest offset occupied by slot data.
    pub fn first_slot_offset(&self) -> usize {
        self.header_u16(FIRST_SLOT_OFFSET)
    }

    /// Number of descriptors, garbage included.
    pub fn slot_count(&self) -> usize {
        self.header_u16(SLOT_COUNT_OFFSET)
    }

    pub fn can_compact(&self) -> bool {
        self.bytes()[self.base + FLAGS_OFFSET] & CAN_COMPACT != 0
    }

    pub fn capacity(&self) -> usize {
        PAGE_SIZE - self.payload_offset()
    }

    pub fn used_space(&self) -> usize {
        self.capacity() - self.total_free_space()
    }

    pub fn unoccupied_percentage(&self) -> f64 {
        self.total_free_space() as f64 / self.capacity() as f64
    }

    pub fn is_underflowed(&self) -> bool {
        self.unoccupied_percentage() > 0.5
    }

    fn virgin_space(&self) -> usize {
        let descriptors_end = self.payload_offset() + self.slot_count() * DESCRIPTOR_SIZE;
        self.first_slot_offset().saturating_sub(descriptors_end)
    }

    fn descriptor_position(&self, index: usize) -> usize {
        self.payload_offset() + index * DESCRIPTOR_SIZE
    }

    pub fn descriptor(&self, index: usize) -> Descriptor {
        let at = self.descriptor_position(index);
        Descriptor::from_bits(LittleEndian::read_u64(&self.bytes()[at..at + DESCRIPTOR_SIZE]))
    }

    fn key_of(&self, descriptor: Descriptor) -> &[u8] {
        let start = descriptor.offset();
        &self.bytes()[start..start + descriptor.key_length()]
    }

    fn data_of(&self, descriptor: Descriptor) -> &[u8] {
        let start = descriptor.offset() + descriptor.key_length();
        &self.bytes()[start..start + descriptor.data_length()]
    }

    fn entry_of(&self, descriptor: Descriptor) -> SlotEntry<'_> {
        SlotEntry {
            key: self.key_of(descriptor),
            data: self.data_of(descriptor),
            flags: descriptor.flags(),
        }
    }

    /// Binary search over every descriptor, live or garbage.
    ///
    /// `Ok` holds the index of some descriptor with an equal key; `Err` holds
    /// the insertion point.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        let mut low = 0;
        let mut high = self.slot_count();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key_of(self.descriptor(mid)).cmp(key) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(low)
    }

    /// Index of the live descriptor for `key`, skipping garbage duplicates.
    fn find_live(&self, key: &[u8]) -> Option<usize> {
        let found = self.search(key).ok()?;
        let mut index = found;
        loop {
            let descriptor = self.descriptor(index);
            if self.key_of(descriptor) != key {
                break;
            }
            if !descriptor.is_garbage() {
                return Some(index);
            }
            if index == 0 {
                break;
            }
            index -= 1;
        }
        (found + 1..self.slot_count())
            .take_while(|&i| self.key_of(self.descriptor(i)) == key)
            .find(|&i| !self.descriptor(i).is_garbage())
    }

    /// Insertion point after every descriptor whose key is `<= key`.
    fn upper_bound(&self, key: &[u8]) -> usize {
        match self.search(key) {
            Ok(found) => (found + 1..self.slot_count())
                .find(|&i| self.key_of(self.descriptor(i)) != key)
                .unwrap_or(self.slot_count()),
            Err(insert_at) => insert_at,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find_live(key).is_some()
    }

    pub fn try_read(&self, key: &[u8]) -> Option<&[u8]> {
        let index = self.find_live(key)?;
        Some(self.data_of(self.descriptor(index)))
    }

    pub fn try_get_flags(&self, key: &[u8]) -> Option<u8> {
        let index = self.find_live(key)?;
        Some(self.descriptor(index).flags())
    }

    pub fn get(&self, key: &[u8]) -> Option<SlotEntry<'_>> {
        let index = self.find_live(key)?;
        Some(self.entry_of(self.descriptor(index)))
    }

    /// Live entries in key order.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = SlotEntry<'_>> + '_ {
        (0..self.slot_count())
            .map(move |i| self.descriptor(i))
            .filter(|d| !d.is_garbage())
            .map(move |d| self.entry_of(d))
    }

    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &[u8]> + '_ {
        self.entries().map(|entry| entry.key)
    }

    pub fn live_count(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    pub fn first(&self) -> Option<SlotEntry<'_>> {
        self.entries().next()
    }

    pub fn last(&self) -> Option<SlotEntry<'_>> {
        self.entries().next_back()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.keys().next()
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.keys().next_back()
    }

    /// First live entry whose key is `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> Option<SlotEntry<'_>> {
        let start = match self.search(key) {
            Ok(found) => {
                let mut index = found;
                while index > 0 && self.key_of(self.descriptor(index - 1)) == key {
                    index -= 1;
                }
                index
            }
            Err(insert_at) => insert_at,
        };
        (start..self.slot_count())
            .map(|i| self.descriptor(i))
            .find(|d| !d.is_garbage())
            .map(|d| self.entry_of(d))
    }

    /// Whether an entry of this size could be placed, possibly after
    /// compaction.
    pub fn fits(&self, key_length: usize, data_length: usize) -> bool {
        key_length + data_length + DESCRIPTOR_SIZE <= self.total_free_space()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    /// Writes an empty slotted header at `base`.
    pub fn init(data: B, base: usize) -> Self {
        let mut page = Self::new(data, base);
        let payload_offset = base + SLOTTED_HEADER_SIZE;
        page.set_header_u16(PAYLOAD_OFFSET, payload_offset);
        page.set_header_u16(TOTAL_FREE_SPACE_OFFSET, PAGE_SIZE - payload_offset);
        page.set_header_u16(FIRST_SLOT_OFFSET, PAGE_SIZE);
        page.set_header_u16(SLOT_COUNT_OFFSET, 0);
        page.set_can_compact(false);
        page
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    fn set_header_u16(&mut self, field: usize, value: usize) {
        let at = self.base + field;
        LittleEndian::write_u16(&mut self.bytes_mut()[at..at + 2], value as u16);
    }

    fn set_total_free_space(&mut self, value: usize) {
        self.set_header_u16(TOTAL_FREE_SPACE_OFFSET, value);
    }

    fn set_first_slot_offset(&mut self, value: usize) {
        self.set_header_u16(FIRST_SLOT_OFFSET, value);
    }

    fn set_slot_count(&mut self, value: usize) {
        self.set_header_u16(SLOT_COUNT_OFFSET, value);
    }

    fn set_can_compact(&mut self, can_compact: bool) {
        let at = self.base + FLAGS_OFFSET;
        if can_compact {
            self.bytes_mut()[at] |= CAN_COMPACT;
        } else {
            self.bytes_mut()[at] &= !CAN_COMPACT;
        }
    }

    fn set_descriptor(&mut self, index: usize, descriptor: Descriptor) {
        let at = self.descriptor_position(index);
        LittleEndian::write_u64(&mut self.bytes_mut()[at..at + DESCRIPTOR_SIZE], descriptor.bits());
    }

    fn insert_descriptor(&mut self, index: usize, descriptor: Descriptor) {
        let count = self.slot_count();
        let start = self.descriptor_position(index);
        let end = self.descriptor_position(count);
        self.bytes_mut().copy_within(start..end, start + DESCRIPTOR_SIZE);
        self.set_slot_count(count + 1);
        self.set_descriptor(index, descriptor);
    }

    fn remove_descriptor(&mut self, index: usize) -> Descriptor {
        let removed = self.descriptor(index);
        let count = self.slot_count();
        let start = self.descriptor_position(index + 1);
        let end = self.descriptor_position(count);
        self.bytes_mut().copy_within(start..end, start - DESCRIPTOR_SIZE);
        self.set_slot_count(count - 1);
        removed
    }

    /// Reserves a slot for `key` with `data_length` bytes of data and returns
    /// the writable data span.
    ///
    /// Fails when a live entry already uses `key` or the page cannot hold the
    /// entry even after compaction.
    pub fn try_allocate(&mut self, key: &[u8], data_length: usize) -> Option<&mut [u8]> {
        let required = key.len() + data_length;
        if required > Descriptor::MAX_FIELD || !self.fits(key.len(), data_length) {
            return None;
        }
        if self.find_live(key).is_some() {
            return None;
        }

        let index = match self.allocate_virgin(key, required) {
            Some(index) => index,
            None => match self
                .allocate_garbage(key, required)
                .or_else(|| self.allocate_trailing(key, required))
            {
                Some(index) => index,
                None => {
                    self.compact();
                    self.allocate_virgin(key, required)?
                }
            },
        };

        let free = self.total_free_space();
        self.set_total_free_space(free - required - DESCRIPTOR_SIZE);

        let descriptor = self.descriptor(index);
        let key_start = descriptor.offset();
        let data_start = key_start + key.len();
        self.bytes_mut()[key_start..data_start].copy_from_slice(key);
        Some(&mut self.bytes_mut()[data_start..data_start + data_length])
    }

    /// Allocates and fills an entry in one step.
    pub fn try_insert(&mut self, key: &[u8], data: &[u8], flags: u8) -> bool {
        match self.try_allocate(key, data.len()) {
            Some(span) => span.copy_from_slice(data),
            None => return false,
        }
        self.try_set_flags(key, flags)
    }

    fn allocate_virgin(&mut self, key: &[u8], required: usize) -> Option<usize> {
        if self.virgin_space() < required + DESCRIPTOR_SIZE {
            return None;
        }
        let offset = self.first_slot_offset() - required;
        self.set_first_slot_offset(offset);
        let index = self.upper_bound(key);
        self.insert_descriptor(index, Descriptor::new(offset, required, key.len(), 0, 0));
        Some(index)
    }

    /// Reuses the smallest garbage slot that can hold `required` bytes.
    fn allocate_garbage(&mut self, key: &[u8], required: usize) -> Option<usize> {
        let garbage = (0..self.slot_count())
            .map(|i| (i, self.descriptor(i)))
            .filter(|(_, d)| d.is_garbage() && d.length() >= required)
            .min_by_key(|(_, d)| d.length())
            .map(|(i, _)| i)?;

        let old = self.remove_descriptor(garbage);
        let index = self.upper_bound(key);
        let descriptor = Descriptor::new(
            old.offset(),
            old.length(),
            key.len(),
            old.length() - required,
            0,
        );
        self.insert_descriptor(index, descriptor);
        if descriptor.free_space() > 0 {
            self.set_can_compact(true);
        }
        Some(index)
    }

    /// Carves `required` bytes off the trailing free space of a live slot.
    fn allocate_trailing(&mut self, key: &[u8], required: usize) -> Option<usize> {
        if self.virgin_space() < DESCRIPTOR_SIZE {
            return None;
        }
        let (host_index, mut host) = (0..self.slot_count())
            .map(|i| (i, self.descriptor(i)))
            .find(|(_, d)| !d.is_garbage() && d.free_space() >= required)?;

        let offset = host.offset() + host.length() - required;
        host.set_length(host.length() - required);
        host.set_free_space(host.free_space() - required);
        self.set_descriptor(host_index, host);

        let index = self.upper_bound(key);
        self.insert_descriptor(index, Descriptor::new(offset, required, key.len(), 0, 0));
        Some(index)
    }

    /// Mutable data span of the live entry for `key`.
    pub fn try_write(&mut self, key: &[u8]) -> Option<&mut [u8]> {
        let descriptor = self.descriptor(self.find_live(key)?);
        let start = descriptor.offset() + descriptor.key_length();
        Some(&mut self.bytes_mut()[start..start + descriptor.data_length()])
    }

    /// Marks the live entry for `key` as garbage.
    pub fn try_remove(&mut self, key: &[u8]) -> bool {
        let Some(index) = self.find_live(key) else {
            return false;
        };
        let mut descriptor = self.descriptor(index);
        let reclaimed = DESCRIPTOR_SIZE + descriptor.key_length() + descriptor.data_length();
        descriptor.set_garbage(true);
        self.set_descriptor(index, descriptor);

        let free = self.total_free_space();
        self.set_total_free_space(free + reclaimed);
        self.set_can_compact(true);
        true
    }

    pub fn try_set_flags(&mut self, key: &[u8], flags: u8) -> bool {
        let Some(index) = self.find_live(key) else {
            return false;
        };
        let mut descriptor = self.descriptor(index);
        descriptor.set_flags(flags);
        self.set_descriptor(index, descriptor);
        true
    }

    /// Changes the data length of the entry for `key` within its slot.
    ///
    /// Growing consumes the slot's trailing free space; fails when that is not
    /// enough. The existing data prefix is preserved.
    pub fn try_resize(&mut self, key: &[u8], new_length: usize) -> bool {
        let Some(index) = self.find_live(key) else {
            return false;
        };
        let mut descriptor = self.descriptor(index);
        let room = descriptor.data_length() + descriptor.free_space();
        if new_length > room {
            return false;
        }
        let free = self.total_free_space() + descriptor.data_length();
        descriptor.set_free_space(room - new_length);
        self.set_descriptor(index, descriptor);
        self.set_total_free_space(free - new_length);
        if descriptor.free_space() > 0 {
            self.set_can_compact(true);
        }
        true
    }

    /// Rewrites all live slots contiguously at the end of the page and drops
    /// garbage descriptors.
    pub fn compact(&mut self) {
        let live: Vec<(Vec<u8>, usize, u8)> = self
            .entries()
            .map(|entry| {
                let mut bytes = Vec::with_capacity(entry.key.len() + entry.data.len());
                bytes.extend_from_slice(entry.key);
                bytes.extend_from_slice(entry.data);
                (bytes, entry.key.len(), entry.flags)
            })
            .collect();

        let capacity = self.capacity();
        let mut offset = PAGE_SIZE;
        let mut used = 0;
        for (index, (bytes, key_length, flags)) in live.iter().enumerate() {
            offset -= bytes.len();
            self.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
            self.set_descriptor(
                index,
                Descriptor::new(offset, bytes.len(), *key_length, 0, *flags),
            );
            used += bytes.len() + DESCRIPTOR_SIZE;
        }

        self.set_slot_count(live.len());
        self.set_first_slot_offset(offset);
        self.set_total_free_space(capacity - used);
        self.set_can_compact(false);
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        let payload_offset = self.base + SLOTTED_HEADER_SIZE;
        self.set_header_u16(TOTAL_FREE_SPACE_OFFSET, PAGE_SIZE - payload_offset);
        self.set_header_u16(FIRST_SLOT_OFFSET, PAGE_SIZE);
        self.set_header_u16(SLOT_COUNT_OFFSET, 0);
        self.set_can_compact(false);
    }
}
