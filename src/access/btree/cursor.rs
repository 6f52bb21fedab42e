use std::collections::VecDeque;

use super::leaf_entries;
use crate::storage::error::StorageResult;
use crate::storage::page::{LeafPage, PageBuffer, PageHandle, PageType};
use crate::transaction::TransactionScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Walks the leaf chain of a tree one leaf at a time.
///
/// Each leaf is read in full when the cursor reaches it, so the pages it
/// holds on to are never borrowed across calls. Iteration stops after the
/// first error.
pub struct Cursor<'t> {
    tx: &'t TransactionScope,
    direction: Direction,
    next_leaf: PageHandle,
    buffered: VecDeque<(Vec<u8>, Vec<u8>)>,
    failed: bool,
}

impl<'t> Cursor<'t> {
    pub(super) fn new(tx: &'t TransactionScope, direction: Direction, start: PageHandle) -> Self {
        Self {
            tx,
            direction,
            next_leaf: start,
            buffered: VecDeque::new(),
            failed: false,
        }
    }

    /// Positions the cursor inside `leaf`, skipping the entries before `key`
    /// in the direction of travel.
    pub(super) fn starting_at(
        tx: &'t TransactionScope,
        direction: Direction,
        leaf: &PageBuffer,
        key: &[u8],
    ) -> StorageResult<Self> {
        let mut cursor = Self::new(tx, direction, PageHandle::NULL);
        cursor.buffer_leaf(leaf)?;
        match direction {
            Direction::Forward => cursor.buffered.retain(|(k, _)| k.as_slice() >= key),
            Direction::Backward => cursor.buffered.retain(|(k, _)| k.as_slice() <= key),
        }
        Ok(cursor)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn buffer_leaf(&mut self, page: &PageBuffer) -> StorageResult<()> {
        page.expect_type(&[PageType::BTreeLeaf, PageType::Object])?;
        let leaf = LeafPage::new(page);
        self.next_leaf = match self.direction {
            Direction::Forward => leaf.next(),
            Direction::Backward => leaf.previous(),
        };
        let mut entries = leaf_entries(self.tx, page)?;
        if self.direction == Direction::Backward {
            entries.reverse();
        }
        self.buffered.extend(entries);
        Ok(())
    }

    /// Loads leaves until an entry is buffered; `false` at the end of the
    /// chain.
    fn fill(&mut self) -> StorageResult<bool> {
        while self.buffered.is_empty() {
            if self.next_leaf.is_null() {
                return Ok(false);
            }
            let page = self.tx.load(self.next_leaf)?;
            self.buffer_leaf(&page)?;
        }
        Ok(true)
    }
}

impl Iterator for Cursor<'_> {
    type Item = StorageResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.fill() {
            Ok(true) => self.buffered.pop_front().map(Ok),
            Ok(false) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
