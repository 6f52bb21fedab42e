//! B+tree over slotted pages.
//!
//! A tree is addressed by its anchor page, which never moves and records the
//! current root, both ends of the leaf chain, the height and the number of
//! entries. Navigation pages map separators to children; every separator is
//! an upper bound of its child's keys, and the last separator of a navigation
//! page equals the page's own separator in its parent. The rightmost spine
//! ends in [`UNBOUNDED`], which sorts after any slot key.
//!
//! Keys longer than [`MAX_INLINE_KEY_LENGTH`] are stored under a slot keyed
//! by their inline prefix plus a `0xFF` marker. The slot points at a bucket
//! holding every long key with that prefix. Values longer than
//! [`MAX_INLINE_VALUE_LENGTH`] are written to an overflow chain.

pub mod cursor;
pub(crate) mod overflow;

use std::borrow::Cow;

use log::{debug, trace};

use self::overflow::Bucket;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::leaf_page::{ChunkPointer, CHUNKED, EXTERNAL_KEYS, LEAF_SLOTS_BASE};
use crate::storage::page::navigation_page::NAVIGATION_SLOTS_BASE;
use crate::storage::page::slotted_page::{OwnedSlot, DESCRIPTOR_SIZE};
use crate::storage::page::{
    LeafPage, NavigationPage, PageBuffer, PageHandle, PageType, SlotEntry, SlottedPage, TreeKind,
    TreeRootPage,
};
use crate::transaction::TransactionScope;

pub use self::cursor::{Cursor, Direction};

/// Longest key stored directly in a leaf slot.
pub const MAX_INLINE_KEY_LENGTH: usize = 480;
/// Longest value stored directly in a leaf slot.
pub const MAX_INLINE_VALUE_LENGTH: usize = 480;
pub const MAX_KEY_LENGTH: usize = u16::MAX as usize;

const EXTERNAL_MARKER: u8 = 0xFF;
const UNBOUNDED: [u8; MAX_INLINE_KEY_LENGTH + 2] = [0xFF; MAX_INLINE_KEY_LENGTH + 2];

const MAX_LEAF_ENTRY: usize =
    DESCRIPTOR_SIZE + MAX_INLINE_KEY_LENGTH + 1 + MAX_INLINE_VALUE_LENGTH;
const MAX_NAVIGATION_ENTRY: usize = DESCRIPTOR_SIZE + UNBOUNDED.len() + 4;

/// The key a leaf slot is sorted by.
pub(crate) fn slot_key(key: &[u8]) -> Cow<'_, [u8]> {
    if key.len() <= MAX_INLINE_KEY_LENGTH {
        Cow::Borrowed(key)
    } else {
        let mut slot = Vec::with_capacity(MAX_INLINE_KEY_LENGTH + 1);
        slot.extend_from_slice(&key[..MAX_INLINE_KEY_LENGTH]);
        slot.push(EXTERNAL_MARKER);
        Cow::Owned(slot)
    }
}

fn is_navigation(page: &PageBuffer) -> bool {
    page.page_type() == Some(PageType::BTreeNode)
}

fn node_slots(page: &PageBuffer) -> SlottedPage<&[u8]> {
    let base = if is_navigation(page) {
        NAVIGATION_SLOTS_BASE
    } else {
        LEAF_SLOTS_BASE
    };
    SlottedPage::new(page.as_bytes(), base)
}

fn node_slots_mut(page: &mut PageBuffer) -> SlottedPage<&mut [u8]> {
    let base = if is_navigation(page) {
        NAVIGATION_SLOTS_BASE
    } else {
        LEAF_SLOTS_BASE
    };
    SlottedPage::new(page.as_bytes_mut(), base)
}

fn max_entry(page: &PageBuffer) -> usize {
    if is_navigation(page) {
        MAX_NAVIGATION_ENTRY
    } else {
        MAX_LEAF_ENTRY
    }
}

fn last_key(page: &PageBuffer) -> Vec<u8> {
    node_slots(page)
        .last()
        .map(|entry| entry.key.to_vec())
        .unwrap_or_default()
}

fn unexpected(page: &PageBuffer) -> StorageError {
    StorageError::InvalidPageType {
        handle: page.handle(),
        marker: page.marker(),
    }
}

fn child_entry(separator: Vec<u8>, child: PageHandle) -> OwnedSlot {
    OwnedSlot {
        key: separator,
        data: child.0.to_le_bytes().to_vec(),
        flags: 0,
    }
}

/// Moves entries from `source` into `target`, in `entries` order, while
/// `target` is underflowed and `source` keeps at least one entry.
fn spill(target: &mut PageBuffer, source: &mut PageBuffer, entries: Vec<OwnedSlot>) {
    let mut remaining = entries.len();
    for entry in entries {
        if !node_slots(target).is_underflowed() || remaining <= 1 {
            break;
        }
        let moved = node_slots_mut(target).try_insert(&entry.key, &entry.data, entry.flags);
        assert!(moved, "an underflowed page must accept any entry");
        node_slots_mut(source).try_remove(&entry.key);
        remaining -= 1;
    }
}

/// Value stored in a slot that is not an external-key bucket.
fn read_value(tx: &TransactionScope, entry: &SlotEntry<'_>) -> StorageResult<Vec<u8>> {
    if entry.flags & CHUNKED != 0 {
        overflow::read_chain(tx, ChunkPointer::decode(entry.data).head)
    } else {
        Ok(entry.data.to_vec())
    }
}

fn read_bucket(tx: &TransactionScope, entry: &SlotEntry<'_>) -> StorageResult<(PageHandle, Bucket)> {
    let head = PageHandle::read(entry.data, 0);
    Ok((head, Bucket::decode(&overflow::read_chain(tx, head)?)?))
}

/// Every key and value of one leaf in key order, with long keys and chunked
/// values resolved.
pub(crate) fn leaf_entries(
    tx: &TransactionScope,
    page: &PageBuffer,
) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let leaf = LeafPage::new(page);
    let slots = leaf.slots();
    let mut entries = Vec::with_capacity(slots.live_count());
    for entry in slots.entries() {
        if entry.flags & EXTERNAL_KEYS != 0 {
            let prefix = &entry.key[..entry.key.len() - 1];
            let (_, bucket) = read_bucket(tx, &entry)?;
            for (suffix, value) in bucket.entries() {
                let mut key = Vec::with_capacity(prefix.len() + suffix.len());
                key.extend_from_slice(prefix);
                key.extend_from_slice(suffix);
                entries.push((key, value.clone()));
            }
        } else {
            entries.push((entry.key.to_vec(), read_value(tx, &entry)?));
        }
    }
    Ok(entries)
}

/// Navigation pages from the root down to `leaf`.
struct LeafPath {
    navigation: Vec<PageHandle>,
    leaf: PageBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BTree {
    anchor: PageHandle,
}

impl BTree {
    /// Allocates the anchor page of a new, empty tree.
    pub fn create(tx: &TransactionScope, kind: TreeKind) -> StorageResult<Self> {
        let anchor = tx.allocate()?;
        let mut page = PageBuffer::new(anchor, PageType::BTreeRoot);
        TreeRootPage::init(&mut page, kind);
        tx.save(&page)?;
        debug!("created {:?} tree at {}", kind, anchor);
        Ok(Self { anchor })
    }

    pub fn open(anchor: PageHandle) -> Self {
        Self { anchor }
    }

    pub fn anchor(&self) -> PageHandle {
        self.anchor
    }

    fn load_anchor(&self, tx: &TransactionScope) -> StorageResult<PageBuffer> {
        let page = tx.load(self.anchor)?;
        page.expect_type(&[PageType::BTreeRoot])?;
        Ok(page)
    }

    pub fn kind(&self, tx: &TransactionScope) -> StorageResult<TreeKind> {
        Ok(TreeRootPage::new(&self.load_anchor(tx)?).kind())
    }

    pub fn len(&self, tx: &TransactionScope) -> StorageResult<u64> {
        Ok(TreeRootPage::new(&self.load_anchor(tx)?).entry_count())
    }

    pub fn is_empty(&self, tx: &TransactionScope) -> StorageResult<bool> {
        Ok(self.len(tx)? == 0)
    }

    pub fn height(&self, tx: &TransactionScope) -> StorageResult<u16> {
        Ok(TreeRootPage::new(&self.load_anchor(tx)?).height())
    }

    fn find_leaf(
        &self,
        tx: &TransactionScope,
        root: PageHandle,
        slot: &[u8],
    ) -> StorageResult<LeafPath> {
        let mut navigation = Vec::new();
        let mut current = root;
        loop {
            let page = tx.load(current)?;
            match page.page_type() {
                Some(PageType::BTreeNode) => {
                    navigation.push(current);
                    current = NavigationPage::new(&page)
                        .find_child(slot)
                        .ok_or_else(|| unexpected(&page))?;
                }
                Some(PageType::BTreeLeaf) | Some(PageType::Object) => {
                    return Ok(LeafPath {
                        navigation,
                        leaf: page,
                    })
                }
                _ => return Err(unexpected(&page)),
            }
        }
    }

    pub fn get(&self, tx: &TransactionScope, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let root = TreeRootPage::new(&self.load_anchor(tx)?).root();
        if root.is_null() {
            return Ok(None);
        }
        let slot = slot_key(key);
        let path = self.find_leaf(tx, root, &slot)?;
        let slots = node_slots(&path.leaf);
        let Some(entry) = slots.get(&slot) else {
            return Ok(None);
        };
        if entry.flags & EXTERNAL_KEYS != 0 {
            let (_, bucket) = read_bucket(tx, &entry)?;
            Ok(bucket
                .get(&key[MAX_INLINE_KEY_LENGTH..])
                .map(|value| value.to_vec()))
        } else {
            read_value(tx, &entry).map(Some)
        }
    }

    pub fn contains(&self, tx: &TransactionScope, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(tx, key)?.is_some())
    }

    /// Adds `key`; returns `false` and changes nothing if it is already
    /// present.
    pub fn insert(&self, tx: &TransactionScope, key: &[u8], value: &[u8]) -> StorageResult<bool> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(StorageError::KeyTooLarge { len: key.len() });
        }
        let mut anchor = self.load_anchor(tx)?;
        let kind = TreeRootPage::new(&anchor).kind();
        if TreeRootPage::new(&anchor).root().is_null() {
            let leaf = tx.allocate()?;
            let mut page = PageBuffer::new(leaf, kind.leaf_type());
            LeafPage::init(&mut page, kind.leaf_type());
            tx.save(&page)?;
            let mut view = TreeRootPage::new(&mut anchor);
            view.set_root(leaf);
            view.set_first_leaf(leaf);
            view.set_last_leaf(leaf);
            view.set_height(1);
        }

        let root = TreeRootPage::new(&anchor).root();
        let slot = slot_key(key);
        let LeafPath {
            navigation,
            leaf: mut page,
        } = self.find_leaf(tx, root, &slot)?;

        let existing = node_slots(&page).get(&slot).map(|entry| entry.to_owned());
        let entry = if key.len() > MAX_INLINE_KEY_LENGTH {
            let suffix = &key[MAX_INLINE_KEY_LENGTH..];
            match existing {
                Some(entry) => {
                    let head = PageHandle::read(&entry.data, 0);
                    let mut bucket = Bucket::decode(&overflow::read_chain(tx, head)?)?;
                    if !bucket.insert(suffix, value) {
                        return Ok(false);
                    }
                    self.rewrite_bucket(tx, kind, &mut page, &slot, head, &bucket)?;
                    None
                }
                None => {
                    let mut bucket = Bucket::default();
                    bucket.insert(suffix, value);
                    let head = overflow::write_chain(tx, kind.overflow_type(), &bucket.encode())?;
                    Some(OwnedSlot {
                        key: slot.to_vec(),
                        data: head.0.to_le_bytes().to_vec(),
                        flags: EXTERNAL_KEYS,
                    })
                }
            }
        } else if existing.is_some() {
            return Ok(false);
        } else if value.len() > MAX_INLINE_VALUE_LENGTH {
            let head = overflow::write_chain(tx, kind.overflow_type(), value)?;
            let pointer = ChunkPointer {
                length: value.len() as u32,
                head,
            };
            Some(OwnedSlot {
                key: key.to_vec(),
                data: pointer.encode().to_vec(),
                flags: CHUNKED,
            })
        } else {
            Some(OwnedSlot {
                key: key.to_vec(),
                data: value.to_vec(),
                flags: 0,
            })
        };

        if let Some(entry) = entry {
            self.insert_entry(tx, &mut anchor, &navigation, page, entry)?;
        }
        let mut view = TreeRootPage::new(&mut anchor);
        let count = view.entry_count();
        view.set_entry_count(count + 1);
        tx.save(&anchor)?;
        trace!("inserted {} byte key into tree {}", key.len(), self.anchor);
        Ok(true)
    }

    /// Replaces the value of an existing key; returns `false` if it is
    /// absent.
    pub fn update(&self, tx: &TransactionScope, key: &[u8], value: &[u8]) -> StorageResult<bool> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(StorageError::KeyTooLarge { len: key.len() });
        }
        let anchor = self.load_anchor(tx)?;
        let kind = TreeRootPage::new(&anchor).kind();
        let root = TreeRootPage::new(&anchor).root();
        if root.is_null() {
            return Ok(false);
        }
        let slot = slot_key(key);
        let mut path = self.find_leaf(tx, root, &slot)?;
        let Some(entry) = node_slots(&path.leaf).get(&slot).map(|entry| entry.to_owned()) else {
            return Ok(false);
        };

        if entry.flags & EXTERNAL_KEYS != 0 {
            let head = PageHandle::read(&entry.data, 0);
            let mut bucket = Bucket::decode(&overflow::read_chain(tx, head)?)?;
            if !bucket.update(&key[MAX_INLINE_KEY_LENGTH..], value) {
                return Ok(false);
            }
            self.rewrite_bucket(tx, kind, &mut path.leaf, &slot, head, &bucket)?;
            return Ok(true);
        }
        if entry.flags & CHUNKED == 0 && entry.data.len() == value.len() {
            if let Some(data) = node_slots_mut(&mut path.leaf).try_write(&slot) {
                data.copy_from_slice(value);
            }
            tx.save(&path.leaf)?;
            return Ok(true);
        }

        self.remove(tx, key)?;
        self.insert(tx, key, value)
    }

    /// Removes `key`; returns `false` if it is absent.
    pub fn remove(&self, tx: &TransactionScope, key: &[u8]) -> StorageResult<bool> {
        let mut anchor = self.load_anchor(tx)?;
        let kind = TreeRootPage::new(&anchor).kind();
        let root = TreeRootPage::new(&anchor).root();
        if root.is_null() {
            return Ok(false);
        }
        let slot = slot_key(key);
        let LeafPath {
            navigation,
            leaf: mut page,
        } = self.find_leaf(tx, root, &slot)?;
        let Some(entry) = node_slots(&page).get(&slot).map(|entry| entry.to_owned()) else {
            return Ok(false);
        };

        let mut emptied = true;
        if entry.flags & EXTERNAL_KEYS != 0 {
            let head = PageHandle::read(&entry.data, 0);
            let mut bucket = Bucket::decode(&overflow::read_chain(tx, head)?)?;
            if !bucket.remove(&key[MAX_INLINE_KEY_LENGTH..]) {
                return Ok(false);
            }
            if bucket.is_empty() {
                overflow::free_chain(tx, head)?;
            } else {
                self.rewrite_bucket(tx, kind, &mut page, &slot, head, &bucket)?;
                emptied = false;
            }
        } else if entry.flags & CHUNKED != 0 {
            overflow::free_chain(tx, ChunkPointer::decode(&entry.data).head)?;
        }

        if emptied {
            node_slots_mut(&mut page).try_remove(&slot);
            tx.save(&page)?;
            self.rebalance(tx, &mut anchor, &navigation, page)?;
        }
        let mut view = TreeRootPage::new(&mut anchor);
        let count = view.entry_count();
        view.set_entry_count(count.saturating_sub(1));
        tx.save(&anchor)?;
        trace!("removed {} byte key from tree {}", key.len(), self.anchor);
        Ok(true)
    }

    /// Replaces the bucket chain behind an external-key slot of `leaf`.
    fn rewrite_bucket(
        &self,
        tx: &TransactionScope,
        kind: TreeKind,
        leaf: &mut PageBuffer,
        slot: &[u8],
        old_head: PageHandle,
        bucket: &Bucket,
    ) -> StorageResult<()> {
        overflow::free_chain(tx, old_head)?;
        let head = overflow::write_chain(tx, kind.overflow_type(), &bucket.encode())?;
        if let Some(data) = node_slots_mut(leaf).try_write(slot) {
            head.write(data, 0);
        }
        tx.save(leaf)
    }

    /// Puts `entry` into `node`, splitting it and its ancestors as needed.
    /// Returns whether a split happened.
    fn insert_entry(
        &self,
        tx: &TransactionScope,
        anchor: &mut PageBuffer,
        ancestors: &[PageHandle],
        mut node: PageBuffer,
        entry: OwnedSlot,
    ) -> StorageResult<bool> {
        if node_slots_mut(&mut node).try_insert(&entry.key, &entry.data, entry.flags) {
            tx.save(&node)?;
            return Ok(false);
        }
        self.split(tx, anchor, ancestors, node, entry)?;
        Ok(true)
    }

    /// Splits the full page `right` by moving its lowest entries into a new
    /// left sibling, then places `pending` and registers the sibling with
    /// the parent.
    fn split(
        &self,
        tx: &TransactionScope,
        anchor: &mut PageBuffer,
        ancestors: &[PageHandle],
        mut right: PageBuffer,
        pending: OwnedSlot,
    ) -> StorageResult<()> {
        let navigation = is_navigation(&right);
        let left_handle = tx.allocate()?;
        let mut left = if navigation {
            let level = NavigationPage::new(&right).level();
            let mut page = PageBuffer::new(left_handle, PageType::BTreeNode);
            NavigationPage::init(&mut page, level);
            page
        } else {
            let leaf_type = right.expect_type(&[PageType::BTreeLeaf, PageType::Object])?;
            let mut page = PageBuffer::new(left_handle, leaf_type);
            LeafPage::init(&mut page, leaf_type);
            page
        };

        let entries: Vec<OwnedSlot> = node_slots(&right)
            .entries()
            .map(|entry| entry.to_owned())
            .collect();
        spill(&mut left, &mut right, entries);

        let separator = last_key(&left);
        let target = if pending.key <= separator {
            &mut left
        } else {
            &mut right
        };
        let placed = node_slots_mut(target).try_insert(&pending.key, &pending.data, pending.flags);
        assert!(placed, "a split page must accept the pending entry");

        if !navigation {
            let previous = LeafPage::new(&right).previous();
            let mut view = LeafPage::new(&mut left);
            view.set_previous(previous);
            view.set_next(right.handle());
            LeafPage::new(&mut right).set_previous(left_handle);
            if previous.is_null() {
                TreeRootPage::new(&mut *anchor).set_first_leaf(left_handle);
            } else {
                let mut page = tx.load(previous)?;
                LeafPage::new(&mut page).set_next(left_handle);
                tx.save(&page)?;
            }
        }
        tx.save(&left)?;
        tx.save(&right)?;
        debug!(
            "split {} into {} and {} in tree {}",
            right.handle(),
            left_handle,
            right.handle(),
            self.anchor
        );

        match ancestors.split_last() {
            Some((&parent, rest)) => {
                let page = tx.load(parent)?;
                self.insert_entry(tx, anchor, rest, page, child_entry(separator, left_handle))?;
            }
            None => {
                let level = if navigation {
                    NavigationPage::new(&right).level() + 1
                } else {
                    1
                };
                let root = tx.allocate()?;
                let mut page = PageBuffer::new(root, PageType::BTreeNode);
                let mut view = NavigationPage::init(&mut page, level);
                let linked =
                    view.try_insert(&separator, left_handle) && view.try_insert(&UNBOUNDED, right.handle());
                assert!(linked, "a new root holds two children");
                tx.save(&page)?;

                let mut view = TreeRootPage::new(&mut *anchor);
                view.set_root(root);
                view.set_height(view.height() + 1);
                debug!("tree {} grew to height {}", self.anchor, view.height());
            }
        }
        Ok(())
    }

    /// Restores the fill invariant of `node` after an entry was removed from
    /// it, merging with or borrowing from a sibling.
    fn rebalance(
        &self,
        tx: &TransactionScope,
        anchor: &mut PageBuffer,
        ancestors: &[PageHandle],
        node: PageBuffer,
    ) -> StorageResult<()> {
        let Some((&parent_handle, rest)) = ancestors.split_last() else {
            return self.shrink_root(tx, anchor, node);
        };
        if !node_slots(&node).is_underflowed() {
            return Ok(());
        }

        let mut parent = tx.load(parent_handle)?;
        let children = NavigationPage::new(&parent).children();
        let position = children
            .iter()
            .position(|(_, child)| *child == node.handle())
            .ok_or_else(|| unexpected(&parent))?;
        let (left_index, node_is_left) = if position + 1 < children.len() {
            (position, true)
        } else if position > 0 {
            (position - 1, false)
        } else {
            return Ok(());
        };
        let (left_separator, left_handle) = children[left_index].clone();
        let right_handle = children[left_index + 1].1;
        let (mut left, mut right) = if node_is_left {
            (node, tx.load(right_handle)?)
        } else {
            (tx.load(left_handle)?, node)
        };

        let capacity = node_slots(&left).capacity();
        let combined = node_slots(&left).used_space() + node_slots(&right).used_space();
        if combined + max_entry(&left) <= capacity {
            let entries: Vec<OwnedSlot> = node_slots(&left)
                .entries()
                .map(|entry| entry.to_owned())
                .collect();
            for entry in entries {
                let moved = node_slots_mut(&mut right).try_insert(&entry.key, &entry.data, entry.flags);
                assert!(moved, "merged entries must fit");
            }
            if !is_navigation(&left) {
                let previous = LeafPage::new(&left).previous();
                LeafPage::new(&mut right).set_previous(previous);
                if previous.is_null() {
                    TreeRootPage::new(&mut *anchor).set_first_leaf(right_handle);
                } else {
                    let mut page = tx.load(previous)?;
                    LeafPage::new(&mut page).set_next(right_handle);
                    tx.save(&page)?;
                }
            }
            tx.save(&right)?;
            tx.deallocate(left_handle)?;
            NavigationPage::new(&mut parent).try_remove(&left_separator);
            tx.save(&parent)?;
            trace!("merged {} into {} in tree {}", left_handle, right_handle, self.anchor);
            return self.rebalance(tx, anchor, rest, parent);
        }

        if node_is_left {
            let entries: Vec<OwnedSlot> = node_slots(&right)
                .entries()
                .map(|entry| entry.to_owned())
                .collect();
            spill(&mut left, &mut right, entries);
        } else {
            let entries: Vec<OwnedSlot> = node_slots(&left)
                .entries()
                .rev()
                .map(|entry| entry.to_owned())
                .collect();
            spill(&mut right, &mut left, entries);
        }
        tx.save(&left)?;
        tx.save(&right)?;
        trace!("rebalanced {} and {} in tree {}", left_handle, right_handle, self.anchor);

        let separator = last_key(&left);
        if separator == left_separator {
            return Ok(());
        }
        NavigationPage::new(&mut parent).try_remove(&left_separator);
        let split = self.insert_entry(
            tx,
            anchor,
            rest,
            parent,
            child_entry(separator, left_handle),
        )?;
        if split {
            return Ok(());
        }
        let parent = tx.load(parent_handle)?;
        self.rebalance(tx, anchor, rest, parent)
    }

    /// Drops a root that holds a single child, or an empty root leaf.
    fn shrink_root(
        &self,
        tx: &TransactionScope,
        anchor: &mut PageBuffer,
        mut root: PageBuffer,
    ) -> StorageResult<()> {
        loop {
            if is_navigation(&root) {
                let navigation = NavigationPage::new(&root);
                if navigation.child_count() != 1 {
                    return Ok(());
                }
                let Some((_, child)) = navigation.children().pop() else {
                    return Ok(());
                };
                tx.deallocate(root.handle())?;
                let mut view = TreeRootPage::new(&mut *anchor);
                view.set_root(child);
                view.set_height(view.height().saturating_sub(1));
                debug!("tree {} shrank to height {}", self.anchor, view.height());
                root = tx.load(child)?;
            } else {
                if !node_slots(&root).is_empty() {
                    return Ok(());
                }
                tx.deallocate(root.handle())?;
                let mut view = TreeRootPage::new(&mut *anchor);
                view.set_root(PageHandle::NULL);
                view.set_first_leaf(PageHandle::NULL);
                view.set_last_leaf(PageHandle::NULL);
                view.set_height(0);
                debug!("tree {} is empty", self.anchor);
                return Ok(());
            }
        }
    }

    /// Iterates every entry from one end of the leaf chain.
    pub fn iter<'t>(
        &self,
        tx: &'t TransactionScope,
        direction: Direction,
    ) -> StorageResult<Cursor<'t>> {
        let anchor = self.load_anchor(tx)?;
        let view = TreeRootPage::new(&anchor);
        let start = match direction {
            Direction::Forward => view.first_leaf(),
            Direction::Backward => view.last_leaf(),
        };
        Ok(Cursor::new(tx, direction, start))
    }

    /// Iterates entries at or after `key` going forward, or at or before it
    /// going backward.
    pub fn iter_from<'t>(
        &self,
        tx: &'t TransactionScope,
        key: &[u8],
        direction: Direction,
    ) -> StorageResult<Cursor<'t>> {
        let root = TreeRootPage::new(&self.load_anchor(tx)?).root();
        if root.is_null() {
            return Ok(Cursor::new(tx, direction, PageHandle::NULL));
        }
        let path = self.find_leaf(tx, root, &slot_key(key))?;
        Cursor::starting_at(tx, direction, &path.leaf, key)
    }

    /// Every page the tree owns, anchor first.
    pub fn pages(&self, tx: &TransactionScope) -> StorageResult<Vec<PageHandle>> {
        let anchor = self.load_anchor(tx)?;
        let mut handles = vec![self.anchor];
        let mut pending = Vec::new();
        let root = TreeRootPage::new(&anchor).root();
        if !root.is_null() {
            pending.push(root);
        }
        while let Some(handle) = pending.pop() {
            handles.push(handle);
            let page = tx.load(handle)?;
            match page.page_type() {
                Some(PageType::BTreeNode) => pending.extend(
                    NavigationPage::new(&page)
                        .children()
                        .into_iter()
                        .map(|(_, child)| child),
                ),
                Some(PageType::BTreeLeaf) | Some(PageType::Object) => {
                    for entry in node_slots(&page).entries() {
                        if entry.flags & EXTERNAL_KEYS != 0 {
                            let head = PageHandle::read(entry.data, 0);
                            handles.extend(overflow::chain_pages(tx, head)?);
                        } else if entry.flags & CHUNKED != 0 {
                            let head = ChunkPointer::decode(entry.data).head;
                            handles.extend(overflow::chain_pages(tx, head)?);
                        }
                    }
                }
                _ => return Err(unexpected(&page)),
            }
        }
        Ok(handles)
    }

    /// Frees every page of the tree, including its anchor.
    pub fn destroy(self, tx: &TransactionScope) -> StorageResult<()> {
        let pages = self.pages(tx)?;
        for handle in &pages {
            tx.deallocate(*handle)?;
        }
        debug!("destroyed tree {} ({} pages)", self.anchor, pages.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use crate::concurrency::LockManager;
    use crate::storage::{MemoryStorage, PageAllocator, WalBuffer, WalConfig};
    use crate::transaction::{TransactionManager, TransactionOptions};

    fn setup() -> (Arc<TransactionManager>, Arc<PageAllocator>) {
        let main = MemoryStorage::new();
        PageAllocator::format(&main).unwrap();
        let wal = Arc::new(
            WalBuffer::open(
                Arc::new(main),
                Arc::new(MemoryStorage::new()),
                WalConfig::default(),
            )
            .unwrap(),
        );
        let allocator = Arc::new(PageAllocator::new(Arc::clone(&wal), u32::MAX));
        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&allocator),
            wal,
            Arc::new(LockManager::new()),
            Duration::from_millis(100),
            true,
        ));
        (manager, allocator)
    }

    fn collect(cursor: Cursor<'_>) -> Vec<(Vec<u8>, Vec<u8>)> {
        cursor.collect::<StorageResult<Vec<_>>>().unwrap()
    }

    fn keys(cursor: Cursor<'_>) -> Vec<Vec<u8>> {
        collect(cursor).into_iter().map(|(key, _)| key).collect()
    }

    #[test]
    fn test_btree_insert_and_get() {
        let (manager, _) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Index).unwrap();
        assert!(tree.is_empty(&tx).unwrap());
        assert_eq!(tree.height(&tx).unwrap(), 0);

        assert!(tree.insert(&tx, b"beta", b"2").unwrap());
        assert!(tree.insert(&tx, b"alpha", b"1").unwrap());
        assert!(tree.insert(&tx, b"", b"empty").unwrap());
        assert_eq!(tree.get(&tx, b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(&tx, b"").unwrap(), Some(b"empty".to_vec()));
        assert_eq!(tree.get(&tx, b"gamma").unwrap(), None);
        assert!(tree.contains(&tx, b"beta").unwrap());
        assert_eq!(tree.len(&tx).unwrap(), 3);
        assert_eq!(tree.height(&tx).unwrap(), 1);
        tx.commit().unwrap();

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::open(tree.anchor());
        assert_eq!(tree.get(&tx, b"beta").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_btree_duplicate_insert_is_rejected() {
        let (manager, _) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Index).unwrap();
        assert!(tree.insert(&tx, b"key", b"first").unwrap());
        assert!(!tree.insert(&tx, b"key", b"second").unwrap());
        assert_eq!(tree.get(&tx, b"key").unwrap(), Some(b"first".to_vec()));
        assert_eq!(tree.len(&tx).unwrap(), 1);
    }

    #[test]
    fn test_btree_key_too_large() {
        let (manager, _) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Index).unwrap();
        let key = vec![7u8; MAX_KEY_LENGTH + 1];
        assert!(matches!(
            tree.insert(&tx, &key, b"v"),
            Err(StorageError::KeyTooLarge { .. })
        ));
    }

    #[test]
    fn test_btree_splits_keep_order() {
        let (manager, _) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Index).unwrap();

        let mut expected: Vec<Vec<u8>> = (0..3000u32)
            .map(|i| format!("key-{:06}", i).into_bytes())
            .collect();
        let mut shuffled = expected.clone();
        shuffled.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        for key in &shuffled {
            assert!(tree.insert(&tx, key, &[b'v'; 64]).unwrap());
        }
        assert!(tree.height(&tx).unwrap() >= 2);
        assert_eq!(tree.len(&tx).unwrap(), 3000);
        assert_eq!(keys(tree.iter(&tx, Direction::Forward).unwrap()), expected);

        expected.reverse();
        assert_eq!(keys(tree.iter(&tx, Direction::Backward).unwrap()), expected);
        tx.commit().unwrap();
    }

    #[test]
    fn test_btree_remove_all_frees_pages() {
        let (manager, allocator) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Object).unwrap();
        tx.commit().unwrap();
        let baseline = allocator.live_handles().unwrap().len();

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let mut keys: Vec<Vec<u8>> = (1..=2000u32)
            .map(|i| format!("{:06}", i).into_bytes())
            .collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(11));
        for key in &keys {
            tree.insert(&tx, key, &[1u8; 100]).unwrap();
        }
        tx.commit().unwrap();

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(13));
        for (removed, key) in keys.iter().enumerate() {
            assert!(tree.remove(&tx, key).unwrap());
            if removed % 400 == 0 {
                assert!(!tree.contains(&tx, key).unwrap());
            }
        }
        assert!(!tree.remove(&tx, b"000001").unwrap());
        assert_eq!(tree.len(&tx).unwrap(), 0);
        assert_eq!(tree.height(&tx).unwrap(), 0);
        assert!(collect(tree.iter(&tx, Direction::Forward).unwrap()).is_empty());
        assert_eq!(tree.pages(&tx).unwrap(), vec![tree.anchor()]);
        tx.commit().unwrap();

        assert_eq!(allocator.live_handles().unwrap().len(), baseline);
    }

    #[test]
    fn test_btree_chunked_values() {
        let (manager, allocator) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Object).unwrap();
        tx.commit().unwrap();
        let baseline = allocator.live_handles().unwrap().len();

        let large: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        tree.insert(&tx, b"large", &large).unwrap();
        tree.insert(&tx, b"small", b"tiny").unwrap();
        assert_eq!(tree.get(&tx, b"large").unwrap(), Some(large.clone()));
        // anchor, leaf and three overflow pages
        assert_eq!(tree.pages(&tx).unwrap().len(), 5);

        assert!(tree.update(&tx, b"large", b"now inline").unwrap());
        assert_eq!(tree.get(&tx, b"large").unwrap(), Some(b"now inline".to_vec()));
        assert!(tree.update(&tx, b"small", &large).unwrap());
        assert_eq!(tree.get(&tx, b"small").unwrap(), Some(large.clone()));
        assert!(tree.remove(&tx, b"small").unwrap());
        assert!(tree.remove(&tx, b"large").unwrap());
        tx.commit().unwrap();

        assert_eq!(allocator.live_handles().unwrap().len(), baseline);
    }

    #[test]
    fn test_btree_external_keys() {
        let (manager, _) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Index).unwrap();

        let prefix = vec![b'p'; MAX_INLINE_KEY_LENGTH];
        let long = |suffix: &[u8]| {
            let mut key = prefix.clone();
            key.extend_from_slice(suffix);
            key
        };
        let short = prefix[..10].to_vec();
        let exact = prefix.clone();
        let mut after = prefix.clone();
        after[MAX_INLINE_KEY_LENGTH - 1] = b'q';

        for key in [long(b"zz"), long(b"a"), exact.clone(), long(b"\xff"), short.clone(), after.clone()] {
            assert!(tree.insert(&tx, &key, &key[key.len() - 1..]).unwrap());
        }
        assert!(!tree.insert(&tx, &long(b"a"), b"dup").unwrap());
        assert_eq!(tree.len(&tx).unwrap(), 6);
        assert_eq!(tree.get(&tx, &long(b"zz")).unwrap(), Some(b"z".to_vec()));
        assert_eq!(tree.get(&tx, &long(b"b")).unwrap(), None);

        assert_eq!(
            keys(tree.iter(&tx, Direction::Forward).unwrap()),
            vec![short, exact, long(b"a"), long(b"zz"), long(b"\xff"), after]
        );

        assert!(tree.update(&tx, &long(b"a"), b"updated").unwrap());
        assert_eq!(tree.get(&tx, &long(b"a")).unwrap(), Some(b"updated".to_vec()));
        assert!(tree.remove(&tx, &long(b"zz")).unwrap());
        assert!(!tree.remove(&tx, &long(b"zz")).unwrap());
        assert!(tree.remove(&tx, &long(b"a")).unwrap());
        assert!(tree.remove(&tx, &long(b"\xff")).unwrap());
        assert_eq!(tree.len(&tx).unwrap(), 3);
        assert_eq!(tree.get(&tx, &long(b"a")).unwrap(), None);
    }

    #[test]
    fn test_btree_iter_from() {
        let (manager, _) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Index).unwrap();
        for i in (0..1000u32).step_by(2) {
            tree.insert(&tx, format!("{:05}", i).as_bytes(), &[0u8; 32]).unwrap();
        }

        let forward = keys(tree.iter_from(&tx, b"00501", Direction::Forward).unwrap());
        assert_eq!(forward.len(), 249);
        assert_eq!(forward[0], b"00502".to_vec());

        let backward = keys(tree.iter_from(&tx, b"00501", Direction::Backward).unwrap());
        assert_eq!(backward.len(), 251);
        assert_eq!(backward[0], b"00500".to_vec());
        assert_eq!(backward.last().unwrap(), &b"00000".to_vec());

        let exact = keys(tree.iter_from(&tx, b"00500", Direction::Forward).unwrap());
        assert_eq!(exact[0], b"00500".to_vec());
        assert!(keys(tree.iter_from(&tx, b"99999", Direction::Forward).unwrap()).is_empty());
    }

    #[test]
    fn test_btree_destroy_frees_everything() {
        let (manager, allocator) = setup();
        let baseline = allocator.live_handles().unwrap().len();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Index).unwrap();
        for i in 0..500u32 {
            tree.insert(&tx, &i.to_be_bytes(), &[9u8; 600]).unwrap();
        }
        tx.commit().unwrap();
        assert!(allocator.live_handles().unwrap().len() > baseline + 500);

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        tree.destroy(&tx).unwrap();
        tx.commit().unwrap();
        assert_eq!(allocator.live_handles().unwrap().len(), baseline);
    }

    #[test]
    fn test_btree_rollback_discards_changes() {
        let (manager, _) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let tree = BTree::create(&tx, TreeKind::Index).unwrap();
        tree.insert(&tx, b"kept", b"1").unwrap();
        tx.commit().unwrap();

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        tree.insert(&tx, b"discarded", b"2").unwrap();
        tree.remove(&tx, b"kept").unwrap();
        tx.rollback().unwrap();

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        assert_eq!(keys(tree.iter(&tx, Direction::Forward).unwrap()), vec![b"kept".to_vec()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_btree_matches_ordered_map(
            ops in prop::collection::vec(
                (any::<bool>(), prop::collection::vec(any::<u8>(), 0..24), 0usize..700),
                1..400,
            )
        ) {
            let (manager, _) = setup();
            let tx = manager.begin(TransactionOptions::new()).unwrap();
            let tree = BTree::create(&tx, TreeKind::Index).unwrap();
            let mut model = BTreeMap::new();

            for (insert, key, value_length) in ops {
                if insert {
                    let value = vec![key.len() as u8; value_length];
                    let fresh = !model.contains_key(&key);
                    prop_assert_eq!(tree.insert(&tx, &key, &value).unwrap(), fresh);
                    model.entry(key).or_insert(value);
                } else {
                    prop_assert_eq!(tree.remove(&tx, &key).unwrap(), model.remove(&key).is_some());
                }
            }

            prop_assert_eq!(tree.len(&tx).unwrap(), model.len() as u64);
            let entries = collect(tree.iter(&tx, Direction::Forward).unwrap());
            let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
            prop_assert_eq!(entries, expected);
        }
    }
}
