//! Collection catalog.
//!
//! The catalog is an index tree anchored at the root page's metadata root. It
//! maps each collection name, encoded as a normalised string, to the
//! collection's page. A collection page holds the anchor of the object tree,
//! the next object id, and the anchors of the collection's index trees.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::access::btree::{BTree, Direction};
use crate::access::normalised::{NormalisedValue, NormalisedValueSpan};
use crate::access::value::{Value, ValueBuffer};
use crate::concurrency::LockTarget;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{CollectionPage, PageBuffer, PageHandle, PageType, TreeKind};
use crate::transaction::TransactionScope;

/// Identifier of an object within its collection, assigned in insertion
/// order starting at 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Object tree key; big-endian so tree order is id order.
    pub fn to_key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = key.try_into().ok()?;
        Some(ObjectId(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn name_key(name: &str) -> NormalisedValue {
    NormalisedValue::from_value(&Value::from(name))
}

fn load_collection_page(tx: &TransactionScope, handle: PageHandle) -> StorageResult<PageBuffer> {
    let page = tx.load(handle)?;
    page.expect_type(&[PageType::Collection])?;
    Ok(page)
}

pub struct Catalog {
    tree: BTree,
}

impl Catalog {
    pub fn open(anchor: PageHandle) -> Self {
        Self {
            tree: BTree::open(anchor),
        }
    }

    /// Creates an empty collection; `None` if the name is taken.
    pub fn create_collection(
        &self,
        tx: &TransactionScope,
        name: &str,
    ) -> StorageResult<Option<Collection>> {
        let key = name_key(name);
        if self.tree.contains(tx, &key)? {
            return Ok(None);
        }

        let objects = BTree::create(tx, TreeKind::Object)?;
        let handle = tx.allocate()?;
        let mut page = PageBuffer::new(handle, PageType::Collection);
        CollectionPage::init(&mut page, objects.anchor());
        tx.save(&page)?;
        self.tree.insert(tx, &key, &handle.0.to_le_bytes())?;
        debug!("created collection {:?} at {}", name, handle);

        Ok(Some(Collection {
            name: name.to_string(),
            page: handle,
        }))
    }

    pub fn collection(&self, tx: &TransactionScope, name: &str) -> StorageResult<Option<Collection>> {
        let Some(data) = self.tree.get(tx, &name_key(name))? else {
            return Ok(None);
        };
        Ok(Some(Collection {
            name: name.to_string(),
            page: PageHandle::read(&data, 0),
        }))
    }

    /// Removes a collection and frees every page it owns.
    pub fn drop_collection(&self, tx: &TransactionScope, name: &str) -> StorageResult<bool> {
        let Some(collection) = self.collection(tx, name)? else {
            return Ok(false);
        };
        let page = load_collection_page(tx, collection.page)?;
        let view = CollectionPage::new(&page);
        for (_, anchor) in view.indexes() {
            BTree::open(anchor).destroy(tx)?;
        }
        BTree::open(view.objects()).destroy(tx)?;
        tx.deallocate(collection.page)?;
        self.tree.remove(tx, &name_key(name))?;
        debug!("dropped collection {:?}", name);
        Ok(true)
    }

    /// Collection names in sorted order.
    pub fn collection_names(&self, tx: &TransactionScope) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in self.tree.iter(tx, Direction::Forward)? {
            let (key, _) = entry?;
            match NormalisedValueSpan::new(&key).decode().as_deref() {
                Some([Value::String(name)]) => names.push(name.clone()),
                _ => {
                    return Err(StorageError::Corrupted("catalog entry".to_string()))
                }
            }
        }
        Ok(names)
    }
}

/// A named set of objects plus the secondary indexes over them.
///
/// Callers that share a collection between threads lock
/// [`Collection::lock_target`] when beginning their transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    name: String,
    page: PageHandle,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page(&self) -> PageHandle {
        self.page
    }

    pub fn lock_target(&self) -> LockTarget {
        LockTarget(u64::from(self.page.0))
    }

    fn objects(&self, tx: &TransactionScope) -> StorageResult<BTree> {
        let page = load_collection_page(tx, self.page)?;
        Ok(BTree::open(CollectionPage::new(&page).objects()))
    }

    /// Stores `value` under the next object id.
    pub fn insert<V: ValueBuffer + ?Sized>(
        &self,
        tx: &TransactionScope,
        value: &V,
    ) -> StorageResult<ObjectId> {
        let mut page = load_collection_page(tx, self.page)?;
        let (objects, id) = {
            let view = CollectionPage::new(&page);
            (BTree::open(view.objects()), ObjectId(view.next_object_id()))
        };
        CollectionPage::new(&mut page).set_next_object_id(id.0 + 1);
        tx.save(&page)?;

        let inserted = objects.insert(tx, &id.to_key(), value.as_bytes())?;
        debug_assert!(inserted, "object ids are never reused");
        Ok(id)
    }

    pub fn get(&self, tx: &TransactionScope, id: ObjectId) -> StorageResult<Option<Vec<u8>>> {
        self.objects(tx)?.get(tx, &id.to_key())
    }

    pub fn update<V: ValueBuffer + ?Sized>(
        &self,
        tx: &TransactionScope,
        id: ObjectId,
        value: &V,
    ) -> StorageResult<bool> {
        self.objects(tx)?.update(tx, &id.to_key(), value.as_bytes())
    }

    pub fn remove(&self, tx: &TransactionScope, id: ObjectId) -> StorageResult<bool> {
        self.objects(tx)?.remove(tx, &id.to_key())
    }

    pub fn len(&self, tx: &TransactionScope) -> StorageResult<u64> {
        self.objects(tx)?.len(tx)
    }

    pub fn is_empty(&self, tx: &TransactionScope) -> StorageResult<bool> {
        Ok(self.len(tx)? == 0)
    }

    /// Every object in id order.
    pub fn scan<'t>(
        &self,
        tx: &'t TransactionScope,
        direction: Direction,
    ) -> StorageResult<impl Iterator<Item = StorageResult<(ObjectId, Vec<u8>)>> + 't> {
        let cursor = self.objects(tx)?.iter(tx, direction)?;
        Ok(cursor.map(|entry| {
            let (key, value) = entry?;
            let id = ObjectId::from_key(&key)
                .ok_or_else(|| StorageError::Corrupted("object key".to_string()))?;
            Ok((id, value))
        }))
    }

    /// Creates an empty index tree; `None` if the name is taken or the
    /// collection page has no room for another index.
    pub fn create_index(&self, tx: &TransactionScope, name: &str) -> StorageResult<Option<BTree>> {
        let mut page = load_collection_page(tx, self.page)?;
        if CollectionPage::new(&page).index(name).is_some() {
            return Ok(None);
        }
        let tree = BTree::create(tx, TreeKind::Index)?;
        if !CollectionPage::new(&mut page).try_add_index(name, tree.anchor()) {
            tree.destroy(tx)?;
            return Ok(None);
        }
        tx.save(&page)?;
        debug!("created index {:?} on collection {:?}", name, self.name);
        Ok(Some(tree))
    }

    pub fn index(&self, tx: &TransactionScope, name: &str) -> StorageResult<Option<BTree>> {
        let page = load_collection_page(tx, self.page)?;
        Ok(CollectionPage::new(&page).index(name).map(BTree::open))
    }

    pub fn indexes(&self, tx: &TransactionScope) -> StorageResult<Vec<(String, BTree)>> {
        let page = load_collection_page(tx, self.page)?;
        Ok(CollectionPage::new(&page)
            .indexes()
            .into_iter()
            .map(|(name, anchor)| (name, BTree::open(anchor)))
            .collect())
    }

    pub fn drop_index(&self, tx: &TransactionScope, name: &str) -> StorageResult<bool> {
        let mut page = load_collection_page(tx, self.page)?;
        let Some(anchor) = CollectionPage::new(&page).index(name) else {
            return Ok(false);
        };
        BTree::open(anchor).destroy(tx)?;
        CollectionPage::new(&mut page).try_remove_index(name);
        tx.save(&page)?;
        Ok(true)
    }

    /// Index tree key for an object: the normalised `values` followed by the
    /// object id, so objects with equal values keep distinct entries in id
    /// order.
    pub fn index_key(values: &[Value], id: ObjectId) -> NormalisedValue {
        let mut key = NormalisedValue::composite(values);
        key.push_raw(&id.to_key());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::concurrency::LockManager;
    use crate::storage::allocator::CATALOG_ANCHOR_PAGE;
    use crate::storage::{MemoryStorage, PageAllocator, WalBuffer, WalConfig};
    use crate::transaction::{TransactionManager, TransactionOptions};

    fn setup() -> (Arc<TransactionManager>, Arc<PageAllocator>, Catalog) {
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
        let catalog = Catalog::open(allocator.metadata_root().unwrap());
        (manager, allocator, catalog)
    }

    #[test]
    fn test_catalog_anchor_is_formatted() {
        let (_, allocator, _) = setup();
        assert_eq!(allocator.metadata_root().unwrap(), CATALOG_ANCHOR_PAGE);
    }

    #[test]
    fn test_create_and_list_collections() {
        let (manager, _, catalog) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        assert!(catalog.create_collection(&tx, "users").unwrap().is_some());
        assert!(catalog.create_collection(&tx, "orders").unwrap().is_some());
        assert!(catalog.create_collection(&tx, "users").unwrap().is_none());
        tx.commit().unwrap();

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        assert_eq!(
            catalog.collection_names(&tx).unwrap(),
            vec!["orders".to_string(), "users".to_string()]
        );
        assert!(catalog.collection(&tx, "missing").unwrap().is_none());
        assert_eq!(catalog.collection(&tx, "users").unwrap().unwrap().name(), "users");
    }

    #[test]
    fn test_undecodable_catalog_key_is_corruption() {
        let (manager, _, catalog) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        assert!(catalog.tree.insert(&tx, &[0xEE, 0x01], &[0u8; 4]).unwrap());
        assert!(matches!(
            catalog.collection_names(&tx),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn test_collection_objects() {
        let (manager, _, catalog) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let users = catalog.create_collection(&tx, "users").unwrap().unwrap();
        let alice = users.insert(&tx, "alice").unwrap();
        let bob = users.insert(&tx, &vec![7u8; 2000]).unwrap();
        assert_eq!(alice, ObjectId(1));
        assert_eq!(bob, ObjectId(2));
        tx.commit().unwrap();

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let users = catalog.collection(&tx, "users").unwrap().unwrap();
        assert_eq!(users.get(&tx, alice).unwrap(), Some(b"alice".to_vec()));
        assert_eq!(users.get(&tx, bob).unwrap(), Some(vec![7u8; 2000]));
        assert!(users.update(&tx, alice, "alice v2").unwrap());
        assert!(users.remove(&tx, bob).unwrap());
        assert!(!users.remove(&tx, bob).unwrap());
        let carol = users.insert(&tx, "carol").unwrap();
        assert_eq!(carol, ObjectId(3));

        let scanned: Vec<(ObjectId, Vec<u8>)> = users
            .scan(&tx, Direction::Forward)
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();
        assert_eq!(
            scanned,
            vec![(alice, b"alice v2".to_vec()), (carol, b"carol".to_vec())]
        );
        assert_eq!(users.len(&tx).unwrap(), 2);
    }

    #[test]
    fn test_indexes() {
        let (manager, _, catalog) = setup();
        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let users = catalog.create_collection(&tx, "users").unwrap().unwrap();
        let by_age = users.create_index(&tx, "by_age").unwrap().unwrap();
        assert!(users.create_index(&tx, "by_age").unwrap().is_none());

        for (age, id) in [(30i64, 1u64), (25, 2), (30, 3)] {
            let key = Collection::index_key(&[Value::Integer(age)], ObjectId(id));
            assert!(by_age.insert(&tx, &key, &[]).unwrap());
        }
        let ids: Vec<u64> = by_age
            .iter(&tx, Direction::Forward)
            .unwrap()
            .map(|entry| {
                let (key, _) = entry.unwrap();
                ObjectId::from_key(&key[key.len() - 8..]).unwrap().0
            })
            .collect();
        assert_eq!(ids, vec![2, 1, 3]);

        assert_eq!(users.index(&tx, "by_age").unwrap(), Some(by_age));
        assert_eq!(users.indexes(&tx).unwrap().len(), 1);
        assert!(users.drop_index(&tx, "by_age").unwrap());
        assert!(!users.drop_index(&tx, "by_age").unwrap());
        assert!(users.index(&tx, "by_age").unwrap().is_none());
    }

    #[test]
    fn test_drop_collection_frees_pages() {
        let (manager, allocator, catalog) = setup();
        let baseline = allocator.live_handles().unwrap().len();

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        let users = catalog.create_collection(&tx, "users").unwrap().unwrap();
        users.create_index(&tx, "by_name").unwrap().unwrap();
        for i in 0..300u32 {
            users.insert(&tx, &vec![i as u8; 700]).unwrap();
        }
        tx.commit().unwrap();

        let tx = manager.begin(TransactionOptions::new()).unwrap();
        assert!(catalog.drop_collection(&tx, "users").unwrap());
        assert!(!catalog.drop_collection(&tx, "users").unwrap());
        tx.commit().unwrap();

        // The catalog's own root leaf was freed along with the collection.
        assert_eq!(allocator.live_handles().unwrap().len(), baseline);
    }
}
