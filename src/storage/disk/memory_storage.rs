use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::disk::Storage;
use crate::storage::error::{StorageError, StorageResult};

/// In-memory [`Storage`].
///
/// Clones share the same bytes, so a handle kept aside survives the
/// database that used it. [`MemoryStorage::fork`] copies the current bytes
/// into an independent storage, which is how tests capture the state a
/// process crash would leave behind.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Independent storage holding a copy of the current contents.
    pub fn fork(&self) -> Self {
        Self::from_bytes(self.to_bytes())
    }

    /// Flips one bit in place.
    pub fn flip_bit(&self, offset: u64, bit: u8) {
        let mut data = self.data.lock();
        data[offset as usize] ^= 1 << bit;
    }
}

impl Storage for MemoryStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(StorageError::UnexpectedEndOfFile { offset });
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn persist(&self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&self, len: u64) -> StorageResult<()> {
        self.data.lock().truncate(len as usize);
        Ok(())
    }

    fn set_len(&self, len: u64) -> StorageResult<()> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.data.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_extends() {
        let storage = MemoryStorage::new();
        storage.write_at(10, &[1, 2, 3]).unwrap();
        assert_eq!(storage.len().unwrap(), 13);

        let mut buf = [0u8; 3];
        storage.read_at(10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_fork_is_independent() {
        let storage = MemoryStorage::new();
        storage.write_at(0, &[1]).unwrap();

        let forked = storage.fork();
        storage.write_at(0, &[2]).unwrap();

        let mut buf = [0u8; 1];
        forked.read_at(0, &mut buf).unwrap();
        assert_eq!(buf[0], 1);

        let shared = storage.clone();
        shared.read_at(0, &mut buf).unwrap();
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn test_flip_bit_and_read_past_end() {
        let storage = MemoryStorage::from_bytes(vec![0u8; 8]);
        storage.flip_bit(3, 7);
        assert_eq!(storage.to_bytes()[3], 0x80);

        let mut buf = [0u8; 4];
        assert!(matches!(
            storage.read_at(6, &mut buf),
            Err(StorageError::UnexpectedEndOfFile { offset: 6 })
        ));
    }
}
