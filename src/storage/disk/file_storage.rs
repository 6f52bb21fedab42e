use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::storage::disk::Storage;
use crate::storage::error::{StorageError, StorageResult};

/// [`Storage`] over a regular file.
pub struct FileStorage {
    file: Mutex<File>,
}

impl FileStorage {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Opens an existing file.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StorageError::DatabaseDoesNotExist {
                    path: path.display().to_string(),
                },
                _ => StorageError::Io(e),
            })?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Opens the file at `path`, creating an empty one when missing.
    pub fn open_or_create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl Storage for FileStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => StorageError::UnexpectedEndOfFile { offset },
            _ => StorageError::Io(e),
        })
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn persist(&self) -> StorageResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn truncate(&self, len: u64) -> StorageResult<()> {
        let file = self.file.lock();
        if file.metadata()?.len() > len {
            file.set_len(len)?;
        }
        Ok(())
    }

    fn set_len(&self, len: u64) -> StorageResult<()> {
        self.file.lock().set_len(len)?;
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}
