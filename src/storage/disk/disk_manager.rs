use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager handles the actual disk I/O. It treats the database file as a
/// flat array of fixed-size pages; page ids are 1-based file offsets.
pub struct DiskManager {
    db_file: Mutex<File>,
}

impl DiskManager {
    /// Create a new DiskManager over the given database file, creating the
    /// file if it does not exist yet.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        Ok(Self {
            db_file: Mutex::new(file),
        })
    }

    /// Read a page's bytes from disk into `buf`. Reading a page the file has
    /// never been extended to yields a zeroed page.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write a page's bytes to disk and flush.
    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock();

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(())
    }

    /// Allocate a new page at the end of the file and return its ID.
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        let new_page_id = (file_size / PAGE_SIZE as u64) as PageId + 1;

        file.seek(SeekFrom::End(0))?;
        let zeros = [0u8; PAGE_SIZE];
        file.write_all(&zeros)?;
        file.flush()?;

        Ok(new_page_id)
    }

    /// Number of pages the file currently holds.
    pub fn num_pages(&self) -> Result<u64, DiskManagerError> {
        let file = self.db_file.lock();
        Ok(file.metadata()?.len() / PAGE_SIZE as u64)
    }

    fn page_offset(page_id: PageId) -> u64 {
        (page_id as u64 - 1) * PAGE_SIZE as u64
    }
}
