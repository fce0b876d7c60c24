use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{PageId, PAGE_SIZE};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_LEN: usize = 32;
const RECORD_SIZE: usize = NAME_LEN + 4;

/// Maximum number of `(index name, root page id)` records a header page holds.
pub const MAX_HEADER_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// View over the database header page: a counted array of
/// `(index name, root page id)` records. Names longer than 32 bytes are
/// rejected by the caller-facing operations.
pub struct HeaderPage<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> HeaderPage<'a> {
    pub fn new(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn init(&mut self) {
        self.data.fill(0);
    }

    pub fn record_count(&self) -> usize {
        LittleEndian::read_u32(&self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]) as usize
    }

    fn set_record_count(&mut self, count: usize) {
        LittleEndian::write_u32(
            &mut self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4],
            count as u32,
        );
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    fn name_at(&self, index: usize) -> &[u8] {
        let off = Self::record_offset(index);
        let name = &self.data[off..off + NAME_LEN];
        let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        &name[..end]
    }

    fn find(&self, name: &str) -> Option<usize> {
        (0..self.record_count()).find(|&i| self.name_at(i) == name.as_bytes())
    }

    /// Register a new index. Returns false if the name already exists, is too
    /// long, or the page is full.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        if name.len() > NAME_LEN || name.is_empty() {
            return false;
        }
        if self.find(name).is_some() {
            return false;
        }
        let count = self.record_count();
        if count >= MAX_HEADER_RECORDS {
            return false;
        }

        let off = Self::record_offset(count);
        self.data[off..off + NAME_LEN].fill(0);
        self.data[off..off + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(&mut self.data[off + NAME_LEN..off + RECORD_SIZE], root_page_id);
        self.set_record_count(count + 1);
        true
    }

    /// Update an existing index's root. Returns false if the name is unknown.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        let Some(index) = self.find(name) else {
            return false;
        };
        let off = Self::record_offset(index);
        LittleEndian::write_u32(&mut self.data[off + NAME_LEN..off + RECORD_SIZE], root_page_id);
        true
    }

    pub fn get_root_page_id(&self, name: &str) -> Option<PageId> {
        let index = self.find(name)?;
        let off = Self::record_offset(index);
        Some(LittleEndian::read_u32(
            &self.data[off + NAME_LEN..off + RECORD_SIZE],
        ))
    }
}
