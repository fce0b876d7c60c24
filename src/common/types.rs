use std::fmt;
use std::sync::Arc;
use parking_lot::RwLock;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type. Page ids are 1-based; 0 is reserved as the invalid id.
pub type PageId = u32;

/// Sentinel for "no page".
pub const INVALID_PAGE_ID: PageId = 0;

/// The header page sits at the start of the database file and records
/// `(index name, root page id)` entries.
pub const HEADER_PAGE_ID: PageId = 1;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Transaction ID type
pub type TxnId = u32;

/// Sentinel for "no transaction" (used by the lock queue upgrade slot).
pub const INVALID_TXN_ID: TxnId = TxnId::MAX;

/// Table object ID type
pub type TableOid = u32;

/// Record identifier: the page a tuple lives on plus its slot within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot)
    }
}

/// Page structure: a raw byte buffer plus the id of the page it holds.
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Zero the payload. Called when a frame is recycled for a fresh page.
    pub fn reset(&mut self) {
        self.data = [0; PAGE_SIZE];
    }
}

/// Smart pointer to a page. The `RwLock` is the page latch: callers that
/// hold a pin may take it to read or mutate the page bytes.
pub type PagePtr = Arc<RwLock<Page>>;
