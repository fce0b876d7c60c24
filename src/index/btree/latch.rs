//! Latch bookkeeping for tree traversals.
//!
//! A `PageSet` records every page a traversal has latched, in acquisition
//! order. Crabbing releases ancestors through it once a child is safe, and
//! dropping the set releases whatever is still held, so error paths unwind
//! without leaking latches or pins. Pages queued for deletion are dropped
//! through the buffer pool after their latches are released.

use std::sync::Arc;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::storage::buffer::BufferPoolManager;

pub(crate) enum PageLatch {
    Read(ArcRwLockReadGuard<RawRwLock, Page>),
    Write(ArcRwLockWriteGuard<RawRwLock, Page>),
}

struct LatchedPage {
    page_id: PageId,
    latch: PageLatch,
    dirty: bool,
}

pub(crate) struct PageSet {
    buffer_pool: Arc<BufferPoolManager>,
    pages: Vec<LatchedPage>,
    deleted: Vec<PageId>,
}

impl PageSet {
    pub fn new(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            pages: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn push(&mut self, page_id: PageId, latch: PageLatch) {
        self.pages.push(LatchedPage {
            page_id,
            latch,
            dirty: false,
        });
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn page_id_at(&self, index: usize) -> PageId {
        self.pages[index].page_id
    }

    pub fn mark_dirty(&mut self, index: usize) {
        self.pages[index].dirty = true;
    }

    /// Queue a page for deletion once every latch and pin is released.
    pub fn defer_delete(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    pub fn read_data(&self, index: usize) -> &[u8; PAGE_SIZE] {
        match &self.pages[index].latch {
            PageLatch::Read(guard) => &guard.data,
            PageLatch::Write(guard) => &guard.data,
        }
    }

    /// Mutable page bytes at `index`. Panics if the page was read-latched;
    /// write access without a write latch is a protocol violation.
    pub fn write_data(&mut self, index: usize) -> &mut [u8; PAGE_SIZE] {
        match &mut self.pages[index].latch {
            PageLatch::Read(_) => panic!("write access to a read-latched page"),
            PageLatch::Write(guard) => &mut guard.data,
        }
    }

    /// Unlatch and unpin every held page except the most recent, oldest
    /// first. Used when a newly latched child turns out to be safe.
    pub fn release_ancestors(&mut self) {
        if self.pages.len() <= 1 {
            return;
        }
        let last = self.pages.pop().unwrap();
        self.release_held();
        self.pages.push(last);
    }

    /// Unlatch and unpin the most recently pushed page.
    pub fn pop(&mut self) {
        if let Some(held) = self.pages.pop() {
            let LatchedPage { page_id, latch, dirty } = held;
            drop(latch);
            // unpin failures indicate pool-level corruption; surface loudly
            self.buffer_pool
                .unpin_page(page_id, dirty)
                .expect("unpin of a latched page failed");
        }
    }

    /// Release everything in FIFO order, then drop deferred deletions. A
    /// deletion is skipped if a stale leaf-chain reader re-pinned the dead
    /// page in the meantime; the page is merely leaked until restart.
    pub fn release_all(&mut self) {
        self.release_held();
        for page_id in std::mem::take(&mut self.deleted) {
            if let Err(e) = self.buffer_pool.delete_page(page_id) {
                log::debug!("deferred delete of page {} skipped: {}", page_id, e);
            }
        }
    }

    fn release_held(&mut self) {
        for held in self.pages.drain(..) {
            let LatchedPage { page_id, latch, dirty } = held;
            drop(latch);
            self.buffer_pool
                .unpin_page(page_id, dirty)
                .expect("unpin of a latched page failed");
        }
    }
}

impl Drop for PageSet {
    fn drop(&mut self) {
        self.release_all();
    }
}
