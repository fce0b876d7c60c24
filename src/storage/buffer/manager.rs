use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use log::debug;

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

/// A buffer pool frame: the page slot plus its bookkeeping. The page bytes
/// are behind the page latch (`PagePtr`); the metadata here is only touched
/// under the pool latch.
struct Frame {
    page: PagePtr,
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

struct PoolState {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// Buffer pool manager: owns a fixed array of page frames, maps logical page
/// ids onto them, and delegates victim selection to the LRU-K replacer.
///
/// Callers receive a `PagePtr` whose validity contract is pin-based: the
/// bytes may only be latched between `fetch_page`/`new_page` and the
/// matching `unpin_page`. The pool latch is never held while a page latch is
/// taken; eviction may read a victim's bytes directly because a frame with
/// pin count zero has no outstanding borrowers.
pub struct BufferPoolManager {
    pool_size: usize,
    disk_manager: Arc<DiskManager>,
    replacer: LruKReplacer,
    state: Mutex<PoolState>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        db_path: impl AsRef<Path>,
        replacer_k: usize,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Self::with_disk_manager(pool_size, disk_manager, replacer_k)
    }

    pub fn with_disk_manager(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        replacer_k: usize,
    ) -> Result<Self, BufferPoolError> {
        // A fresh database file gets its header block up front, so page 1
        // stays reserved and ordinary allocation starts at page 2.
        if disk_manager.num_pages()? == 0 {
            disk_manager.allocate_page()?;
        }
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            frames.push(Frame::new());
            free_list.push_back(i as FrameId);
        }

        Ok(Self {
            pool_size,
            disk_manager,
            replacer: LruKReplacer::new(pool_size, replacer_k),
            state: Mutex::new(PoolState {
                frames,
                page_table: HashMap::with_capacity(pool_size),
                free_list,
            }),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a brand-new page and pin it into a frame. Fails with
    /// `PoolExhausted` when every frame is pinned.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = self.obtain_frame(&mut state)?;

        let page_id = self.disk_manager.allocate_page()?;

        let frame = &mut state.frames[frame_id as usize];
        frame.page_id = page_id;
        frame.pin_count = 1;
        frame.is_dirty = false;
        {
            let mut page = frame.page.write();
            page.reset();
            page.page_id = page_id;
        }
        let page = frame.page.clone();

        state.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        Ok((page, page_id))
    }

    /// Fetch a page, reading it from disk if it is not resident. Fails with
    /// `PoolExhausted` when it is absent and every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }

        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &mut state.frames[frame_id as usize];
            frame.pin_count += 1;
            let page = frame.page.clone();
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok(page);
        }

        let frame_id = self.obtain_frame(&mut state)?;
        let frame = &mut state.frames[frame_id as usize];
        frame.page_id = page_id;
        frame.pin_count = 1;
        frame.is_dirty = false;
        {
            let mut page = frame.page.write();
            self.disk_manager.read_page(page_id, &mut page.data)?;
            page.page_id = page_id;
        }
        let page = frame.page.clone();

        state.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        Ok(page)
    }

    /// Drop one pin on a page. `is_dirty` ORs into the frame's dirty flag;
    /// it never clears it. When the pin count reaches zero the frame becomes
    /// an eviction candidate.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();

        let &frame_id = state
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;
        let frame = &mut state.frames[frame_id as usize];

        if frame.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        frame.pin_count -= 1;
        frame.is_dirty |= is_dirty;
        if frame.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }

        Ok(())
    }

    /// Write a resident page back to disk and clear its dirty flag. Ignores
    /// pin state.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();

        let &frame_id = state
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;
        let frame = &mut state.frames[frame_id as usize];

        {
            let page = frame.page.read();
            self.disk_manager.write_page(page_id, &page.data)?;
        }
        frame.is_dirty = false;

        Ok(())
    }

    /// Flush every resident page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();

        for frame_id in 0..self.pool_size {
            let frame = &mut state.frames[frame_id];
            if frame.page_id == INVALID_PAGE_ID {
                continue;
            }
            {
                let page = frame.page.read();
                self.disk_manager.write_page(frame.page_id, &page.data)?;
            }
            frame.is_dirty = false;
        }

        Ok(())
    }

    /// Drop a page from the pool, returning its frame to the free list. A
    /// pinned page cannot be deleted; deleting an absent page is a no-op.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(());
        };
        let frame = &mut state.frames[frame_id as usize];

        if frame.pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        if frame.is_dirty {
            let page = frame.page.read();
            self.disk_manager.write_page(page_id, &page.data)?;
        }

        frame.page_id = INVALID_PAGE_ID;
        frame.pin_count = 0;
        frame.is_dirty = false;
        frame.page.write().reset();

        state.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        state.free_list.push_back(frame_id);

        Ok(())
    }

    /// Find a usable frame: free list first, then a replacer victim. An
    /// evicted dirty frame is written back before reuse.
    fn obtain_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.evict().ok_or(BufferPoolError::PoolExhausted)?;
        let frame = &mut state.frames[frame_id as usize];

        if frame.is_dirty {
            debug!("evicting dirty page {} from frame {}", frame.page_id, frame_id);
            let page = frame.page.read();
            self.disk_manager.write_page(frame.page_id, &page.data)?;
        }
        let old_page_id = frame.page_id;
        frame.is_dirty = false;
        frame.page_id = INVALID_PAGE_ID;
        state.page_table.remove(&old_page_id);

        Ok(frame_id)
    }
}
