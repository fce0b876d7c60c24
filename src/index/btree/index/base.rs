use std::marker::PhantomData;
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::{PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::latch::{PageLatch, PageSet};
use crate::index::btree::node::{self, InternalRef, LeafMut};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;

/// What a traversal intends to do at the leaf. Determines the latch kind
/// taken on each node and when ancestors may be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessMode {
    Read,
    Insert,
    Delete,
}

/// A key-unique B+Tree index layered over the buffer pool.
///
/// Traversals follow latch crabbing: reads hold at most one ancestor latch
/// while stepping down; writes keep the latched path from the topmost
/// unsafe ancestor and release everything above the first safe node. The
/// root page id lives behind a tree-level mutex because splits and
/// collapses move it; traversals re-validate it after latching.
pub struct BTreeIndex<K: IndexKey> {
    pub(crate) name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) root: Mutex<PageId>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    pub(crate) _marker: PhantomData<K>,
}

impl<K: IndexKey> BTreeIndex<K> {
    /// Open (or register) the named index. The root page id is loaded from
    /// the header page; a fresh index starts empty with no root.
    ///
    /// Node pages transiently hold `max_size + 1` entries between an insert
    /// and the split it triggers, so the sizes must leave room for one
    /// extra entry.
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        name: &str,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        let leaf_bytes = node::LEAF_HEADER_SIZE + (leaf_max_size + 1) * (K::ENCODED_LEN + 8);
        let internal_bytes =
            node::INTERNAL_HEADER_SIZE + (internal_max_size + 1) * (K::ENCODED_LEN + 4);
        if leaf_max_size < 2
            || internal_max_size < 3
            || leaf_bytes > PAGE_SIZE
            || internal_bytes > PAGE_SIZE
        {
            return Err(BTreeError::NodeTooLarge {
                leaf: leaf_max_size,
                internal: internal_max_size,
            });
        }

        let header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let (root_id, registered) = {
            let mut page = header.write();
            let mut header_page = HeaderPage::new(&mut page.data);
            match header_page.get_root_page_id(name) {
                Some(id) => (id, false),
                None => {
                    if !header_page.insert_record(name, INVALID_PAGE_ID) {
                        drop(page);
                        buffer_pool.unpin_page(HEADER_PAGE_ID, false)?;
                        return Err(BTreeError::HeaderFull(name.to_string()));
                    }
                    (INVALID_PAGE_ID, true)
                }
            }
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, registered)?;

        Ok(Self {
            name: name.to_string(),
            buffer_pool,
            root: Mutex::new(root_id),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root.lock() == INVALID_PAGE_ID
    }

    /// Rewrite this index's header-page record. Called with the root mutex
    /// held, immediately after the in-memory root changes.
    pub(crate) fn sync_root_to_header(&self, root: PageId) -> Result<(), BTreeError> {
        let header = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page = header.write();
            let mut header_page = HeaderPage::new(&mut page.data);
            header_page.update_record(&self.name, root);
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// A node is safe when the pending mutation cannot propagate to its
    /// parent: an insert cannot split it, a delete cannot underflow it.
    pub(crate) fn is_safe(data: &[u8], mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => true,
            AccessMode::Insert => node::node_size(data) < node::node_max_size(data),
            AccessMode::Delete => {
                if node::node_parent(data) == INVALID_PAGE_ID {
                    if node::node_is_leaf(data) {
                        true
                    } else {
                        node::node_size(data) > 2
                    }
                } else {
                    node::node_size(data) > node::node_min_size(data)
                }
            }
        }
    }

    /// Descend to the leaf that owns `key`, latching per `mode`. On success
    /// the leaf is the last page in `ctx` and, for writes, every retained
    /// ancestor above it is still write-latched. Returns false on an empty
    /// tree.
    pub(crate) fn find_leaf(
        &self,
        key: &K,
        mode: AccessMode,
        ctx: &mut PageSet,
    ) -> Result<bool, BTreeError> {
        // Latch the root, then confirm it is still the root: a concurrent
        // split or collapse may have moved it while we waited.
        loop {
            let root_id = *self.root.lock();
            if root_id == INVALID_PAGE_ID {
                return Ok(false);
            }
            let page = self.buffer_pool.fetch_page(root_id)?;
            let latch = match mode {
                AccessMode::Read => PageLatch::Read(page.read_arc()),
                _ => PageLatch::Write(page.write_arc()),
            };
            ctx.push(root_id, latch);
            if *self.root.lock() == root_id {
                break;
            }
            ctx.pop();
        }

        loop {
            let last = ctx.len() - 1;
            let child_id = {
                let data = ctx.read_data(last);
                if node::node_is_leaf(data) {
                    return Ok(true);
                }
                InternalRef::<K>::new(data).lookup(key)
            };

            let child_page = self.buffer_pool.fetch_page(child_id)?;
            match mode {
                AccessMode::Read => {
                    ctx.push(child_id, PageLatch::Read(child_page.read_arc()));
                    ctx.release_ancestors();
                }
                AccessMode::Insert | AccessMode::Delete => {
                    ctx.push(child_id, PageLatch::Write(child_page.write_arc()));
                    if Self::is_safe(ctx.read_data(ctx.len() - 1), mode) {
                        ctx.release_ancestors();
                    }
                }
            }
        }
    }

    /// Initialize a single-entry root leaf. Caller holds the root mutex and
    /// has verified the tree is empty.
    pub(crate) fn start_new_tree(
        &self,
        root: &mut PageId,
        key: K,
        rid: Rid,
    ) -> Result<(), BTreeError> {
        let (page, page_id) = self.buffer_pool.new_page()?;
        {
            let mut guard = page.write();
            let mut leaf =
                LeafMut::<K>::init(&mut guard.data, page_id, INVALID_PAGE_ID, self.leaf_max_size);
            leaf.insert(key, rid);
        }
        self.sync_root_to_header(page_id)?;
        *root = page_id;
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }
}
