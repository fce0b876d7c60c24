use std::marker::PhantomData;
use std::sync::Arc;
use parking_lot::{ArcRwLockReadGuard, RawRwLock};

use crate::common::types::{Page, PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::base::BTreeIndex;
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{self, InternalRef, LeafRef};
use crate::storage::buffer::BufferPoolManager;

/// Forward iterator over the leaf chain.
///
/// Holds a read latch and a pin on the current leaf. Stepping off a leaf
/// releases it *before* latching its successor; holding both would deadlock
/// against a writer merging the successor leftward.
pub struct BTreeIterator<K: IndexKey> {
    buffer_pool: Arc<BufferPoolManager>,
    leaf: Option<(PageId, ArcRwLockReadGuard<RawRwLock, Page>)>,
    index: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BTreeIterator<K> {
    fn exhausted(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            leaf: None,
            index: 0,
            _marker: PhantomData,
        }
    }

    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// The entry under the cursor, or `None` at end.
    pub fn current(&self) -> Option<(K, Rid)> {
        let (_, guard) = self.leaf.as_ref()?;
        let view = LeafRef::<K>::new(&guard.data);
        Some((view.key_at(self.index), view.rid_at(self.index)))
    }

    /// Step to the next entry, following the leaf chain as needed.
    pub fn advance(&mut self) -> Result<(), BTreeError> {
        if self.leaf.is_some() {
            self.index += 1;
            self.skip_exhausted_leaves()?;
        }
        Ok(())
    }

    /// Move rightward until the cursor points at a real entry or the chain
    /// ends. No-op when the current position is already valid.
    fn skip_exhausted_leaves(&mut self) -> Result<(), BTreeError> {
        let Some((mut page_id, mut guard)) = self.leaf.take() else {
            return Ok(());
        };
        loop {
            if self.index < node::node_size(&guard.data) {
                self.leaf = Some((page_id, guard));
                return Ok(());
            }
            let next = node::leaf_next_page_id(&guard.data);
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
            if next == INVALID_PAGE_ID {
                return Ok(());
            }
            let next_page = self.buffer_pool.fetch_page(next)?;
            guard = next_page.read_arc();
            page_id = next;
            self.index = 0;
        }
    }
}

impl<K: IndexKey> Drop for BTreeIterator<K> {
    fn drop(&mut self) {
        if let Some((page_id, guard)) = self.leaf.take() {
            drop(guard);
            let _ = self.buffer_pool.unpin_page(page_id, false);
        }
    }
}

impl<K: IndexKey> BTreeIndex<K> {
    /// Iterator positioned at the first entry of the index.
    pub fn begin(&self) -> Result<BTreeIterator<K>, BTreeError> {
        let mut iter = self.descend_for_scan(None)?;
        iter.skip_exhausted_leaves()?;
        Ok(iter)
    }

    /// Iterator positioned at the first entry with key `>= key`.
    pub fn begin_at(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        let mut iter = self.descend_for_scan(Some(key))?;
        if let Some((_, guard)) = &iter.leaf {
            iter.index = LeafRef::<K>::new(&guard.data).lower_bound(key);
        }
        iter.skip_exhausted_leaves()?;
        Ok(iter)
    }

    /// The past-the-end iterator.
    pub fn end(&self) -> BTreeIterator<K> {
        BTreeIterator::exhausted(self.buffer_pool.clone())
    }

    /// Read-crab down to the leftmost leaf, or to the leaf owning `key`.
    fn descend_for_scan(&self, key: Option<&K>) -> Result<BTreeIterator<K>, BTreeError> {
        let (mut page_id, mut guard) = loop {
            let root_id = *self.root.lock();
            if root_id == INVALID_PAGE_ID {
                return Ok(BTreeIterator::exhausted(self.buffer_pool.clone()));
            }
            let page = self.buffer_pool.fetch_page(root_id)?;
            let guard = page.read_arc();
            if *self.root.lock() == root_id {
                break (root_id, guard);
            }
            drop(guard);
            self.buffer_pool.unpin_page(root_id, false)?;
        };

        loop {
            if node::node_is_leaf(&guard.data) {
                return Ok(BTreeIterator {
                    buffer_pool: self.buffer_pool.clone(),
                    leaf: Some((page_id, guard)),
                    index: 0,
                    _marker: PhantomData,
                });
            }

            let view = InternalRef::<K>::new(&guard.data);
            let child_id = match key {
                Some(k) => view.lookup(k),
                None => view.child_at(0),
            };

            let child_page = match self.buffer_pool.fetch_page(child_id) {
                Ok(page) => page,
                Err(e) => {
                    drop(guard);
                    let _ = self.buffer_pool.unpin_page(page_id, false);
                    return Err(e.into());
                }
            };
            let child_guard = child_page.read_arc();
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
            page_id = child_id;
            guard = child_guard;
        }
    }
}
