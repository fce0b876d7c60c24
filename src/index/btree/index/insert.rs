use log::trace;

use crate::common::types::{PageId, PagePtr, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::base::{AccessMode, BTreeIndex};
use crate::index::btree::key::IndexKey;
use crate::index::btree::latch::PageSet;
use crate::index::btree::node::{self, InternalMut, InternalRef, LeafMut};

impl<K: IndexKey> BTreeIndex<K> {
    /// Insert a unique key. Returns false (and changes nothing) if the key
    /// is already present.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        loop {
            {
                let mut root = self.root.lock();
                if *root == INVALID_PAGE_ID {
                    self.start_new_tree(&mut root, key, rid)?;
                    return Ok(true);
                }
            }

            let mut ctx = PageSet::new(self.buffer_pool.clone());
            if !self.find_leaf(&key, AccessMode::Insert, &mut ctx)? {
                // the tree emptied out between the root check and descent
                continue;
            }
            return self.insert_into_leaf(key, rid, &mut ctx);
        }
    }

    fn insert_into_leaf(&self, key: K, rid: Rid, ctx: &mut PageSet) -> Result<bool, BTreeError> {
        let leaf_idx = ctx.len() - 1;

        {
            let data = ctx.write_data(leaf_idx);
            if !LeafMut::<K>::new(data).insert(key, rid) {
                return Ok(false);
            }
        }
        ctx.mark_dirty(leaf_idx);

        if node::node_size(ctx.read_data(leaf_idx)) <= self.leaf_max_size {
            return Ok(true);
        }

        // Overflow: split the leaf and push the new sibling's first key up.
        let parent_id = node::node_parent(ctx.read_data(leaf_idx));
        let (right_page, right_id) = self.buffer_pool.new_page()?;
        let separator = {
            let mut right_guard = right_page.write();
            let mut right = LeafMut::<K>::init(
                &mut right_guard.data,
                right_id,
                parent_id,
                self.leaf_max_size,
            );
            let left_data = ctx.write_data(leaf_idx);
            let mut left = LeafMut::<K>::new(left_data);
            left.split_into(&mut right);
            right.as_ref().key_at(0)
        };
        trace!("leaf {} split, new sibling {}", ctx.page_id_at(leaf_idx), right_id);

        let result = self.insert_into_parent(ctx, leaf_idx, separator, right_id, &right_page);
        self.buffer_pool.unpin_page(right_id, true)?;
        result?;
        Ok(true)
    }

    /// Link a freshly split-off sibling into the tree. `node_idx` names the
    /// split (left) node inside `ctx`; `right_page` is pinned by the caller
    /// and unlatched, which is fine because nothing else can reach it until
    /// it hangs off a parent we have latched.
    fn insert_into_parent(
        &self,
        ctx: &mut PageSet,
        node_idx: usize,
        separator: K,
        right_id: PageId,
        right_page: &PagePtr,
    ) -> Result<(), BTreeError> {
        let node_page_id = ctx.page_id_at(node_idx);
        let parent_id = node::node_parent(ctx.read_data(node_idx));

        if parent_id == INVALID_PAGE_ID {
            // The split node was the root: grow the tree by one level.
            let (root_page, root_id) = self.buffer_pool.new_page()?;
            {
                let mut guard = root_page.write();
                let mut root = InternalMut::<K>::init(
                    &mut guard.data,
                    root_id,
                    INVALID_PAGE_ID,
                    self.internal_max_size,
                );
                root.populate_new_root(node_page_id, separator, right_id);
            }
            node::set_node_parent(ctx.write_data(node_idx), root_id);
            ctx.mark_dirty(node_idx);
            {
                let mut right_guard = right_page.write();
                node::set_node_parent(&mut right_guard.data, root_id);
            }
            {
                let mut root = self.root.lock();
                *root = root_id;
                self.sync_root_to_header(root_id)?;
            }
            trace!("tree grew: new root {}", root_id);
            self.buffer_pool.unpin_page(root_id, true)?;
            return Ok(());
        }

        // The node was unsafe on descent, so its parent is still latched
        // directly above it.
        debug_assert!(node_idx >= 1 && ctx.page_id_at(node_idx - 1) == parent_id);
        let parent_idx = node_idx - 1;

        {
            let parent_data = ctx.write_data(parent_idx);
            InternalMut::<K>::new(parent_data).insert(separator, right_id);
        }
        ctx.mark_dirty(parent_idx);
        {
            let mut right_guard = right_page.write();
            node::set_node_parent(&mut right_guard.data, parent_id);
        }

        if node::node_size(ctx.read_data(parent_idx)) <= self.internal_max_size {
            return Ok(());
        }

        // Parent overflowed in turn: distribute its children across a new
        // sibling and recurse with the median separator.
        let entries = InternalRef::<K>::new(ctx.read_data(parent_idx)).collect_entries();
        let left_count = entries.len().div_ceil(2);
        let median = entries[left_count].0;

        let parent_parent = node::node_parent(ctx.read_data(parent_idx));
        let (new_page, new_id) = self.buffer_pool.new_page()?;
        {
            let mut guard = new_page.write();
            let mut new_internal = InternalMut::<K>::init(
                &mut guard.data,
                new_id,
                parent_parent,
                self.internal_max_size,
            );
            new_internal.write_entries(&entries[left_count..]);
        }
        {
            let parent_data = ctx.write_data(parent_idx);
            InternalMut::<K>::new(parent_data).write_entries(&entries[..left_count]);
        }

        for &(_, child) in &entries[left_count..] {
            if child == node_page_id {
                node::set_node_parent(ctx.write_data(node_idx), new_id);
                ctx.mark_dirty(node_idx);
            } else if child == right_id {
                let mut right_guard = right_page.write();
                node::set_node_parent(&mut right_guard.data, new_id);
            } else {
                self.reassign_parent(child, new_id)?;
            }
        }

        let result = self.insert_into_parent(ctx, parent_idx, median, new_id, &new_page);
        self.buffer_pool.unpin_page(new_id, true)?;
        result
    }

    /// Point a child page at a new parent. The child is not on the latched
    /// path, so a short write latch here cannot deadlock: writers below the
    /// held ancestors are excluded, and readers only ever move downward.
    pub(crate) fn reassign_parent(
        &self,
        child_id: PageId,
        parent_id: PageId,
    ) -> Result<(), BTreeError> {
        let child_page = self.buffer_pool.fetch_page(child_id)?;
        {
            let mut guard = child_page.write();
            node::set_node_parent(&mut guard.data, parent_id);
        }
        self.buffer_pool.unpin_page(child_id, true)?;
        Ok(())
    }
}
