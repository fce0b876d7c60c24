use log::trace;

use crate::common::types::INVALID_PAGE_ID;
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::base::{AccessMode, BTreeIndex};
use crate::index::btree::key::IndexKey;
use crate::index::btree::latch::PageSet;
use crate::index::btree::node::{self, InternalMut, InternalRef, LeafMut, LeafRef};

impl<K: IndexKey> BTreeIndex<K> {
    /// Delete a key. Absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut ctx = PageSet::new(self.buffer_pool.clone());
        if !self.find_leaf(key, AccessMode::Delete, &mut ctx)? {
            return Ok(());
        }

        let leaf_idx = ctx.len() - 1;
        let removed = {
            let data = ctx.write_data(leaf_idx);
            LeafMut::<K>::new(data).remove(key)
        };
        if !removed {
            return Ok(());
        }
        ctx.mark_dirty(leaf_idx);

        self.rebalance(&mut ctx)
    }

    /// Restore occupancy invariants for the last page in `ctx`, recursing
    /// upward when a merge removes a separator from the parent. Before each
    /// recursion the child level is popped, so the node under repair is
    /// always the deepest page still latched.
    fn rebalance(&self, ctx: &mut PageSet) -> Result<(), BTreeError> {
        let node_idx = ctx.len() - 1;
        let node_page_id = ctx.page_id_at(node_idx);
        let (is_leaf, size, min_size, parent_id) = {
            let data = ctx.read_data(node_idx);
            (
                node::node_is_leaf(data),
                node::node_size(data),
                node::node_min_size(data),
                node::node_parent(data),
            )
        };

        if parent_id == INVALID_PAGE_ID {
            return self.shrink_root(ctx, node_idx, is_leaf, size);
        }
        if size >= min_size {
            return Ok(());
        }

        debug_assert!(node_idx >= 1 && ctx.page_id_at(node_idx - 1) == parent_id);
        let parent_idx = node_idx - 1;

        // Pick an immediate sibling through the parent: the left one when it
        // exists, otherwise the right. `sep_pos` is the parent entry whose
        // key separates the pair.
        let child_pos = InternalRef::<K>::new(ctx.read_data(parent_idx))
            .child_index(node_page_id)
            .expect("node not referenced by its parent");
        let (sibling_pos, sep_pos, sibling_is_left) = if child_pos > 0 {
            (child_pos - 1, child_pos, true)
        } else {
            (1, 1, false)
        };
        let (sibling_id, sep_key) = {
            let parent = InternalRef::<K>::new(ctx.read_data(parent_idx));
            (parent.child_at(sibling_pos), parent.key_at(sep_pos))
        };

        let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
        let mut sibling_guard = sibling_page.write();
        let sibling_size = node::node_size(&sibling_guard.data);
        let max_size = node::node_max_size(&sibling_guard.data);

        if size + sibling_size <= max_size {
            // Merge the pair into its left member and drop the separator.
            trace!(
                "merging node {} with sibling {} under parent {}",
                node_page_id,
                sibling_id,
                parent_id
            );
            if is_leaf {
                if sibling_is_left {
                    {
                        let node_data = ctx.write_data(node_idx);
                        let mut right = LeafMut::<K>::new(node_data);
                        LeafMut::<K>::new(&mut sibling_guard.data).absorb_right(&mut right);
                    }
                    drop(sibling_guard);
                    self.buffer_pool.unpin_page(sibling_id, true)?;
                    ctx.pop();
                    ctx.defer_delete(node_page_id);
                } else {
                    {
                        let node_data = ctx.write_data(node_idx);
                        let mut left = LeafMut::<K>::new(node_data);
                        left.absorb_right(&mut LeafMut::<K>::new(&mut sibling_guard.data));
                    }
                    ctx.mark_dirty(node_idx);
                    drop(sibling_guard);
                    self.buffer_pool.unpin_page(sibling_id, false)?;
                    ctx.defer_delete(sibling_id);
                    ctx.pop();
                }
            } else if sibling_is_left {
                let entries = InternalRef::<K>::new(ctx.read_data(node_idx)).collect_entries();
                {
                    let mut left = InternalMut::<K>::new(&mut sibling_guard.data);
                    left.push_back(sep_key, entries[0].1);
                    for &(k, c) in &entries[1..] {
                        left.push_back(k, c);
                    }
                }
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                for &(_, child) in &entries {
                    self.reassign_parent(child, sibling_id)?;
                }
                ctx.pop();
                ctx.defer_delete(node_page_id);
            } else {
                let entries = InternalRef::<K>::new(&sibling_guard.data).collect_entries();
                {
                    let node_data = ctx.write_data(node_idx);
                    let mut left = InternalMut::<K>::new(node_data);
                    left.push_back(sep_key, entries[0].1);
                    for &(k, c) in &entries[1..] {
                        left.push_back(k, c);
                    }
                }
                ctx.mark_dirty(node_idx);
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, false)?;
                ctx.defer_delete(sibling_id);
                for &(_, child) in &entries {
                    self.reassign_parent(child, node_page_id)?;
                }
                ctx.pop();
            }

            {
                let parent_data = ctx.write_data(parent_idx);
                InternalMut::<K>::new(parent_data).remove_at(sep_pos);
            }
            ctx.mark_dirty(parent_idx);
            return self.rebalance(ctx);
        }

        // Redistribute: borrow one entry across the separator and fix it up.
        if is_leaf {
            if sibling_is_left {
                let (borrowed_key, borrowed_rid) =
                    LeafMut::<K>::new(&mut sibling_guard.data).pop_back();
                {
                    let node_data = ctx.write_data(node_idx);
                    LeafMut::<K>::new(node_data).push_front(borrowed_key, borrowed_rid);
                }
                {
                    let parent_data = ctx.write_data(parent_idx);
                    InternalMut::<K>::new(parent_data).set_key_at(sep_pos, borrowed_key);
                }
            } else {
                let (borrowed_key, borrowed_rid) =
                    LeafMut::<K>::new(&mut sibling_guard.data).pop_front();
                let new_separator = LeafRef::<K>::new(&sibling_guard.data).key_at(0);
                {
                    let node_data = ctx.write_data(node_idx);
                    LeafMut::<K>::new(node_data).push_back(borrowed_key, borrowed_rid);
                }
                {
                    let parent_data = ctx.write_data(parent_idx);
                    InternalMut::<K>::new(parent_data).set_key_at(sep_pos, new_separator);
                }
            }
        } else if sibling_is_left {
            let (last_key, last_child) = InternalMut::<K>::new(&mut sibling_guard.data).pop_back();
            {
                let node_data = ctx.write_data(node_idx);
                InternalMut::<K>::new(node_data).push_front(sep_key, last_child);
            }
            {
                let parent_data = ctx.write_data(parent_idx);
                InternalMut::<K>::new(parent_data).set_key_at(sep_pos, last_key);
            }
            self.reassign_parent(last_child, node_page_id)?;
        } else {
            let (first_key, first_child) =
                InternalMut::<K>::new(&mut sibling_guard.data).pop_front();
            {
                let node_data = ctx.write_data(node_idx);
                InternalMut::<K>::new(node_data).push_back(sep_key, first_child);
            }
            {
                let parent_data = ctx.write_data(parent_idx);
                InternalMut::<K>::new(parent_data).set_key_at(sep_pos, first_key);
            }
            self.reassign_parent(first_child, node_page_id)?;
        }

        ctx.mark_dirty(node_idx);
        ctx.mark_dirty(parent_idx);
        drop(sibling_guard);
        self.buffer_pool.unpin_page(sibling_id, true)?;
        Ok(())
    }

    /// Handle underflow at the root: an empty root leaf empties the tree; a
    /// single-child root internal hands the tree to that child.
    fn shrink_root(
        &self,
        ctx: &mut PageSet,
        node_idx: usize,
        is_leaf: bool,
        size: usize,
    ) -> Result<(), BTreeError> {
        let node_page_id = ctx.page_id_at(node_idx);

        if is_leaf {
            if size == 0 {
                {
                    let mut root = self.root.lock();
                    *root = INVALID_PAGE_ID;
                    self.sync_root_to_header(INVALID_PAGE_ID)?;
                }
                trace!("tree emptied, root {} released", node_page_id);
                ctx.pop();
                ctx.defer_delete(node_page_id);
            }
            return Ok(());
        }

        if size == 1 {
            let child_id = InternalRef::<K>::new(ctx.read_data(node_idx)).child_at(0);
            self.reassign_parent(child_id, INVALID_PAGE_ID)?;
            {
                let mut root = self.root.lock();
                *root = child_id;
                self.sync_root_to_header(child_id)?;
            }
            trace!("root collapsed: {} -> {}", node_page_id, child_id);
            ctx.pop();
            ctx.defer_delete(node_page_id);
        }
        Ok(())
    }
}
