use crate::common::types::Rid;
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::base::{AccessMode, BTreeIndex};
use crate::index::btree::key::IndexKey;
use crate::index::btree::latch::PageSet;
use crate::index::btree::node::LeafRef;

impl<K: IndexKey> BTreeIndex<K> {
    /// Point lookup. Read-crabs to the owning leaf and binary-searches it.
    pub fn get(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let mut ctx = PageSet::new(self.buffer_pool.clone());
        if !self.find_leaf(key, AccessMode::Read, &mut ctx)? {
            return Ok(None);
        }
        let data = ctx.read_data(ctx.len() - 1);
        Ok(LeafRef::<K>::new(data).lookup(key))
    }
}
