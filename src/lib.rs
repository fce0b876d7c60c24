// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use index::btree::{BTreeIndex, BTreeIterator};
pub use storage::buffer::replacer::LruKReplacer;
pub use storage::buffer::{BufferPoolError, BufferPoolManager};
pub use transaction::{LockManager, LockMode, Transaction, TransactionManager};
