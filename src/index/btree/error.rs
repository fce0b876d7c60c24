use thiserror::Error;
use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Index name {0:?} is not registered in the header page")]
    UnknownIndex(String),

    #[error("Index name {0:?} cannot be registered (too long or header page full)")]
    HeaderFull(String),

    #[error("Node sizes ({leaf} leaf / {internal} internal) do not fit a page for this key type")]
    NodeTooLarge { leaf: usize, internal: usize },

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),
}
