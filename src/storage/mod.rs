//! Copy-on-write state slices and the slice-tree storage engine.

pub mod engine;
pub mod slice;

use rvchain_derive::Error;

/// Errors surfaced by the slice and engine layers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(String),
    /// A slice with the same key is already attached to the tree.
    #[error("slice key already exists in storage engine")]
    SliceAlreadyExists,
    /// Write attempted on a frozen slice.
    #[error("write to frozen slice")]
    SliceFrozenWrite,
    /// Only frozen slices can be attached to the tree.
    #[error("slice not frozen yet")]
    SliceNotFrozen,
    /// No finalized record exists for the requested height.
    #[error("storage key missing at height {0}")]
    KeyMissing(u64),
    /// Engine bootstrap requires the genesis slice at height 0.
    #[error("init slice must have height 0")]
    InitSliceHeight,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
