//! An embedded, versioned, copy-on-write B+-tree storage engine.
//!
//! The tree maps 14-byte [`Key`]s to arbitrarily long byte streams. Each
//! stream is exposed as a seekable [`DataFile`] supporting random reads and
//! writes, in-place byte shifting, resizing and range replication. All
//! mutations happen inside a [`TreeSystemTransaction`], which copies shared
//! immutable nodes into a private node heap on first touch, so concurrent
//! transactions opened from the same snapshot root never observe each
//! other's uncommitted state.
//!
//! Node images are persisted through the [`NodeStore`] interface; the crate
//! ships [`MemoryNodeStore`], an in-memory implementation used by the test
//! suite and benchmarks.

#[cfg(test)]
#[macro_use]
extern crate quickcheck_macros;

mod key;
mod reference;
mod store;
mod treeindex;

pub use key::Key;
pub use reference::{NodeReference, ParseReferenceError};
pub use store::{AreaReader, AreaWriter, MemoryNodeStore, NodeStore};
pub use treeindex::datafile::{BlockLocation, DataFile, DataFileBytes, DataRange, FileMode};
pub use treeindex::transaction::TreeSystemTransaction;
pub use treeindex::{TreeConfig, TreeStore};

use thiserror::Error;

/// Error type for every fallible operation of the engine.
#[derive(Error, Debug)]
pub enum TreeStoreError {
    /// An offset or length fell outside the addressable range of a data
    /// file. Recoverable; the file is untouched.
    #[error("position {position} out of bounds (size {size})")]
    DataPositionOutOfBounds { position: u64, size: u64 },

    /// A mutation was attempted on an immutable (stored or sparse) node, or
    /// through a read-only data file.
    #[error("write violation: target is immutable")]
    WriteViolation,

    /// A data file was opened under one of the HEAD/TAIL sentinel keys,
    /// which exist only as tree anchors.
    #[error("key is reserved for internal use")]
    ReservedKey,

    /// The backing store could not serve a request right now. Transient;
    /// the operation may be retried.
    #[error("path not available: {0}")]
    PathNotAvailable(String),

    /// A reference of the wrong class reached the backing store.
    #[error("invalid node reference {0}")]
    InvalidReference(NodeReference),

    /// Rejected [`TreeConfig`] value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Unrecoverable failure (corrupt node image, broken invariant, store
    /// write failure). The owning database is poisoned: every subsequent
    /// operation on it fails with this error until the process restarts.
    #[error("critical stop: {0}")]
    CriticalStop(String),

    /// I/O error surfaced by a backing store implementation.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
