//! The tree engine: snapshot-publishing front, configuration, and the
//! transaction/node machinery underneath.

pub mod datafile;
mod heap;
mod node;
pub mod transaction;
mod write_sequence;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use crate::reference::NodeReference;
use crate::store::NodeStore;
use crate::TreeStoreError;
use transaction::TreeSystemTransaction;

/// Tuning knobs of the tree core.
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Upper bound on a leaf payload, in bytes.
    pub max_leaf_byte_size: usize,
    /// Upper bound on branch fanout.
    pub max_branch_children: usize,
    /// Heap byte budget; crossing it triggers cache management.
    pub heap_memory_limit: usize,
    /// Bucket count of the heap lookup table.
    pub heap_hash_buckets: usize,
}

impl Default for TreeConfig {
    fn default() -> TreeConfig {
        TreeConfig {
            max_leaf_byte_size: 4096,
            max_branch_children: 14,
            heap_memory_limit: 4 * 1024 * 1024,
            heap_hash_buckets: 1031,
        }
    }
}

impl TreeConfig {
    pub fn validate(&self) -> Result<(), TreeStoreError> {
        if self.max_branch_children < 6 {
            return Err(TreeStoreError::InvalidConfig(
                "max_branch_children must be at least 6",
            ));
        }
        // the branch image stores the child count as a u16
        if self.max_branch_children > u16::MAX as usize {
            return Err(TreeStoreError::InvalidConfig(
                "max_branch_children must be at most 65535",
            ));
        }
        if self.max_leaf_byte_size < 16 {
            return Err(TreeStoreError::InvalidConfig(
                "max_leaf_byte_size must be at least 16",
            ));
        }
        // the leaf image stores its size as a u32
        if self.max_leaf_byte_size > u32::MAX as usize {
            return Err(TreeStoreError::InvalidConfig(
                "max_leaf_byte_size must fit in 32 bits",
            ));
        }
        if self.heap_hash_buckets == 0 {
            return Err(TreeStoreError::InvalidConfig(
                "heap_hash_buckets must be nonzero",
            ));
        }
        Ok(())
    }
}

/// Sticky fatal-condition flag shared by every transaction of a store.
/// Once tripped, all access fails with `CriticalStop` until restart.
pub(crate) struct PoisonFlag {
    poisoned: AtomicBool,
}

impl PoisonFlag {
    pub fn new() -> PoisonFlag {
        PoisonFlag {
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn check(&self) -> Result<(), TreeStoreError> {
        if self.poisoned.load(Ordering::Acquire) {
            Err(TreeStoreError::CriticalStop("database poisoned".into()))
        } else {
            Ok(())
        }
    }

    pub fn trip(&self, reason: &str) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            error!("critical stop: {}", reason);
        }
    }
}

/// Snapshot front of one tree database: owns the store handle and the
/// published root, and hands out transactions.
///
/// `commit` publishes last-writer-wins; resolving three-way merges across
/// concurrent commits is an external commit manager's job, which can open
/// transactions at arbitrary roots via [`TreeStore::transaction_at`] and
/// publish the outcome itself.
pub struct TreeStore<S: NodeStore> {
    store: Arc<S>,
    config: TreeConfig,
    poison: Arc<PoisonFlag>,
    root: Mutex<NodeReference>,
}

impl<S: NodeStore> TreeStore<S> {
    /// Bootstrap an empty tree (the HEAD/TAIL anchor leaves under one
    /// root branch) and commit it as the first snapshot.
    pub fn new(store: S, config: TreeConfig) -> Result<TreeStore<S>, TreeStoreError> {
        config.validate()?;
        let store = Arc::new(store);
        let poison = Arc::new(PoisonFlag::new());
        let tx = TreeSystemTransaction::bootstrap(store.clone(), config, poison.clone());
        let root = tx.commit()?;
        Ok(TreeStore {
            store,
            config,
            poison,
            root: Mutex::new(root),
        })
    }

    /// Attach to an existing snapshot root.
    pub fn open(
        store: S,
        config: TreeConfig,
        root: NodeReference,
    ) -> Result<TreeStore<S>, TreeStoreError> {
        config.validate()?;
        if !root.is_stored() {
            return Err(TreeStoreError::InvalidReference(root));
        }
        Ok(TreeStore {
            store: Arc::new(store),
            config,
            poison: Arc::new(PoisonFlag::new()),
            root: Mutex::new(root),
        })
    }

    /// Open a transaction on the currently published snapshot.
    pub fn transaction(&self) -> TreeSystemTransaction<S> {
        self.transaction_at(*self.root.lock())
    }

    /// Open a transaction on an arbitrary snapshot root.
    pub fn transaction_at(&self, root: NodeReference) -> TreeSystemTransaction<S> {
        TreeSystemTransaction::new(
            self.store.clone(),
            self.config,
            self.poison.clone(),
            root,
        )
    }

    /// Flush the transaction and publish its root as the new snapshot.
    pub fn commit(
        &self,
        tx: TreeSystemTransaction<S>,
    ) -> Result<NodeReference, TreeStoreError> {
        let root = tx.commit()?;
        *self.root.lock() = root;
        Ok(root)
    }

    pub fn current_root(&self) -> NodeReference {
        *self.root.lock()
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }
}
