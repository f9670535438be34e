//! Copy-on-write transaction over one snapshot of the tree.
//!
//! A transaction owns a [`TreeNodeHeap`] and a working root reference. All
//! mutation goes through unshare-on-descend: every stored or sparse node
//! on the path to a mutation target is copied into the heap and its parent
//! slot rewritten before the mutation happens, so shared subtrees are
//! never touched. Descents use an explicit frame stack; nodes carry no
//! parent pointers.
//!
//! A transaction is single-owner: interior state lives in `Cell`/`RefCell`
//! and the type is deliberately not `Sync`. Transactions opened from the
//! same snapshot root on different threads are independent.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};

use crate::key::Key;
use crate::reference::NodeReference;
use crate::store::{AreaWriter, NodeStore};
use crate::treeindex::datafile::{DataFile, DataRange, FileMode};
use crate::treeindex::heap::TreeNodeHeap;
use crate::treeindex::node::{parse_node, PositionBias, TreeBranch, TreeLeaf, TreeNode};
use crate::treeindex::write_sequence::TreeWriteSequence;
use crate::treeindex::{PoisonFlag, TreeConfig};
use crate::TreeStoreError;

/// One step of a descent: the (heap) branch we came through and the child
/// slot we took.
#[derive(Clone, Copy)]
struct Frame {
    branch: NodeReference,
    index: usize,
}

/// A fully unshared spine from the root down to one leaf slot.
struct MutPath {
    frames: Vec<Frame>,
    leaf: NodeReference,
    /// Absolute offset of the leaf's first byte.
    leaf_base: u64,
}

impl MutPath {
    fn tip(&self) -> Frame {
        *self.frames.last().expect("root is always a branch")
    }
}

/// Whether a mutable descent must end at a heap leaf, or only needs the
/// branch spine unshared (whole-leaf surgery does not touch leaf bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
enum LeafAccess {
    ReadStructure,
    Materialize,
}

pub struct TreeSystemTransaction<S: NodeStore> {
    store: Arc<S>,
    config: TreeConfig,
    poison: Arc<PoisonFlag>,
    root: Cell<NodeReference>,
    heap: RefCell<TreeNodeHeap>,
}

impl<S: NodeStore> TreeSystemTransaction<S> {
    pub(crate) fn new(
        store: Arc<S>,
        config: TreeConfig,
        poison: Arc<PoisonFlag>,
        root: NodeReference,
    ) -> TreeSystemTransaction<S> {
        TreeSystemTransaction {
            heap: RefCell::new(TreeNodeHeap::new(config.heap_hash_buckets)),
            store,
            config,
            poison,
            root: Cell::new(root),
        }
    }

    /// Build the minimal tree: a root branch over the empty HEAD and TAIL
    /// anchor leaves.
    pub(crate) fn bootstrap(
        store: Arc<S>,
        config: TreeConfig,
        poison: Arc<PoisonFlag>,
    ) -> TreeSystemTransaction<S> {
        let mut heap = TreeNodeHeap::new(config.heap_hash_buckets);
        let head = heap.create_empty_leaf(0);
        let tail = heap.create_empty_leaf(0);
        let root = heap.adopt(|r| {
            let mut b = TreeBranch::new_heap(r);
            b.push_child(head, 0, None).expect("heap branch");
            b.push_child(tail, 0, Some(Key::TAIL)).expect("heap branch");
            TreeNode::Branch(b)
        });
        TreeSystemTransaction {
            heap: RefCell::new(heap),
            store,
            config,
            poison,
            root: Cell::new(root),
        }
    }

    /// The working root; evolves as mutations rewrite the spine.
    pub fn root(&self) -> NodeReference {
        self.root.get()
    }

    /// Identity of the backing store, for same-origin checks on block
    /// replication.
    pub(crate) fn store_token(&self) -> usize {
        Arc::as_ptr(&self.store) as usize
    }

    fn guard(&self) -> Result<(), TreeStoreError> {
        self.poison.check()
    }

    /// Escalate store-level failures: I/O errors and corruption poison the
    /// database, transient conditions pass through.
    fn store_err(&self, e: TreeStoreError) -> TreeStoreError {
        match e {
            TreeStoreError::Io(io) => {
                let msg = format!("store failure: {}", io);
                self.poison.trip(&msg);
                TreeStoreError::CriticalStop(msg)
            }
            TreeStoreError::CriticalStop(msg) => {
                self.poison.trip(&msg);
                TreeStoreError::CriticalStop(msg)
            }
            other => other,
        }
    }

    fn missing_heap_node(&self, r: &NodeReference) -> TreeStoreError {
        let msg = format!("heap node {} is not resident", r);
        self.poison.trip(&msg);
        TreeStoreError::CriticalStop(msg)
    }

    fn read_stored(&self, r: &NodeReference) -> Result<TreeNode, TreeStoreError> {
        let mut reader = self.store.read_area(r).map_err(|e| self.store_err(e))?;
        parse_node(*r, &mut reader).map_err(|e| self.store_err(e))
    }

    /// Run `f` against the node behind any reference class.
    fn with_node<R>(
        &self,
        r: &NodeReference,
        f: impl FnOnce(&TreeNode) -> R,
    ) -> Result<R, TreeStoreError> {
        if r.is_heap() {
            let heap = self.heap.borrow();
            match heap.fetch(r) {
                Some(n) => Ok(f(n)),
                None => Err(self.missing_heap_node(r)),
            }
        } else if r.is_sparse() {
            Ok(f(&TreeNode::Leaf(TreeLeaf::from_sparse(*r))))
        } else {
            let node = self.read_stored(r)?;
            Ok(f(&node))
        }
    }

    fn with_branch_mut<R>(
        &self,
        r: &NodeReference,
        f: impl FnOnce(&mut TreeBranch) -> R,
    ) -> Result<R, TreeStoreError> {
        let mut heap = self.heap.borrow_mut();
        heap.with_mut(r, |n| f(n.as_branch_mut()))
            .ok_or_else(|| self.missing_heap_node(r))
    }

    fn with_leaf_mut<R>(
        &self,
        r: &NodeReference,
        f: impl FnOnce(&mut TreeLeaf) -> R,
    ) -> Result<R, TreeStoreError> {
        let mut heap = self.heap.borrow_mut();
        heap.with_mut(r, |n| f(n.as_leaf_mut()))
            .ok_or_else(|| self.missing_heap_node(r))
    }

    fn branch_parts(
        &self,
        r: &NodeReference,
    ) -> Result<(Vec<NodeReference>, Vec<u64>, Vec<Key>), TreeStoreError> {
        self.with_node(r, |n| {
            let b = n.as_branch();
            let count = b.child_count();
            let mut refs = Vec::with_capacity(count);
            let mut extents = Vec::with_capacity(count);
            let mut keys = Vec::with_capacity(count.saturating_sub(1));
            for i in 0..count {
                refs.push(b.child_ref(i));
                extents.push(b.child_extent(i));
                if i >= 1 {
                    keys.push(b.child_key(i));
                }
            }
            (refs, extents, keys)
        })
    }

    // ---- descents -------------------------------------------------------

    /// Absolute offset of the start (`inclusive == false`) or end
    /// (`inclusive == true`) boundary of a key's byte run.
    pub(crate) fn key_boundary(&self, key: &Key, inclusive: bool) -> Result<u64, TreeStoreError> {
        enum Step {
            Down(NodeReference, u64),
            Leaf(u64),
        }
        let mut cur = self.root.get();
        let mut base = 0u64;
        loop {
            let step = self.with_node(&cur, |n| match n {
                TreeNode::Branch(b) => {
                    let i = b.boundary_child(key, inclusive);
                    let before: u64 = (0..i).map(|j| b.child_extent(j)).sum();
                    Step::Down(b.child_ref(i), before)
                }
                TreeNode::Leaf(l) => Step::Leaf(l.size() as u64),
            })?;
            match step {
                Step::Down(child, before) => {
                    base += before;
                    cur = child;
                }
                Step::Leaf(size) => return Ok(base + size),
            }
        }
    }

    /// `(start, end)` of the key's run in the tree's byte address space.
    pub(crate) fn file_extent(&self, key: &Key) -> Result<(u64, u64), TreeStoreError> {
        self.guard()?;
        Ok((
            self.key_boundary(key, false)?,
            self.key_boundary(key, true)?,
        ))
    }

    /// Read-only descent to the leaf holding an absolute offset.
    fn locate(
        &self,
        abs: u64,
        bias: PositionBias,
    ) -> Result<(NodeReference, u64), TreeStoreError> {
        let mut cur = self.root.get();
        let mut off = abs;
        loop {
            let step = self.with_node(&cur, |n| match n {
                TreeNode::Branch(b) => {
                    let (i, local) = b.search_position(off, bias);
                    Some((b.child_ref(i), local))
                }
                TreeNode::Leaf(_) => None,
            })?;
            match step {
                Some((child, local)) => {
                    cur = child;
                    off = local;
                }
                None => return Ok((cur, off)),
            }
        }
    }

    fn unshare_root(&self) -> Result<NodeReference, TreeStoreError> {
        let r = self.root.get();
        if r.is_heap() {
            return Ok(r);
        }
        let node = self.read_stored(&r)?;
        let nr = self
            .heap
            .borrow_mut()
            .copy(&node, self.config.max_leaf_byte_size);
        self.root.set(nr);
        Ok(nr)
    }

    /// Copy the child at `index` into the heap (if it is not there yet)
    /// and rewrite the parent slot.
    fn unshare_child(
        &self,
        parent: &NodeReference,
        index: usize,
    ) -> Result<NodeReference, TreeStoreError> {
        let child = self.with_node(parent, |n| n.as_branch().child_ref(index))?;
        if child.is_heap() {
            return Ok(child);
        }
        let node = if child.is_sparse() {
            debug_assert!(child.sparse_length() <= self.config.max_leaf_byte_size as u64);
            TreeNode::Leaf(TreeLeaf::from_sparse(child))
        } else {
            self.read_stored(&child)?
        };
        let nr = self
            .heap
            .borrow_mut()
            .copy(&node, self.config.max_leaf_byte_size);
        self.with_branch_mut(parent, |b| b.set_child_ref(index, nr))??;
        Ok(nr)
    }

    /// Mutable descent by absolute offset. The branch spine is always
    /// unshared; the leaf itself only under `LeafAccess::Materialize`,
    /// which also carves oversized sparse runs into a heap window
    /// bracketed by smaller runs.
    fn position_path_mut(
        &self,
        key: &Key,
        abs: u64,
        bias: PositionBias,
        access: LeafAccess,
    ) -> Result<MutPath, TreeStoreError> {
        'restart: loop {
            let mut frames: Vec<Frame> = Vec::new();
            let mut cur = self.unshare_root()?;
            let mut off = abs;
            loop {
                let (index, local, child) = match self.with_node(&cur, |n| match n {
                    TreeNode::Branch(b) => {
                        let (i, local) = b.search_position(off, bias);
                        Some((i, local, b.child_ref(i)))
                    }
                    TreeNode::Leaf(_) => None,
                })? {
                    Some(step) => step,
                    None => {
                        return Ok(MutPath {
                            frames,
                            leaf: cur,
                            leaf_base: abs - off,
                        })
                    }
                };

                if child.is_sparse() {
                    if access == LeafAccess::Materialize {
                        if child.sparse_length() > self.config.max_leaf_byte_size as u64 {
                            frames.push(Frame { branch: cur, index });
                            self.carve_sparse_child(&frames, local, *key)?;
                            continue 'restart;
                        }
                        let node = TreeNode::Leaf(TreeLeaf::from_sparse(child));
                        let nr = self
                            .heap
                            .borrow_mut()
                            .copy(&node, self.config.max_leaf_byte_size);
                        self.with_branch_mut(&cur, |b| b.set_child_ref(index, nr))??;
                        frames.push(Frame { branch: cur, index });
                        return Ok(MutPath {
                            frames,
                            leaf: nr,
                            leaf_base: abs - local,
                        });
                    }
                    frames.push(Frame { branch: cur, index });
                    return Ok(MutPath {
                        frames,
                        leaf: child,
                        leaf_base: abs - local,
                    });
                }

                if child.is_heap() {
                    let is_leaf = self.with_node(&child, |n| n.is_leaf())?;
                    frames.push(Frame { branch: cur, index });
                    if is_leaf {
                        return Ok(MutPath {
                            frames,
                            leaf: child,
                            leaf_base: abs - local,
                        });
                    }
                    cur = child;
                    off = local;
                    continue;
                }

                let node = self.read_stored(&child)?;
                frames.push(Frame { branch: cur, index });
                match &node {
                    TreeNode::Branch(_) => {
                        let nr = self
                            .heap
                            .borrow_mut()
                            .copy(&node, self.config.max_leaf_byte_size);
                        self.with_branch_mut(&cur, |b| b.set_child_ref(index, nr))??;
                        cur = nr;
                        off = local;
                    }
                    TreeNode::Leaf(_) => {
                        if access == LeafAccess::Materialize {
                            let nr = self
                                .heap
                                .borrow_mut()
                                .copy(&node, self.config.max_leaf_byte_size);
                            self.with_branch_mut(&cur, |b| b.set_child_ref(index, nr))??;
                            return Ok(MutPath {
                                frames,
                                leaf: nr,
                                leaf_base: abs - local,
                            });
                        }
                        return Ok(MutPath {
                            frames,
                            leaf: child,
                            leaf_base: abs - local,
                        });
                    }
                }
            }
        }
    }

    /// Mutable descent to the leaf bounding a key's run: the last leaf
    /// with a key below (`inclusive == false`) or at (`inclusive == true`)
    /// the given key. Only the branch spine is unshared; boundary paths
    /// exist for insert-after surgery, never to touch the leaf.
    fn boundary_path_mut(&self, key: &Key, inclusive: bool) -> Result<MutPath, TreeStoreError> {
        let mut frames: Vec<Frame> = Vec::new();
        let mut cur = self.unshare_root()?;
        loop {
            let (index, child) = match self.with_node(&cur, |n| match n {
                TreeNode::Branch(b) => {
                    let i = b.boundary_child(key, inclusive);
                    Some((i, b.child_ref(i)))
                }
                TreeNode::Leaf(_) => None,
            })? {
                Some(step) => step,
                None => {
                    return Ok(MutPath {
                        frames,
                        leaf: cur,
                        leaf_base: 0,
                    })
                }
            };

            if child.is_heap() {
                let is_leaf = self.with_node(&child, |n| n.is_leaf())?;
                frames.push(Frame { branch: cur, index });
                if is_leaf {
                    return Ok(MutPath {
                        frames,
                        leaf: child,
                        leaf_base: 0,
                    });
                }
                cur = child;
                continue;
            }
            if child.is_sparse() {
                frames.push(Frame { branch: cur, index });
                return Ok(MutPath {
                    frames,
                    leaf: child,
                    leaf_base: 0,
                });
            }
            let node = self.read_stored(&child)?;
            frames.push(Frame { branch: cur, index });
            match &node {
                TreeNode::Branch(_) => {
                    let nr = self
                        .heap
                        .borrow_mut()
                        .copy(&node, self.config.max_leaf_byte_size);
                    self.with_branch_mut(&cur, |b| b.set_child_ref(index, nr))??;
                    cur = nr;
                }
                TreeNode::Leaf(_) => {
                    return Ok(MutPath {
                        frames,
                        leaf: child,
                        leaf_base: 0,
                    });
                }
            }
        }
    }

    // ---- structural edits ----------------------------------------------

    /// Add `delta` to the spine's extent entries.
    fn bump_ancestors(&self, frames: &[Frame], delta: i64) -> Result<(), TreeStoreError> {
        if delta == 0 {
            return Ok(());
        }
        for f in frames {
            self.with_branch_mut(&f.branch, |b| b.adjust_child_extent(f.index, delta))??;
        }
        Ok(())
    }

    fn bump_path(&self, path: &MutPath, delta: i64) -> Result<(), TreeStoreError> {
        self.bump_ancestors(&path.frames, delta)
    }

    /// Insert children into the path's bottom branch at `at`, every new
    /// child separated by `key`, then split overfull branches bottom-up.
    fn insert_children(
        &self,
        frames: &[Frame],
        at: usize,
        items: &[(NodeReference, u64)],
        key: Key,
    ) -> Result<(), TreeStoreError> {
        let tip = *frames.last().expect("insertion below the root");
        let delta: i64 = items.iter().map(|(_, e)| *e as i64).sum();
        self.with_branch_mut(&tip.branch, |b| -> Result<(), TreeStoreError> {
            for (j, (r, e)) in items.iter().enumerate() {
                b.insert_child(at + j, *r, *e, key)?;
            }
            Ok(())
        })??;
        self.bump_ancestors(&frames[..frames.len() - 1], delta)?;
        self.split_overfull(frames)
    }

    /// Replace the tip slot with `segs[0]` and insert the rest after it.
    fn replace_child(
        &self,
        frames: &[Frame],
        segs: &[(NodeReference, u64)],
        key: Key,
    ) -> Result<(), TreeStoreError> {
        debug_assert!(!segs.is_empty());
        let tip = *frames.last().expect("replacement below the root");
        let old_extent = self.with_node(&tip.branch, |n| n.as_branch().child_extent(tip.index))?;
        let old_ref = self.with_node(&tip.branch, |n| n.as_branch().child_ref(tip.index))?;
        self.with_branch_mut(&tip.branch, |b| {
            b.set_child(tip.index, segs[0].0, segs[0].1, None)
        })??;
        if old_ref.is_heap() {
            self.heap.borrow_mut().delete(&old_ref);
        }
        self.bump_ancestors(
            &frames[..frames.len() - 1],
            segs[0].1 as i64 - old_extent as i64,
        )?;
        if segs.len() > 1 {
            self.insert_children(frames, tip.index + 1, &segs[1..], key)?;
        }
        Ok(())
    }

    /// Split branches over the fanout limit, walking from the bottom of
    /// the spine toward the root; a root split grows the tree height.
    fn split_overfull(&self, frames: &[Frame]) -> Result<(), TreeStoreError> {
        let max = self.config.max_branch_children;
        let mut d = frames.len();
        while d > 0 {
            let cur = frames[d - 1].branch;
            let count = self.with_node(&cur, |n| n.as_branch().child_count())?;
            if count <= max {
                return Ok(());
            }
            let (rrefs, rext, rkeys, promoted) =
                self.with_branch_mut(&cur, |b| b.split_median())??;
            let right_extent: u64 = rext.iter().sum();
            let left_extent = self.with_node(&cur, |n| n.extent())?;
            let right = self
                .heap
                .borrow_mut()
                .adopt(|r| TreeNode::Branch(TreeBranch::from_parts(r, rrefs, rext, rkeys)));

            if d == 1 {
                let old_root = cur;
                let new_root = self.heap.borrow_mut().adopt(|r| {
                    let mut b = TreeBranch::new_heap(r);
                    b.push_child(old_root, left_extent, None).expect("heap branch");
                    b.push_child(right, right_extent, Some(promoted))
                        .expect("heap branch");
                    TreeNode::Branch(b)
                });
                self.root.set(new_root);
                return Ok(());
            }
            let parent = frames[d - 2];
            self.with_branch_mut(&parent.branch, |b| -> Result<(), TreeStoreError> {
                b.set_child_extent(parent.index, left_extent)?;
                b.insert_child(parent.index + 1, right, right_extent, promoted)?;
                Ok(())
            })??;
            d -= 1;
        }
        Ok(())
    }

    /// Carve an oversized sparse run at the spine tip into (up to) a
    /// leading run, one materialized heap window around `local`, and a
    /// trailing run.
    fn carve_sparse_child(
        &self,
        frames: &[Frame],
        local: u64,
        key: Key,
    ) -> Result<(), TreeStoreError> {
        let tip = *frames.last().expect("sparse child below the root");
        let child = self.with_node(&tip.branch, |n| n.as_branch().child_ref(tip.index))?;
        let byte = child.sparse_byte();
        let len = child.sparse_length();
        let cap = self.config.max_leaf_byte_size as u64;
        let a = if local >= len {
            ((len - 1) / cap) * cap
        } else {
            (local / cap) * cap
        };
        let b = (a + cap).min(len);

        let window = self.heap.borrow_mut().adopt(|r| {
            let mut leaf = TreeLeaf::new_heap(r, cap as usize);
            leaf.set_size((b - a) as usize).expect("window within capacity");
            if byte != 0 {
                leaf.put(0, &vec![byte; (b - a) as usize])
                    .expect("window within capacity");
            }
            TreeNode::Leaf(leaf)
        });

        let mut segs: Vec<(NodeReference, u64)> = Vec::new();
        if a > 0 {
            segs.push((NodeReference::sparse(byte, a), a));
        }
        segs.push((window, b - a));
        if b < len {
            segs.push((NodeReference::sparse(byte, len - b), len - b));
        }
        self.replace_child(frames, &segs, key)
    }

    /// Unlink the path's leaf and rebalance the spine.
    fn remove_leaf(&self, path: &MutPath) -> Result<(), TreeStoreError> {
        let tip = path.tip();
        let (r, extent) = self.with_branch_mut(&tip.branch, |b| b.remove_child(tip.index))??;
        if r.is_heap() {
            self.heap.borrow_mut().delete(&r);
        }
        self.bump_ancestors(&path.frames[..path.frames.len() - 1], -(extent as i64))?;
        self.rebalance_upward(&path.frames)
    }

    /// Bottom-up underflow repair: merge a thin branch with a sibling when
    /// the union fits, otherwise rotate one child across the boundary.
    /// The root is never rebalanced, only collapsed while it has a single
    /// branch child.
    fn rebalance_upward(&self, frames: &[Frame]) -> Result<(), TreeStoreError> {
        let max = self.config.max_branch_children;
        let min = (max / 2).max(2);
        let mut d = frames.len();
        while d > 0 {
            if d == 1 {
                return self.collapse_root();
            }
            let cur = frames[d - 1].branch;
            let count = self.with_node(&cur, |n| n.as_branch().child_count())?;
            if count >= min {
                return Ok(());
            }
            let parent = frames[d - 2];
            let cur_idx = parent.index;
            let (left_idx, right_idx) = if cur_idx > 0 {
                (cur_idx - 1, cur_idx)
            } else {
                (cur_idx, cur_idx + 1)
            };
            let left_ref = self.unshare_child(&parent.branch, left_idx)?;
            let right_ref = self.unshare_child(&parent.branch, right_idx)?;
            let left_count = self.with_node(&left_ref, |n| n.as_branch().child_count())?;
            let right_count = self.with_node(&right_ref, |n| n.as_branch().child_count())?;
            let sep = self.with_node(&parent.branch, |n| n.as_branch().child_key(right_idx))?;

            if left_count + right_count <= max {
                let (rrefs, rext, rkeys) = self.branch_parts(&right_ref)?;
                let right_total: u64 = rext.iter().sum();
                self.with_branch_mut(&left_ref, |b| -> Result<(), TreeStoreError> {
                    for (j, (r, e)) in rrefs.iter().zip(&rext).enumerate() {
                        let k = if j == 0 { sep } else { rkeys[j - 1] };
                        b.push_child(*r, *e, Some(k))?;
                    }
                    Ok(())
                })??;
                self.with_branch_mut(&parent.branch, |b| -> Result<(), TreeStoreError> {
                    b.adjust_child_extent(left_idx, right_total as i64)?;
                    b.remove_child(right_idx)?;
                    Ok(())
                })??;
                self.heap.borrow_mut().delete(&right_ref);
                d -= 1;
                continue;
            }

            if cur_idx == right_idx {
                // borrow the left sibling's last child
                let (moved_key, moved_ref, moved_extent) = self.with_branch_mut(
                    &left_ref,
                    |b| -> Result<(Key, NodeReference, u64), TreeStoreError> {
                        let last = b.child_count() - 1;
                        let k = b.child_key(last);
                        let (r, e) = b.remove_child(last)?;
                        Ok((k, r, e))
                    },
                )??;
                self.with_branch_mut(&right_ref, |b| b.insert_child(0, moved_ref, moved_extent, sep))??;
                self.with_branch_mut(&parent.branch, |b| -> Result<(), TreeStoreError> {
                    b.set_child_key(right_idx, moved_key)?;
                    b.adjust_child_extent(left_idx, -(moved_extent as i64))?;
                    b.adjust_child_extent(right_idx, moved_extent as i64)?;
                    Ok(())
                })??;
            } else {
                // borrow the right sibling's first child
                let (next_sep, moved_ref, moved_extent) = self.with_branch_mut(
                    &right_ref,
                    |b| -> Result<(Key, NodeReference, u64), TreeStoreError> {
                        let next = b.child_key(1);
                        let (r, e) = b.remove_child(0)?;
                        Ok((next, r, e))
                    },
                )??;
                self.with_branch_mut(&left_ref, |b| {
                    let end = b.child_count();
                    b.insert_child(end, moved_ref, moved_extent, sep)
                })??;
                self.with_branch_mut(&parent.branch, |b| -> Result<(), TreeStoreError> {
                    b.set_child_key(right_idx, next_sep)?;
                    b.adjust_child_extent(right_idx, -(moved_extent as i64))?;
                    b.adjust_child_extent(left_idx, moved_extent as i64)?;
                    Ok(())
                })??;
            }
            return Ok(());
        }
        Ok(())
    }

    /// Drop root levels while the root branch has a single branch child.
    fn collapse_root(&self) -> Result<(), TreeStoreError> {
        loop {
            let root = self.root.get();
            let (count, only) = self.with_node(&root, |n| {
                let b = n.as_branch();
                (b.child_count(), b.child_ref(0))
            })?;
            if count != 1 {
                return Ok(());
            }
            let child_is_branch = self.with_node(&only, |n| !n.is_leaf())?;
            if !child_is_branch {
                return Ok(());
            }
            if root.is_heap() {
                self.heap.borrow_mut().delete(&root);
            }
            self.root.set(only);
        }
    }

    // ---- byte-level operations -----------------------------------------

    fn out_of_bounds(position: u64, size: u64) -> TreeStoreError {
        TreeStoreError::DataPositionOutOfBounds { position, size }
    }

    /// Zero-filled leaves covering `len` bytes: one heap leaf below the
    /// leaf capacity, one sparse run above it.
    fn fill_items(&self, len: u64) -> Vec<(NodeReference, u64)> {
        let cap = self.config.max_leaf_byte_size as u64;
        if len <= cap {
            let leaf = self.heap.borrow_mut().adopt(|r| {
                let mut l = TreeLeaf::new_heap(r, cap as usize);
                l.set_size(len as usize).expect("fill within capacity");
                TreeNode::Leaf(l)
            });
            vec![(leaf, len)]
        } else {
            vec![(NodeReference::sparse(0, len), len)]
        }
    }

    fn adopt_leaf(&self, bytes: &[u8]) -> NodeReference {
        let cap = self.config.max_leaf_byte_size.max(bytes.len());
        self.heap.borrow_mut().adopt(|r| {
            let mut l = TreeLeaf::new_heap(r, cap);
            l.put(0, bytes).expect("chunk within capacity");
            TreeNode::Leaf(l)
        })
    }

    /// Open a zero-filled gap of `delta` bytes at absolute offset `abs`
    /// inside the key's run (`start`/`end` are the current run bounds).
    fn insert_gap(
        &self,
        key: &Key,
        abs: u64,
        delta: u64,
        start: u64,
        end: u64,
    ) -> Result<(), TreeStoreError> {
        debug_assert!(delta > 0);
        let cap = self.config.max_leaf_byte_size;

        if start == end {
            // first bytes under this key: new leaves after the boundary
            let path = self.boundary_path_mut(key, false)?;
            let items = self.fill_items(delta);
            return self.insert_children(&path.frames, path.tip().index + 1, &items, *key);
        }

        let bias = if abs == start {
            PositionBias::Right
        } else {
            PositionBias::Left
        };
        let path = self.position_path_mut(key, abs, bias, LeafAccess::Materialize)?;
        let local = (abs - path.leaf_base) as usize;
        let (size, capacity) = self.with_node(&path.leaf, |n| {
            let l = n.as_leaf();
            (l.size(), l.capacity())
        })?;

        if delta <= (capacity - size) as u64 {
            self.with_leaf_mut(&path.leaf, |l| l.shift(local, delta as isize))??;
            return self.bump_path(&path, delta as i64);
        }

        if delta > cap as u64 {
            // bulk gap: keep it sparse, splitting the leaf when the gap
            // opens in its interior
            let run = (NodeReference::sparse(0, delta), delta);
            if local == 0 {
                return self.insert_children(&path.frames, path.tip().index, &[run], *key);
            }
            if local == size {
                return self.insert_children(&path.frames, path.tip().index + 1, &[run], *key);
            }
            let tail_len = size - local;
            let mut tail = vec![0u8; tail_len];
            self.with_node(&path.leaf, |n| n.as_leaf().read(local, &mut tail))??;
            let tail_leaf = self.adopt_leaf(&tail);
            self.with_leaf_mut(&path.leaf, |l| l.set_size(local))??;
            self.bump_path(&path, -(tail_len as i64))?;
            return self.insert_children(
                &path.frames,
                path.tip().index + 1,
                &[run, (tail_leaf, tail_len as u64)],
                *key,
            );
        }

        // moderate gap: rebuild the affected bytes and spread them evenly
        // over as few leaves as possible
        let total = size + delta as usize;
        let mut combined = vec![0u8; total];
        self.with_node(&path.leaf, |n| -> Result<(), TreeStoreError> {
            let l = n.as_leaf();
            l.read(0, &mut combined[..local])?;
            l.read(local, &mut combined[local + delta as usize..])?;
            Ok(())
        })??;
        let pieces = (total + cap - 1) / cap;
        let base = total / pieces;
        let rem = total % pieces;
        let mut chunks: Vec<&[u8]> = Vec::with_capacity(pieces);
        let mut off = 0;
        for i in 0..pieces {
            let len = base + usize::from(i < rem);
            chunks.push(&combined[off..off + len]);
            off += len;
        }
        self.with_leaf_mut(&path.leaf, |l| -> Result<(), TreeStoreError> {
            l.set_size(0)?;
            l.put(0, chunks[0])?;
            Ok(())
        })??;
        self.bump_path(&path, chunks[0].len() as i64 - size as i64)?;
        let items: Vec<(NodeReference, u64)> = chunks[1..]
            .iter()
            .map(|c| (self.adopt_leaf(c), c.len() as u64))
            .collect();
        self.insert_children(&path.frames, path.tip().index + 1, &items, *key)
    }

    /// Remove the absolute byte range `[a, b)`, which must lie inside one
    /// key's run. Fully covered leaves are unlinked without
    /// materialization; sparse runs are trimmed in place; partial cuts go
    /// through a heap copy.
    fn remove_range(&self, key: &Key, a: u64, b: u64) -> Result<(), TreeStoreError> {
        let mut remaining = b - a;
        while remaining > 0 {
            let path = self.position_path_mut(key, a, PositionBias::Right, LeafAccess::ReadStructure)?;
            let local = (a - path.leaf_base) as usize;
            let leaf = path.leaf;
            let size = self.with_node(&leaf, |n| n.as_leaf().size())?;
            let take = ((size - local) as u64).min(remaining) as usize;

            if local == 0 && take == size {
                self.remove_leaf(&path)?;
            } else if leaf.is_sparse() {
                let byte = leaf.sparse_byte();
                let len = leaf.sparse_length();
                let right = len - (local + take) as u64;
                let mut segs = Vec::new();
                if local > 0 {
                    segs.push((NodeReference::sparse(byte, local as u64), local as u64));
                }
                if right > 0 {
                    segs.push((NodeReference::sparse(byte, right), right));
                }
                self.replace_child(&path.frames, &segs, *key)?;
            } else {
                let tip = path.tip();
                let hleaf = if leaf.is_heap() {
                    leaf
                } else {
                    self.unshare_child(&tip.branch, tip.index)?
                };
                self.with_leaf_mut(&hleaf, |l| l.shift(local + take, -(take as isize)))??;
                self.bump_path(&path, -(take as i64))?;
            }
            remaining -= take as u64;
        }
        Ok(())
    }

    pub(crate) fn read_at(
        &self,
        key: &Key,
        pos: u64,
        out: &mut [u8],
    ) -> Result<(), TreeStoreError> {
        self.guard()?;
        if out.is_empty() {
            return Ok(());
        }
        let (start, end) = self.file_extent(key)?;
        let size = end - start;
        if pos + out.len() as u64 > size {
            return Err(Self::out_of_bounds(pos + out.len() as u64, size));
        }
        let mut done = 0usize;
        while done < out.len() {
            let abs = start + pos + done as u64;
            let (leaf, local) = self.locate(abs, PositionBias::Right)?;
            let n = self.with_node(&leaf, |node| -> Result<usize, TreeStoreError> {
                let l = node.as_leaf();
                let n = (l.size() - local as usize).min(out.len() - done);
                l.read(local as usize, &mut out[done..done + n])?;
                Ok(n)
            })??;
            done += n;
        }
        Ok(())
    }

    pub(crate) fn write_at(&self, key: &Key, pos: u64, data: &[u8]) -> Result<(), TreeStoreError> {
        self.guard()?;
        if data.is_empty() {
            return Ok(());
        }
        let (start, end) = self.file_extent(key)?;
        let size = end - start;
        if pos > size {
            return Err(Self::out_of_bounds(pos, size));
        }
        let grow = (pos + data.len() as u64).saturating_sub(size);
        if grow > 0 {
            self.insert_gap(key, end, grow, start, end)?;
        }
        let mut done = 0usize;
        while done < data.len() {
            let abs = start + pos + done as u64;
            let path =
                self.position_path_mut(key, abs, PositionBias::Right, LeafAccess::Materialize)?;
            let local = (abs - path.leaf_base) as usize;
            let n = self.with_leaf_mut(&path.leaf, |l| -> Result<usize, TreeStoreError> {
                let n = (l.size() - local).min(data.len() - done);
                l.put(local, &data[done..done + n])?;
                Ok(n)
            })??;
            done += n;
        }
        self.check_cache()
    }

    /// Open (`delta > 0`) or close (`delta < 0`) a gap at byte `pos` of
    /// the key's run. A negative delta removes the `|delta|` bytes
    /// preceding `pos`.
    pub(crate) fn shift_at(&self, key: &Key, pos: u64, delta: i64) -> Result<(), TreeStoreError> {
        self.guard()?;
        if delta == 0 {
            return Ok(());
        }
        let (start, end) = self.file_extent(key)?;
        let size = end - start;
        if pos > size {
            return Err(Self::out_of_bounds(pos, size));
        }
        if delta > 0 {
            self.insert_gap(key, start + pos, delta as u64, start, end)?;
        } else {
            let d = delta.unsigned_abs();
            if d > pos {
                return Err(Self::out_of_bounds(pos, size));
            }
            self.remove_range(key, start + pos - d, start + pos)?;
        }
        self.check_cache()
    }

    /// Truncate or zero-fill extend the key's run to `n` bytes.
    pub(crate) fn set_file_size(&self, key: &Key, n: u64) -> Result<(), TreeStoreError> {
        self.guard()?;
        let (start, end) = self.file_extent(key)?;
        let size = end - start;
        if n > size {
            self.insert_gap(key, end, n - size, start, end)?;
        } else if n < size {
            self.remove_range(key, start + n, end)?;
        }
        self.check_cache()
    }

    // ---- key-range operations ------------------------------------------

    pub fn data_file_exists(&self, key: &Key) -> Result<bool, TreeStoreError> {
        self.guard()?;
        if key.is_sentinel() {
            return Err(TreeStoreError::ReservedKey);
        }
        let (start, end) = self.file_extent(key)?;
        Ok(end > start)
    }

    pub fn get_data_file(&self, key: Key, mode: FileMode) -> Result<DataFile<'_, S>, TreeStoreError> {
        self.guard()?;
        if key.is_sentinel() {
            return Err(TreeStoreError::ReservedKey);
        }
        Ok(DataFile::new(self, key, mode))
    }

    /// View over every data file with a key in `[lower, upper)`. Sentinel
    /// bounds are allowed (they bracket the whole user key space).
    pub fn get_data_range(
        &self,
        lower: Key,
        upper: Key,
    ) -> Result<DataRange<'_, S>, TreeStoreError> {
        self.guard()?;
        Ok(DataRange::new(self, lower, upper))
    }

    /// Distinct user keys with data in `[lower, upper)`, in order.
    pub(crate) fn keys_in_range(
        &self,
        lower: &Key,
        upper: &Key,
    ) -> Result<Vec<Key>, TreeStoreError> {
        let mut out = Vec::new();
        let mut current = Key::HEAD;
        self.collect_keys(&self.root.get(), &mut current, lower, upper, &mut out)?;
        Ok(out)
    }

    fn collect_keys(
        &self,
        r: &NodeReference,
        current: &mut Key,
        lower: &Key,
        upper: &Key,
        out: &mut Vec<Key>,
    ) -> Result<(), TreeStoreError> {
        let children: Option<Vec<(NodeReference, Option<Key>, Option<Key>)>> =
            self.with_node(r, |n| match n {
                TreeNode::Branch(b) => Some(
                    (0..b.child_count())
                        .map(|i| {
                            let this = (i > 0).then(|| b.child_key(i));
                            let next = (i + 1 < b.child_count()).then(|| b.child_key(i + 1));
                            (b.child_ref(i), this, next)
                        })
                        .collect(),
                ),
                TreeNode::Leaf(_) => None,
            })?;
        match children {
            Some(children) => {
                for (child, this, next) in children {
                    if let Some(k) = this {
                        *current = k;
                    }
                    if *current >= *upper {
                        break;
                    }
                    // subtree keys never exceed the following separator
                    if matches!(next, Some(n) if n < *lower) {
                        continue;
                    }
                    self.collect_keys(&child, current, lower, upper, out)?;
                }
            }
            None => {
                let k = *current;
                if !k.is_sentinel() && k >= *lower && k < *upper && out.last() != Some(&k) {
                    out.push(k);
                }
            }
        }
        Ok(())
    }

    // ---- block replication ---------------------------------------------

    /// Shareable leaf segments exactly covering the absolute range
    /// `[from, to)`, or `None` when the range holds heap leaves or is not
    /// leaf-aligned.
    pub(crate) fn block_segments(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Option<Vec<(NodeReference, u64)>>, TreeStoreError> {
        let mut segs = Vec::new();
        let mut a = from;
        while a < to {
            let (leaf, local) = self.locate(a, PositionBias::Right)?;
            if local != 0 || leaf.is_heap() {
                return Ok(None);
            }
            let size = self.with_node(&leaf, |n| n.as_leaf().size() as u64)?;
            if a + size > to {
                return Ok(None);
            }
            segs.push((leaf, size));
            a += size;
        }
        Ok(Some(segs))
    }

    /// Append shared immutable leaves to the end of the key's run.
    pub(crate) fn graft_leaves(
        &self,
        key: &Key,
        segs: &[(NodeReference, u64)],
    ) -> Result<(), TreeStoreError> {
        self.guard()?;
        for (r, e) in segs {
            debug_assert!(!r.is_heap());
            let path = self.boundary_path_mut(key, true)?;
            self.insert_children(&path.frames, path.tip().index + 1, &[(*r, *e)], *key)?;
        }
        self.check_cache()
    }

    // ---- heap budget and flush -----------------------------------------

    /// Between operations: while the heap is over budget, push ~30% of the
    /// least-recently-used nodes out to the store.
    fn check_cache(&self) -> Result<(), TreeStoreError> {
        loop {
            let (used, len) = {
                let heap = self.heap.borrow();
                (heap.memory_used(), heap.len())
            };
            if used <= self.config.heap_memory_limit || len == 0 {
                return Ok(());
            }
            let victims = {
                let heap = self.heap.borrow();
                let mut v = heap.lru_victims((len * 3 / 10).max(1));
                v.sort_by_key(|r| r.heap_id());
                v
            };
            debug!(
                "heap over budget ({} bytes across {} nodes), flushing {}",
                used,
                len,
                victims.len()
            );
            self.flush_nodes_to_store(&victims)?;
        }
    }

    /// Write the given heap nodes (and every heap node they depend on) out
    /// to the backing store, rewriting surviving parents to the fresh
    /// stored references and dropping the flushed nodes from the heap.
    pub fn flush_nodes_to_store(&self, refs: &[NodeReference]) -> Result<(), TreeStoreError> {
        self.guard()?;
        let mut seq = TreeWriteSequence::new();
        let mut ids: HashMap<NodeReference, i32> = HashMap::new();
        {
            let heap = self.heap.borrow();
            // closure over heap children: a branch cannot be written while
            // any child of it still lives only in the heap
            let mut stack: Vec<NodeReference> = Vec::new();
            for r in refs {
                if heap.fetch(r).is_some() {
                    stack.push(*r);
                }
            }
            while let Some(r) = stack.pop() {
                if ids.contains_key(&r) {
                    continue;
                }
                match heap.fetch(&r) {
                    Some(TreeNode::Leaf(_)) => {
                        let id = seq.sequence_node_write(r, false);
                        ids.insert(r, id);
                    }
                    Some(TreeNode::Branch(b)) => {
                        let id = seq.sequence_node_write(r, true);
                        ids.insert(r, id);
                        for i in 0..b.child_count() {
                            let c = b.child_ref(i);
                            if c.is_heap() {
                                stack.push(c);
                            }
                        }
                    }
                    None => return Err(self.missing_heap_node(&r)),
                }
            }
            for (r, id) in &ids {
                if let Some(TreeNode::Branch(b)) = heap.fetch(r) {
                    for i in 0..b.child_count() {
                        let c = b.child_ref(i);
                        if c.is_heap() {
                            seq.sequence_branch_link(*id, i, ids[&c]);
                        }
                    }
                }
            }
        }
        if seq.is_empty() {
            return Ok(());
        }
        trace!("flushing {} nodes", seq.len());

        // one pass allocates every area in combined order, a second emits
        // the images with child links resolved to the fresh references
        let order: Vec<NodeReference> = seq.combined().copied().collect();
        let mut writers: Vec<S::Writer> = Vec::with_capacity(order.len());
        {
            let heap = self.heap.borrow();
            for r in &order {
                let size = match heap.fetch(r) {
                    Some(n) => n.store_size(),
                    None => return Err(self.missing_heap_node(r)),
                };
                writers.push(self.store.create_area(size).map_err(|e| self.store_err(e))?);
            }
        }
        let stored: Vec<NodeReference> = writers.iter().map(|w| w.reference()).collect();
        {
            let heap = self.heap.borrow();
            for (i, r) in order.iter().enumerate() {
                let node = match heap.fetch(r) {
                    Some(n) => n,
                    None => return Err(self.missing_heap_node(r)),
                };
                let result = match node {
                    TreeNode::Leaf(l) => l.write_data_to(&mut writers[i]),
                    TreeNode::Branch(b) => {
                        let id = ids[r];
                        b.write_data_to(&mut writers[i], |slot| {
                            seq.lookup_ref(id, slot).map(|ix| stored[ix])
                        })
                    }
                };
                result.map_err(|e| self.store_err(e))?;
            }
        }
        for w in writers {
            w.finish().map_err(|e| self.store_err(e))?;
        }

        let map: HashMap<NodeReference, NodeReference> =
            order.iter().copied().zip(stored.iter().copied()).collect();
        {
            let mut heap = self.heap.borrow_mut();
            let survivors: Vec<NodeReference> = heap
                .refs()
                .into_iter()
                .filter(|r| !map.contains_key(r))
                .collect();
            for r in survivors {
                let _ = heap.with_mut(&r, |n| {
                    if let TreeNode::Branch(b) = n {
                        for i in 0..b.child_count() {
                            if let Some(s) = map.get(&b.child_ref(i)) {
                                b.set_child_ref(i, *s).expect("heap branch");
                            }
                        }
                    }
                });
            }
            for r in &order {
                heap.delete(r);
            }
        }
        if let Some(s) = map.get(&self.root.get()) {
            self.root.set(*s);
        }
        Ok(())
    }

    /// Flush everything and hand back the stored root for the commit
    /// manager to publish. Dropping a transaction instead of committing it
    /// discards the heap and leaves the store untouched.
    pub fn commit(self) -> Result<NodeReference, TreeStoreError> {
        self.guard()?;
        let all = {
            let heap = self.heap.borrow();
            let mut v = heap.refs();
            v.sort_by_key(|r| r.heap_id());
            v
        };
        self.flush_nodes_to_store(&all)?;
        let root = self.root.get();
        debug_assert!(root.is_stored());
        debug_assert!(self.heap.borrow().is_empty());
        Ok(root)
    }

    /// Resident heap bytes; test and budget observability.
    pub fn heap_memory_used(&self) -> usize {
        self.heap.borrow().memory_used()
    }

    // ---- integrity ------------------------------------------------------

    /// Walk the whole tree verifying extents, separator order and the
    /// sentinel anchors. A violation poisons the database.
    pub fn check_integrity(&self) -> Result<(), TreeStoreError> {
        self.guard()?;
        let mut current = Key::HEAD;
        self.verify_node(&self.root.get(), &mut current, true)?;
        if current != Key::TAIL {
            return Err(self.integrity_violation("rightmost path does not end at TAIL"));
        }
        Ok(())
    }

    fn integrity_violation(&self, what: &str) -> TreeStoreError {
        let msg = format!("integrity violation: {}", what);
        self.poison.trip(&msg);
        TreeStoreError::CriticalStop(msg)
    }

    fn verify_node(
        &self,
        r: &NodeReference,
        current: &mut Key,
        is_root: bool,
    ) -> Result<u64, TreeStoreError> {
        enum Info {
            Leaf(u64),
            Branch(Vec<(NodeReference, u64, Option<Key>)>),
        }
        let info = self.with_node(r, |n| match n {
            TreeNode::Leaf(l) => Info::Leaf(l.size() as u64),
            TreeNode::Branch(b) => Info::Branch(
                (0..b.child_count())
                    .map(|i| {
                        (
                            b.child_ref(i),
                            b.child_extent(i),
                            (i > 0).then(|| b.child_key(i)),
                        )
                    })
                    .collect(),
            ),
        })?;
        match info {
            Info::Leaf(size) => Ok(size),
            Info::Branch(children) => {
                if children.len() < 2 {
                    return Err(self.integrity_violation("branch below minimum fanout"));
                }
                if !is_root && children.len() > self.config.max_branch_children {
                    return Err(self.integrity_violation("branch above maximum fanout"));
                }
                let mut total = 0u64;
                for (child, recorded, key) in children {
                    if let Some(k) = key {
                        if k < *current {
                            return Err(self.integrity_violation("separator order"));
                        }
                        *current = k;
                    }
                    let actual = self.verify_node(&child, current, false)?;
                    if actual != recorded {
                        return Err(self.integrity_violation("extent does not match subtree"));
                    }
                    total += actual;
                }
                Ok(total)
            }
        }
    }
}
