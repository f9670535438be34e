//! Mutable staging area for a transaction's heap nodes.
//!
//! Nodes are indexed by a chained hash over [`NodeReference::hash64`] and
//! threaded onto an intrusive doubly-linked list in MRU-to-LRU order.
//! Insertion pushes at the MRU head; `fetch` does not promote: eviction
//! order is insertion order, and a policy change here must be deliberate
//! (the tests pin the current behavior). Memory use is tracked as the sum
//! of each node's `heap_size_estimate`.
//!
//! The heap belongs to exactly one transaction and is unsynchronized.

use crate::key::Key;
use crate::reference::{NodeReference, HEAP_ID_MASK};
use crate::treeindex::node::{TreeBranch, TreeLeaf, TreeNode};

struct Entry {
    node: TreeNode,
    estimate: usize,
    hash_next: Option<usize>,
    /// toward the MRU head
    newer: Option<usize>,
    /// toward the LRU tail
    older: Option<usize>,
}

enum Slot {
    Used(Entry),
    Free { next: Option<usize> },
}

pub(crate) struct TreeNodeHeap {
    buckets: Vec<Option<usize>>,
    slots: Vec<Slot>,
    free_head: Option<usize>,
    mru: Option<usize>,
    lru: Option<usize>,
    len: usize,
    memory_used: usize,
    next_heap_id: u64,
}

impl TreeNodeHeap {
    pub fn new(buckets: usize) -> TreeNodeHeap {
        TreeNodeHeap {
            buckets: vec![None; buckets.max(1)],
            slots: Vec::new(),
            free_head: None,
            mru: None,
            lru: None,
            len: 0,
            memory_used: 0,
            next_heap_id: 0,
        }
    }

    /// Next heap-class reference. The counter is masked to 60 bits and
    /// wraps there.
    pub fn new_heap_id(&mut self) -> NodeReference {
        let id = self.next_heap_id & HEAP_ID_MASK;
        self.next_heap_id = self.next_heap_id.wrapping_add(1) & HEAP_ID_MASK;
        NodeReference::heap(id)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    fn bucket_of(&self, reference: &NodeReference) -> usize {
        (reference.hash64() % self.buckets.len() as u64) as usize
    }

    fn entry(&self, idx: usize) -> &Entry {
        match &self.slots[idx] {
            Slot::Used(e) => e,
            Slot::Free { .. } => unreachable!("free slot on a live list"),
        }
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry {
        match &mut self.slots[idx] {
            Slot::Used(e) => e,
            Slot::Free { .. } => unreachable!("free slot on a live list"),
        }
    }

    /// Chain walk; `O(1)` with adequately sized bucket table.
    fn find(&self, reference: &NodeReference) -> Option<usize> {
        let mut cur = self.buckets[self.bucket_of(reference)];
        while let Some(idx) = cur {
            let e = self.entry(idx);
            if e.node.reference() == *reference {
                return Some(idx);
            }
            cur = e.hash_next;
        }
        None
    }

    /// Stage a freshly built node under a new heap id.
    pub fn adopt(&mut self, build: impl FnOnce(NodeReference) -> TreeNode) -> NodeReference {
        let reference = self.new_heap_id();
        let node = build(reference);
        debug_assert_eq!(node.reference(), reference);
        let estimate = node.heap_size_estimate();

        let idx = match self.free_head {
            Some(idx) => {
                self.free_head = match &self.slots[idx] {
                    Slot::Free { next } => *next,
                    Slot::Used(_) => unreachable!("used slot on the free list"),
                };
                idx
            }
            None => {
                self.slots.push(Slot::Free { next: None });
                self.slots.len() - 1
            }
        };

        let bucket = self.bucket_of(&reference);
        self.slots[idx] = Slot::Used(Entry {
            node,
            estimate,
            hash_next: self.buckets[bucket],
            newer: None,
            older: self.mru,
        });
        self.buckets[bucket] = Some(idx);

        if let Some(old_mru) = self.mru {
            self.entry_mut(old_mru).newer = Some(idx);
        } else {
            self.lru = Some(idx);
        }
        self.mru = Some(idx);

        self.len += 1;
        self.memory_used += estimate;
        reference
    }

    pub fn create_empty_leaf(&mut self, capacity: usize) -> NodeReference {
        self.adopt(|r| TreeNode::Leaf(TreeLeaf::new_heap(r, capacity)))
    }

    pub fn create_empty_branch(&mut self) -> NodeReference {
        self.adopt(|r| TreeNode::Branch(TreeBranch::new_heap(r)))
    }

    /// Heap-mutable copy of any node under a fresh id. Leaf sources
    /// (stored or sparse) materialize into a buffer of `leaf_capacity`
    /// bytes.
    pub fn copy(&mut self, source: &TreeNode, leaf_capacity: usize) -> NodeReference {
        match source {
            TreeNode::Leaf(src) => {
                let size = src.size();
                let capacity = leaf_capacity.max(size);
                self.adopt(|r| {
                    let mut leaf = TreeLeaf::new_heap(r, capacity);
                    leaf.set_size(size).expect("size within capacity");
                    let mut tmp = vec![0u8; size];
                    src.read(0, &mut tmp).expect("full source read");
                    leaf.put(0, &tmp).expect("copy within capacity");
                    TreeNode::Leaf(leaf)
                })
            }
            TreeNode::Branch(src) => {
                let count = src.child_count();
                let mut refs = Vec::with_capacity(count);
                let mut extents = Vec::with_capacity(count);
                let mut keys: Vec<Key> = Vec::with_capacity(count.saturating_sub(1));
                for i in 0..count {
                    refs.push(src.child_ref(i));
                    extents.push(src.child_extent(i));
                    if i >= 1 {
                        keys.push(src.child_key(i));
                    }
                }
                self.adopt(|r| TreeNode::Branch(TreeBranch::from_parts(r, refs, extents, keys)))
            }
        }
    }

    pub fn fetch(&self, reference: &NodeReference) -> Option<&TreeNode> {
        self.find(reference).map(|idx| &self.entry(idx).node)
    }

    /// Mutate a staged node; the heap budget is re-estimated afterwards.
    pub fn with_mut<R>(
        &mut self,
        reference: &NodeReference,
        f: impl FnOnce(&mut TreeNode) -> R,
    ) -> Option<R> {
        let idx = self.find(reference)?;
        let e = self.entry_mut(idx);
        let result = f(&mut e.node);
        let estimate = e.node.heap_size_estimate();
        let old = std::mem::replace(&mut e.estimate, estimate);
        self.memory_used = self.memory_used - old + estimate;
        Some(result)
    }

    /// Unlink and free a staged node. A reference that is not resident is
    /// a caller bug and panics.
    pub fn delete(&mut self, reference: &NodeReference) {
        let bucket = self.bucket_of(reference);
        let mut prev: Option<usize> = None;
        let mut cur = self.buckets[bucket];
        let idx = loop {
            let idx = match cur {
                Some(idx) => idx,
                None => panic!("delete of node {} not in heap", reference),
            };
            if self.entry(idx).node.reference() == *reference {
                break idx;
            }
            prev = Some(idx);
            cur = self.entry(idx).hash_next;
        };

        let hash_next = self.entry(idx).hash_next;
        match prev {
            Some(p) => self.entry_mut(p).hash_next = hash_next,
            None => self.buckets[bucket] = hash_next,
        }

        let (newer, older, estimate) = {
            let e = self.entry(idx);
            (e.newer, e.older, e.estimate)
        };
        match newer {
            Some(n) => self.entry_mut(n).older = older,
            None => self.mru = older,
        }
        match older {
            Some(o) => self.entry_mut(o).newer = newer,
            None => self.lru = newer,
        }

        self.slots[idx] = Slot::Free {
            next: self.free_head,
        };
        self.free_head = Some(idx);
        self.len -= 1;
        self.memory_used -= estimate;
    }

    /// All resident references, MRU first.
    pub fn refs(&self) -> Vec<NodeReference> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.mru;
        while let Some(idx) = cur {
            let e = self.entry(idx);
            out.push(e.node.reference());
            cur = e.older;
        }
        out
    }

    /// Up to `count` references from the LRU tail, least recent first.
    pub fn lru_victims(&self, count: usize) -> Vec<NodeReference> {
        let mut out = Vec::with_capacity(count.min(self.len));
        let mut cur = self.lru;
        while let (Some(idx), true) = (cur, out.len() < count) {
            let e = self.entry(idx);
            out.push(e.node.reference());
            cur = e.newer;
        }
        out
    }
}
