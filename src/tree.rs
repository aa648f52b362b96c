//! Filepath: src/tree.rs
//!
//! The tree driver: traversal, the public operation surface, and SMO
//! orchestration.
//!
//! Every public operation pins an epoch, traverses from the root cell to a
//! leaf (recording internal hops on a [`Stack`]), and performs a leaf-local
//! multi-word CAS. Transient outcomes (`NodeFrozen`, `NotEnoughSpace`, CAS
//! losses) are consumed here by retrying or by running a structural
//! modification.
//!
//! # Structural modifications
//!
//! A full leaf is frozen, split into two fresh leaves, and the separator is
//! carried up through `prepare_for_split`, which rebuilds (and if necessary
//! recursively splits) the ancestors. The finished replacement is published
//! by a single CAS: a child-pointer swap in the surviving ancestor, or a
//! root-cell swap. Two disciplines keep racing SMOs sound:
//!
//! - **Only frozen nodes are copied.** A node is split or rebuilt only once
//!   its frozen bit is observed set (usually set by this thread). Frozen
//!   nodes are immutable, so every copy is consistent, and competing
//!   installers of the same node race a compare-and-swap with the same
//!   expected value - exactly one wins.
//! - **Losers abandon.** An installer whose expected node has vanished (or
//!   whose target froze) walks away; its prepared nodes leak and the frozen
//!   originals remain reachable through the winner. The retry loop then
//!   re-observes the tree. A frozen leaf whose installer lost is compacted
//!   back into the tree by whichever operation trips over it
//!   ([`BzTree::try_replace_frozen_leaf`]).
//!
//! Nodes frozen by an SMO are retired through the epoch manager only after
//! that SMO's install commits; threads still reading them inside earlier
//! epochs keep them alive until their guards drop.

use std::fmt::Write as _;

use crossbeam_epoch::Guard;
use mwcas::{MwCas, U64Pointer};

use crate::error::{Error, OpError};
use crate::key::{pad_key_length, PAYLOAD_SIZE};
use crate::leaf::LeafNode;
use crate::metadata::META_SIZE;
use crate::node::{Node, NodePtr, NODE_HEADER_SIZE};
use crate::scanner::RangeScanner;
use crate::stack::{Frame, Stack};
use crate::status::MAX_NODE_SIZE;
use crate::tracing_helpers::{debug_log, warn_log};

/// Bounded freeze/frozen retry: a liveness knob, not a correctness one.
/// After this many failed attempts a thread stops waiting and either
/// proceeds against the frozen node or repairs it itself.
pub(crate) const MAX_FREEZE_RETRY: u32 = 8;

// ============================================================================
//  Params
// ============================================================================

/// Tree configuration.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    /// Upper bound on a leaf's used bytes before an insert forces a split;
    /// also caps internal node growth.
    pub split_threshold: u32,

    /// Reserved for merge-on-delete, which this structure does not perform;
    /// accepted and stored so configurations round-trip.
    pub merge_threshold: u32,

    /// Fixed arena size of every leaf node, in bytes.
    pub leaf_node_size: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            split_threshold: 3072,
            merge_threshold: 1024,
            leaf_node_size: 4096,
        }
    }
}

// ============================================================================
//  SplitReplacement
// ============================================================================

/// What a `prepare_for_split` chain produced.
pub(crate) struct SplitReplacement {
    /// The node to install in place of the popped ancestor.
    pub(crate) node: NodePtr,

    /// Set when `node` is a freshly built root: the node the root cell is
    /// expected to still hold.
    pub(crate) root_expected: Option<NodePtr>,
}

// ============================================================================
//  BzTree
// ============================================================================

/// A latch-free, concurrent, ordered byte-string -> `u64` index.
///
/// All operations are safe to call from any number of threads sharing the
/// tree by reference; there are no locks, only multi-word CAS linearization
/// points and epoch-based reclamation.
pub struct BzTree {
    /// The root cell: a single CAS-swappable word holding the root address.
    root: U64Pointer,

    params: Params,
}

// SAFETY: all shared state is behind CAS words and the nodes' own
// synchronization contracts.
unsafe impl Send for BzTree {}
unsafe impl Sync for BzTree {}

impl Default for BzTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BzTree {
    fn drop(&mut self) {
        // SAFETY: drop has exclusive access; no guard can still reach the
        // tree's nodes.
        let guard: &Guard = unsafe { crossbeam_epoch::unprotected() };
        let root: NodePtr = NodePtr::from_addr(self.root.read(guard));

        unsafe { root.drop_subtree() };
    }
}

impl BzTree {
    /// Create a tree with default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::with_params(Params::default())
    }

    /// Create a tree with explicit parameters.
    ///
    /// # Panics
    ///
    /// Panics if the parameters are inconsistent: node size out of range or
    /// unaligned, or a split threshold larger than the node.
    #[must_use]
    pub fn with_params(params: Params) -> Self {
        assert!(params.leaf_node_size >= 256, "leaf_node_size too small");
        assert!(params.leaf_node_size <= MAX_NODE_SIZE, "leaf_node_size too large");
        assert_eq!(params.leaf_node_size % 8, 0, "leaf_node_size must be word-aligned");
        assert!(params.split_threshold >= 128, "split_threshold too small");
        assert!(
            params.split_threshold <= params.leaf_node_size,
            "split_threshold exceeds leaf_node_size"
        );

        let root: NodePtr = NodePtr::alloc(Node::Leaf(LeafNode::new(params.leaf_node_size)));

        Self {
            root: U64Pointer::new(root.addr()),
            params,
        }
    }

    #[inline]
    #[must_use]
    pub fn params(&self) -> Params {
        self.params
    }

    #[inline]
    #[must_use]
    fn root_ptr(&self, guard: &Guard) -> NodePtr {
        NodePtr::from_addr(self.root.read(guard))
    }

    /// Reject keys that could never be inserted: the empty key is reserved
    /// for internal dummies, and a key must leave room for at least three
    /// records per leaf or splitting cannot make progress.
    fn validate_insert_key(&self, key: &[u8]) -> Result<(), Error> {
        assert!(!key.is_empty(), "empty keys are reserved for internal node dummies");

        if key.len() > u16::MAX as usize {
            return Err(Error::KeyTooLong);
        }

        let record_size: u32 = META_SIZE + pad_key_length(key.len() as u32) + PAYLOAD_SIZE;
        if NODE_HEADER_SIZE + 3 * record_size > self.params.split_threshold {
            return Err(Error::KeyTooLong);
        }

        Ok(())
    }

    // ========================================================================
    //  Traversal
    // ========================================================================

    /// Walk from the root to the leaf covering `key`, pushing one frame per
    /// internal hop. The leaf itself is not pushed.
    pub(crate) fn traverse_to_leaf(
        &self,
        mut stack: Option<&mut Stack<'_>>,
        key: &[u8],
        le_child: bool,
        guard: &Guard,
    ) -> NodePtr {
        let mut node_ptr: NodePtr = self.root_ptr(guard);

        loop {
            // SAFETY: read from a live CAS target under this guard's epoch.
            let node: &Node = unsafe { node_ptr.deref(guard) };

            let Node::Internal(internal) = node else {
                return node_ptr;
            };

            let slot: u32 = internal.get_child_index(key, le_child);

            if let Some(stack) = stack.as_deref_mut() {
                stack.push(Frame {
                    node: node_ptr,
                    slot,
                    meta: internal.metadata_at(slot),
                });
            }

            node_ptr = internal.child_at(slot, guard);
        }
    }

    /// Walk toward `key` until reaching `stop_at`, pushing every hop and
    /// finally the stop node itself (under the previous hop's slot, which
    /// consumers must not read). Returns whether `stop_at` was actually
    /// reached; if a concurrent SMO removed it, the walk ends at the leaf
    /// boundary and the caller must treat its plan as stale.
    pub(crate) fn traverse_to_node(
        &self,
        stack: &mut Stack<'_>,
        key: &[u8],
        stop_at: NodePtr,
        guard: &Guard,
    ) -> bool {
        let mut node_ptr: NodePtr = self.root_ptr(guard);
        let mut last_slot: u32 = 0;
        let mut last_meta = crate::metadata::RecordMetadata::vacant();

        while node_ptr != stop_at {
            // SAFETY: read from a live CAS target under this guard's epoch.
            let node: &Node = unsafe { node_ptr.deref(guard) };

            if node.is_leaf() {
                break;
            }

            let internal = node.expect_internal();
            let slot: u32 = internal.get_child_index(key, false);
            let meta = internal.metadata_at(slot);

            stack.push(Frame {
                node: node_ptr,
                slot,
                meta,
            });

            last_slot = slot;
            last_meta = meta;
            node_ptr = internal.child_at(slot, guard);
        }

        stack.push(Frame {
            node: node_ptr,
            slot: last_slot,
            meta: last_meta,
        });

        node_ptr == stop_at
    }

    // ========================================================================
    //  Insert + SMO
    // ========================================================================

    /// Insert `key -> payload`. Fails with [`Error::KeyExists`] if a visible
    /// record with this key is already present.
    pub fn insert(&self, key: &[u8], payload: u64) -> Result<(), Error> {
        self.validate_insert_key(key)?;

        let guard = crossbeam_epoch::pin();
        let mut stack = Stack::new(self);
        let mut retired: Vec<NodePtr> = Vec::new();
        let mut freeze_retry: u32 = 0;
        let mut frozen_seen: u32 = 0;

        loop {
            stack.clear();
            let leaf_ptr: NodePtr = self.traverse_to_leaf(Some(&mut stack), key, false, &guard);
            // SAFETY: just traversed under this guard's epoch.
            let leaf: &LeafNode = unsafe { leaf_ptr.deref(&guard) }.expect_leaf();

            match leaf.insert(key, payload, self.params.split_threshold, &guard) {
                Ok(()) => return Ok(()),

                Err(OpError::KeyExists) => return Err(Error::KeyExists),

                Err(OpError::NodeFrozen) => {
                    frozen_seen += 1;

                    if frozen_seen > MAX_FREEZE_RETRY {
                        // A frozen leaf nobody is replacing: its SMO lost an
                        // install race. Compact it back into the tree.
                        self.try_replace_frozen_leaf(key, &guard);
                        frozen_seen = 0;
                    }

                    continue;
                }

                Err(OpError::NotEnoughSpace) => {}

                Err(OpError::NotFound | OpError::MwCasFailure) => {
                    unreachable!("leaf insert does not produce this code")
                }
            }

            // The leaf is full: freeze it, then split.
            if leaf.freeze(&guard) {
                retired.push(leaf_ptr);
            } else {
                freeze_retry += 1;

                if freeze_retry <= MAX_FREEZE_RETRY {
                    continue;
                }

                if !leaf.status_word(&guard).is_frozen() {
                    // The bounded retry only stops waiting; an unfrozen
                    // node is still never copied.
                    continue;
                }
            }

            if leaf.visible_records(&guard) <= 2 {
                // The node is full of tombstones, not records; compaction
                // reclaims the space and no split is needed.
                self.try_replace_frozen_leaf(key, &guard);
                retired.clear();
                continue;
            }

            match leaf.prepare_for_split(
                leaf_ptr,
                &mut stack,
                self.params.split_threshold,
                &mut retired,
                &guard,
            ) {
                Some(replacement) => {
                    if !self.install_split(&mut stack, key, replacement, &mut retired, &guard) {
                        // Lost the install race: the frozen originals stay
                        // reachable through the winner, so nothing retires.
                        retired.clear();
                    }
                }

                None => retired.clear(),
            }
        }
    }

    /// Publish a prepared replacement: swap the popped ancestor's address in
    /// its parent, or swap the root cell. Returns `false` when the install
    /// lost to a competing SMO and the caller must abandon its plan.
    fn install_split(
        &self,
        stack: &mut Stack<'_>,
        key: &[u8],
        replacement: SplitReplacement,
        retired: &mut Vec<NodePtr>,
        guard: &Guard,
    ) -> bool {
        loop {
            let Some(parent_frame) = stack.pop() else {
                // The chain consumed the whole path: `replacement.node` is a
                // fresh root and must displace exactly the node it was built
                // over.
                let Some(expected) = replacement.root_expected else {
                    return false;
                };

                if self.change_root(expected, replacement.node, guard) {
                    self.retire_all(retired, guard);
                    return true;
                }

                warn_log!("root install lost to a competing SMO");
                return false;
            };

            let Some(grand_frame) = stack.pop() else {
                // The popped ancestor is the root itself.
                if self.change_root(parent_frame.node, replacement.node, guard) {
                    self.retire_all(retired, guard);
                    return true;
                }

                warn_log!("root swap lost to a competing SMO");
                return false;
            };

            // SAFETY: stack addresses were read under this guard's epoch.
            let grand_parent = unsafe { grand_frame.node.deref(guard) }.expect_internal();
            // The entry followed toward the old parent is a committed one.
            debug_assert!(grand_frame.meta.is_visible());

            match grand_parent.update(grand_frame.slot, parent_frame.node, replacement.node, guard)
            {
                Ok(()) => {
                    self.retire_all(retired, guard);
                    return true;
                }

                Err(OpError::NodeFrozen) => {
                    // The grandparent is being superseded; whoever freezes
                    // it owns that level now.
                    return false;
                }

                Err(_) => {
                    debug_log!("install lost a child swap, retraversing");
                    stack.clear();

                    if !self.traverse_to_node(stack, key, parent_frame.node, guard) {
                        return false;
                    }

                    // The terminal frame is the old parent again; loop to
                    // re-pop it together with its fresh grandparent.
                }
            }
        }
    }

    /// Swap the root cell. The expected old root is frozen by the caller's
    /// SMO chain, which is what excludes competing replacers.
    fn change_root(&self, expected: NodePtr, new_root: NodePtr, guard: &Guard) -> bool {
        let mut mwcas = MwCas::new();
        mwcas.compare_exchange_u64(&self.root, expected.addr(), new_root.addr());
        mwcas.exec(guard)
    }

    fn retire_all(&self, retired: &mut Vec<NodePtr>, guard: &Guard) {
        for ptr in retired.drain(..) {
            // SAFETY: every entry was frozen by this SMO and has just been
            // unlinked by the install's committed CAS.
            unsafe { ptr.retire(guard) };
        }
    }

    /// Repair path for a frozen leaf whose SMO abandoned: build its
    /// consolidated copy and swap it in. The replaced leaf is deliberately
    /// leaked - a racing SMO may still hold it as a copy source, and a rare
    /// leak beats a double retirement.
    fn try_replace_frozen_leaf(&self, key: &[u8], guard: &Guard) {
        let mut stack = Stack::new(self);
        let leaf_ptr: NodePtr = self.traverse_to_leaf(Some(&mut stack), key, false, guard);
        // SAFETY: just traversed under this guard's epoch.
        let leaf: &LeafNode = unsafe { leaf_ptr.deref(guard) }.expect_leaf();

        if !leaf.status_word(guard).is_frozen() {
            return;
        }

        let new_ptr: NodePtr = NodePtr::alloc(Node::Leaf(leaf.consolidated_copy(guard)));

        let installed: bool = match stack.pop() {
            None => self.change_root(leaf_ptr, new_ptr, guard),

            Some(frame) => {
                // SAFETY: stack addresses were read under this guard's epoch.
                let parent = unsafe { frame.node.deref(guard) }.expect_internal();
                parent.update(frame.slot, leaf_ptr, new_ptr, guard).is_ok()
            }
        };

        if installed {
            debug_log!("compacted a stranded frozen leaf back into the tree");
        } else {
            // Never published; free it now.
            unsafe { new_ptr.drop_subtree() };
        }
    }

    // ========================================================================
    //  Point Operations
    // ========================================================================

    /// Read the payload stored under `key`.
    #[must_use]
    pub fn read(&self, key: &[u8]) -> Option<u64> {
        assert!(!key.is_empty(), "empty keys are reserved for internal node dummies");

        let guard = crossbeam_epoch::pin();
        let leaf_ptr: NodePtr = self.traverse_to_leaf(None, key, false, &guard);
        // SAFETY: just traversed under this guard's epoch.
        let leaf: &LeafNode = unsafe { leaf_ptr.deref(&guard) }.expect_leaf();

        leaf.read(key, &guard)
    }

    /// Replace the payload of an existing record.
    pub fn update(&self, key: &[u8], payload: u64) -> Result<(), Error> {
        assert!(!key.is_empty(), "empty keys are reserved for internal node dummies");

        let guard = crossbeam_epoch::pin();
        let mut frozen_seen: u32 = 0;

        loop {
            let leaf_ptr: NodePtr = self.traverse_to_leaf(None, key, false, &guard);
            // SAFETY: just traversed under this guard's epoch.
            let leaf: &LeafNode = unsafe { leaf_ptr.deref(&guard) }.expect_leaf();

            match leaf.update(key, payload, &guard) {
                Ok(()) => return Ok(()),

                Err(OpError::NotFound) => return Err(Error::NotFound),

                Err(OpError::NodeFrozen) => {
                    frozen_seen += 1;

                    if frozen_seen > MAX_FREEZE_RETRY {
                        self.try_replace_frozen_leaf(key, &guard);
                        frozen_seen = 0;
                    }
                }

                Err(_) => unreachable!("leaf update does not produce this code"),
            }
        }
    }

    /// Insert or update: the record ends up holding `payload` either way.
    ///
    /// Composed of `read` + `insert`/`update`; each inner operation has its
    /// own linearization point, and raced outcomes re-enter the loop, so
    /// concurrent upserts of one key all succeed.
    pub fn upsert(&self, key: &[u8], payload: u64) -> Result<(), Error> {
        self.validate_insert_key(key)?;

        loop {
            let existing: Option<u64> = self.read(key);

            match existing {
                Some(current) if current == payload => return Ok(()),

                Some(_) => match self.update(key, payload) {
                    Ok(()) => return Ok(()),

                    // Deleted under us; retry as an insert.
                    Err(Error::NotFound) => continue,

                    Err(err) => return Err(err),
                },

                None => match self.insert(key, payload) {
                    Ok(()) => return Ok(()),

                    // Inserted under us; retry as an update.
                    Err(Error::KeyExists) => continue,

                    Err(err) => return Err(err),
                },
            }
        }
    }

    /// Remove the record stored under `key`.
    ///
    /// The leaf keeps the record's bytes accounted until consolidation;
    /// `merge_threshold` is reserved configuration and no merge runs.
    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        assert!(!key.is_empty(), "empty keys are reserved for internal node dummies");

        let guard = crossbeam_epoch::pin();
        let mut frozen_seen: u32 = 0;

        loop {
            let leaf_ptr: NodePtr = self.traverse_to_leaf(None, key, false, &guard);
            // SAFETY: just traversed under this guard's epoch.
            let leaf: &LeafNode = unsafe { leaf_ptr.deref(&guard) }.expect_leaf();

            match leaf.delete(key, &guard) {
                Ok(()) => return Ok(()),

                Err(OpError::NotFound) => return Err(Error::NotFound),

                Err(OpError::NodeFrozen) => {
                    frozen_seen += 1;

                    if frozen_seen > MAX_FREEZE_RETRY {
                        self.try_replace_frozen_leaf(key, &guard);
                        frozen_seen = 0;
                    }
                }

                Err(_) => unreachable!("leaf delete does not produce this code"),
            }
        }
    }

    // ========================================================================
    //  Range Scan
    // ========================================================================

    /// Scan `[begin, end]`, both bounds inclusive, in ascending key order.
    #[must_use]
    pub fn range_scan(&self, begin: &[u8], end: &[u8]) -> RangeScanner<'_> {
        assert!(!begin.is_empty(), "empty keys are reserved for internal node dummies");

        RangeScanner::new(self, begin, end)
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Render the whole tree, depth-first, into a string.
    #[must_use]
    pub fn dump(&self) -> String {
        let guard = crossbeam_epoch::pin();
        let mut out = String::new();

        let _ = writeln!(
            out,
            "bztree {{ split_threshold: {}, leaf_node_size: {} }}",
            self.params.split_threshold, self.params.leaf_node_size,
        );

        self.dump_subtree(self.root_ptr(&guard), &mut out, 2, &guard);
        out
    }

    fn dump_subtree(&self, node_ptr: NodePtr, out: &mut String, indent: usize, guard: &Guard) {
        // SAFETY: reachable node under a pinned guard.
        match unsafe { node_ptr.deref(guard) } {
            Node::Leaf(leaf) => leaf.dump_into(out, indent, guard),

            Node::Internal(internal) => {
                internal.dump_into(out, indent, guard);

                for slot in 0..internal.sorted_count() {
                    self.dump_subtree(internal.child_at(slot, guard), out, indent + 2, guard);
                }
            }
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Small nodes so a handful of records forces structural modifications.
    fn small_tree() -> BzTree {
        BzTree::with_params(Params {
            split_threshold: 256,
            merge_threshold: 0,
            leaf_node_size: 256,
        })
    }

    fn key_of(index: u32) -> Vec<u8> {
        format!("key-{index:04}").into_bytes()
    }

    // ========================================================================
    //  Point Operations
    // ========================================================================

    #[test]
    fn insert_read_roundtrip() {
        let tree = BzTree::new();

        tree.insert(b"hello", 42).unwrap();
        assert_eq!(tree.read(b"hello"), Some(42));
        assert_eq!(tree.read(b"absent"), None);
    }

    #[test]
    fn duplicate_insert_keeps_first_payload() {
        let tree = BzTree::new();

        tree.insert(b"abc", 100).unwrap();
        tree.insert(b"bdef", 100).unwrap();
        assert_eq!(tree.insert(b"abc", 200), Err(Error::KeyExists));
        assert_eq!(tree.read(b"abc"), Some(100));
    }

    #[test]
    fn update_and_delete() {
        let tree = BzTree::new();

        assert_eq!(tree.update(b"k", 1), Err(Error::NotFound));
        tree.insert(b"k", 1).unwrap();
        tree.update(b"k", 2).unwrap();
        assert_eq!(tree.read(b"k"), Some(2));

        tree.delete(b"k").unwrap();
        assert_eq!(tree.read(b"k"), None);
        assert_eq!(tree.delete(b"k"), Err(Error::NotFound));
    }

    #[test]
    fn delete_then_insert_again() {
        let tree = BzTree::new();

        tree.insert(b"k", 1).unwrap();
        tree.delete(b"k").unwrap();
        tree.insert(b"k", 2).unwrap();
        assert_eq!(tree.read(b"k"), Some(2));
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let tree = BzTree::new();

        tree.upsert(b"k", 1).unwrap();
        assert_eq!(tree.read(b"k"), Some(1));

        tree.upsert(b"k", 2).unwrap();
        assert_eq!(tree.read(b"k"), Some(2));

        // Equal payload is a no-op upsert.
        tree.upsert(b"k", 2).unwrap();
        assert_eq!(tree.read(b"k"), Some(2));
    }

    #[test]
    fn rejects_oversized_keys() {
        let tree = small_tree();
        let huge = vec![b'x'; 4096];

        assert_eq!(tree.insert(&huge, 1), Err(Error::KeyTooLong));
        assert_eq!(tree.upsert(&huge, 1), Err(Error::KeyTooLong));
    }

    // ========================================================================
    //  Splits
    // ========================================================================

    #[test]
    fn split_preserves_all_records() {
        let tree = small_tree();

        // Way past one leaf's capacity.
        for index in 0..64 {
            tree.insert(&key_of(index), u64::from(index)).unwrap();
        }

        for index in 0..64 {
            assert_eq!(tree.read(&key_of(index)), Some(u64::from(index)), "key {index}");
        }

        // The root must have become internal, with separators routing reads.
        assert!(tree.dump().contains("internal"));
    }

    #[test]
    fn split_keeps_separator_key_readable() {
        let tree = small_tree();

        // Fill exactly until the first split, then verify every key
        // (including the one that became the separator) still reads.
        for index in 0..16 {
            tree.insert(&key_of(index), u64::from(index)).unwrap();
        }

        for index in 0..16 {
            assert_eq!(tree.read(&key_of(index)), Some(u64::from(index)), "key {index}");
        }
    }

    #[test]
    fn multi_level_split() {
        let tree = small_tree();

        for index in 0..512 {
            tree.insert(&key_of(index), u64::from(index)).unwrap();
        }

        for index in 0..512 {
            assert_eq!(tree.read(&key_of(index)), Some(u64::from(index)), "key {index}");
        }

        let scanned: Vec<_> = tree.range_scan(&key_of(0), &key_of(511)).collect();
        assert_eq!(scanned.len(), 512);
    }

    #[test]
    fn descending_inserts_split_correctly() {
        let tree = small_tree();

        for index in (0..128).rev() {
            tree.insert(&key_of(index), u64::from(index)).unwrap();
        }

        for index in 0..128 {
            assert_eq!(tree.read(&key_of(index)), Some(u64::from(index)), "key {index}");
        }
    }

    // ========================================================================
    //  Range Scans
    // ========================================================================

    #[test]
    fn range_scan_is_ordered_and_complete() {
        let tree = small_tree();

        for index in 0..100 {
            tree.insert(&key_of(index), u64::from(index)).unwrap();
        }

        let records: Vec<_> = tree.range_scan(&key_of(0), &key_of(99)).collect();
        assert_eq!(records.len(), 100);

        for (position, record) in records.iter().enumerate() {
            assert_eq!(record.key(), key_of(position as u32).as_slice());
            assert_eq!(record.payload(), position as u64);
        }
    }

    #[test]
    fn range_scan_respects_bounds() {
        let tree = small_tree();

        for index in 0..50 {
            tree.insert(&key_of(index), u64::from(index)).unwrap();
        }

        let records: Vec<_> = tree.range_scan(&key_of(10), &key_of(19)).collect();
        let keys: Vec<&[u8]> = records.iter().map(|record| record.key()).collect();

        assert_eq!(keys.len(), 10);
        assert_eq!(keys.first().copied(), Some(key_of(10).as_slice()));
        assert_eq!(keys.last().copied(), Some(key_of(19).as_slice()));
    }

    #[test]
    fn range_scan_after_deleting_evens() {
        let tree = small_tree();

        for value in 1..=100u32 {
            tree.insert(&key_of(value), u64::from(value)).unwrap();
        }

        for value in (2..=100u32).step_by(2) {
            tree.delete(&key_of(value)).unwrap();
        }

        let records: Vec<_> = tree.range_scan(&key_of(1), &key_of(100)).collect();
        assert_eq!(records.len(), 50);

        for record in &records {
            assert_eq!(record.payload() % 2, 1, "only odd payloads survive");
        }

        // Strictly ascending output.
        for pair in records.windows(2) {
            assert!(pair[0].key() < pair[1].key());
        }
    }

    #[test]
    fn range_scan_of_empty_tree() {
        let tree = BzTree::new();

        assert_eq!(tree.range_scan(b"a", b"z").count(), 0);
    }

    // ========================================================================
    //  Dump
    // ========================================================================

    #[test]
    fn dump_renders_tree() {
        let tree = BzTree::new();
        tree.insert(b"abc", 7).unwrap();

        let dump = tree.dump();
        assert!(dump.contains("bztree"));
        assert!(dump.contains("leaf"));
        assert!(dump.contains("abc"));
    }
}
