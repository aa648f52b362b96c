//! Filepath: src/internal.rs
//!
//! Internal (routing) node.
//!
//! Internal nodes are produced fully formed and never mutated in place except
//! for two things: the frozen bit of the status word, and child-pointer words
//! swapped by multi-word CAS when a child is superseded. Everything else -
//! separator keys, metadata, entry count - is immutable after construction,
//! so traversals read them without ceremony.
//!
//! Entries are fully sorted. Slot 0 is the dummy: a zero-length key whose
//! payload is the leftmost child. For `i >= 1`, the child stored at slot `i`
//! covers keys strictly greater than the separator at slot `i` and at most
//! the separator at slot `i + 1` (the last child is unbounded above). A
//! separator key itself lives in the subtree to its left: traversal goes
//! left on `<=`, right on `>`.

use std::fmt::Write as _;

use crossbeam_epoch::Guard;
use mwcas::{MwCas, U64Pointer};

use crate::error::{OpError, OpResult};
use crate::key::{key_compare, pad_key_length, PAYLOAD_SIZE};
use crate::metadata::{RecordMetadata, META_SIZE};
use crate::node::{Node, NodePtr, NODE_HEADER_SIZE};
use crate::stack::Stack;
use crate::status::{try_freeze, StatusWord};
use crate::tracing_helpers::debug_log;
use crate::tree::{SplitReplacement, MAX_FREEZE_RETRY};

// ============================================================================
//  InternalNode
// ============================================================================

/// An internal routing node. See the module docs for the entry contract.
pub(crate) struct InternalNode {
    /// Packed [`StatusWord`]; only the frozen bit ever changes.
    /// `record_count` stays zero - internal nodes track `sorted_count` only.
    status: U64Pointer,

    /// Number of entries, dummy included. At least 2 for any node that
    /// carries a separator.
    sorted_count: u32,

    /// Byte size accounting for the split threshold (header + entries).
    node_size: u32,

    /// Entry metadata, immutable after construction.
    metadata: Box<[RecordMetadata]>,

    /// Child-pointer words; multi-word-CAS targets.
    payloads: Box<[U64Pointer]>,

    /// Separator key bytes, immutable after construction.
    keys: Box<[u8]>,
}

impl InternalNode {
    // ========================================================================
    //  Construction
    // ========================================================================

    /// A root-like node of two entries: `(dummy, left)` and `(key, right)`.
    #[must_use]
    pub(crate) fn new_two_child(key: &[u8], left_child: NodePtr, right_child: NodePtr) -> Self {
        debug_assert!(!key.is_empty());
        debug_assert!(!left_child.is_null() && !right_child.is_null());

        let key_length: u32 = key.len() as u32;
        let alloc_size: u32 = NODE_HEADER_SIZE
            + pad_key_length(key_length)
            + 2 * PAYLOAD_SIZE
            + 2 * META_SIZE;

        let mut writer = EntryWriter::new(alloc_size, 2);
        writer.push(&[], 0, PAYLOAD_SIZE, left_child.addr());
        writer.push(
            key,
            key_length,
            pad_key_length(key_length) + PAYLOAD_SIZE,
            right_child.addr(),
        );

        writer.finish(alloc_size)
    }

    /// Copy entries `[begin, begin + count)` of `src` into a new node,
    /// optionally splicing in one new separator and optionally overriding
    /// slot 0.
    ///
    /// With `key` present, the new separator is inserted at its sorted
    /// position: the entry preceding it has its payload replaced by
    /// `left_child`, and the separator's own payload is `right_child`.
    ///
    /// With `leftmost_override` present, a fresh dummy entry carrying it is
    /// prepended - used when the new node is the right half of a split and
    /// must adopt the migrating separator's subtree as its leftmost child.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_range(
        src: &InternalNode,
        begin: u32,
        count: u32,
        key: Option<&[u8]>,
        left_child: NodePtr,
        right_child: NodePtr,
        leftmost_override: Option<NodePtr>,
        guard: &Guard,
    ) -> Self {
        let mut alloc_size: u32 = NODE_HEADER_SIZE;

        if begin > 0 {
            // The source dummy is not copied; a fresh one takes its place.
            alloc_size += PAYLOAD_SIZE + META_SIZE;
        }

        for slot in begin..begin + count {
            alloc_size += src.metadata[slot as usize].total_length() + META_SIZE;
        }

        if let Some(key) = key {
            assert!(!key.is_empty(), "zero-length separator");
            alloc_size += pad_key_length(key.len() as u32) + PAYLOAD_SIZE + META_SIZE;
        }

        let slots: usize =
            count as usize + usize::from(leftmost_override.is_some()) + usize::from(key.is_some());
        let mut writer = EntryWriter::new(alloc_size, slots);

        if let Some(leftmost) = leftmost_override {
            debug_assert!(!leftmost.is_null());
            writer.push(&[], 0, PAYLOAD_SIZE, leftmost.addr());
        }

        let mut pending_key: Option<&[u8]> = key;

        for slot in begin..begin + count {
            let meta: RecordMetadata = src.metadata[slot as usize];
            let src_key: &[u8] = src.key_at(meta);
            let child: u64 = src.child_at(slot, guard).addr();

            if let Some(new_key) = pending_key {
                match key_compare(src_key, new_key) {
                    std::cmp::Ordering::Greater => {
                        // The new separator slots in before this entry; the
                        // entry to its left now routes to the new left child.
                        writer.replace_last_payload(left_child.addr());

                        let key_length: u32 = new_key.len() as u32;
                        writer.push(
                            new_key,
                            key_length,
                            pad_key_length(key_length) + PAYLOAD_SIZE,
                            right_child.addr(),
                        );
                        writer.push(src_key, meta.key_length(), meta.total_length(), child);

                        pending_key = None;
                        continue;
                    }

                    std::cmp::Ordering::Equal => {
                        unreachable!("separator key already present in internal node")
                    }

                    std::cmp::Ordering::Less => {}
                }
            }

            writer.push(src_key, meta.key_length(), meta.total_length(), child);
        }

        if let Some(new_key) = pending_key {
            // Largest key in the node: append, then repoint the previous
            // entry at the new left child.
            let key_length: u32 = new_key.len() as u32;
            writer.push(
                new_key,
                key_length,
                pad_key_length(key_length) + PAYLOAD_SIZE,
                right_child.addr(),
            );
            writer.replace_payload_before_last(left_child.addr());
        }

        writer.finish(alloc_size)
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    #[inline]
    #[must_use]
    pub(crate) fn status_word(&self, guard: &Guard) -> StatusWord {
        StatusWord::from_word(self.status.read(guard))
    }

    #[inline]
    #[must_use]
    pub(crate) const fn sorted_count(&self) -> u32 {
        self.sorted_count
    }

    #[inline]
    #[must_use]
    pub(crate) fn metadata_at(&self, slot: u32) -> RecordMetadata {
        self.metadata[slot as usize]
    }

    #[inline]
    #[must_use]
    pub(crate) fn child_at(&self, slot: u32, guard: &Guard) -> NodePtr {
        NodePtr::from_addr(self.payloads[slot as usize].read(guard))
    }

    #[inline]
    #[must_use]
    fn key_at(&self, meta: RecordMetadata) -> &[u8] {
        let offset: usize = meta.offset() as usize;

        &self.keys[offset..offset + meta.key_length() as usize]
    }

    /// Separator key of an entry (empty for the dummy at slot 0).
    #[inline]
    #[must_use]
    pub(crate) fn separator_at(&self, slot: u32) -> &[u8] {
        self.key_at(self.metadata[slot as usize])
    }

    #[inline]
    pub(crate) fn freeze(&self, guard: &Guard) -> bool {
        try_freeze(&self.status, guard)
    }

    // ========================================================================
    //  Routing
    // ========================================================================

    /// Index of the entry whose child covers `key`.
    ///
    /// Binary search over the fully sorted entries; the dummy's zero-length
    /// key sorts below every user key. An exact separator match routes to
    /// the entry on its left, because a separator is the largest key of its
    /// left subtree (`<=` goes left). `get_le` additionally forces
    /// strictly-less routing when the search terminates at-or-above the key.
    #[must_use]
    pub(crate) fn get_child_index(&self, key: &[u8], get_le: bool) -> u32 {
        debug_assert!(!key.is_empty());

        let mut left: i64 = 0;
        let mut right: i64 = i64::from(self.sorted_count) - 1;

        loop {
            let mid: i64 = (left + right) / 2;
            let meta: RecordMetadata = self.metadata[mid as usize];

            match key_compare(key, self.key_at(meta)) {
                std::cmp::Ordering::Equal => {
                    debug_assert!(mid > 0, "user key matched the dummy entry");

                    return (mid - 1) as u32;
                }

                cmp if left > right => {
                    if cmp == std::cmp::Ordering::Less && get_le {
                        return (mid - 1) as u32;
                    }

                    return mid as u32;
                }

                std::cmp::Ordering::Greater => left = mid + 1,

                std::cmp::Ordering::Less => right = mid - 1,
            }
        }
    }

    // ========================================================================
    //  Child Swap
    // ========================================================================

    /// Swap the child word at `slot` from `old_child` to `new_child`.
    ///
    /// Two-word CAS: the child word plus a compare-and-set of the status word
    /// to itself, so the swap aborts if this node froze concurrently.
    pub(crate) fn update(
        &self,
        slot: u32,
        old_child: NodePtr,
        new_child: NodePtr,
        guard: &Guard,
    ) -> OpResult<()> {
        let status: StatusWord = self.status_word(guard);

        if status.is_frozen() {
            return Err(OpError::NodeFrozen);
        }

        let mut mwcas = MwCas::new();
        mwcas.compare_exchange_u64(&self.status, status.word(), status.word());
        mwcas.compare_exchange_u64(
            &self.payloads[slot as usize],
            old_child.addr(),
            new_child.addr(),
        );

        if mwcas.exec(guard) {
            Ok(())
        } else {
            Err(OpError::MwCasFailure)
        }
    }

    // ========================================================================
    //  Split
    // ========================================================================

    /// Absorb a migrating separator, splitting this (frozen) node if it
    /// would grow past `split_threshold`.
    ///
    /// On entry the stack's top is this node's own breadcrumb; it is popped
    /// so that the caller's install loop finds the real parent on top. If
    /// the split propagates, the separator at `sorted_count / 2` migrates
    /// up and the recursion continues; a consumed stack yields a fresh
    /// two-entry node for the caller to install as root. Returns `None`
    /// when this node vanished from the tree mid-chain; the caller must
    /// abandon the SMO.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn prepare_for_split(
        &self,
        self_ptr: NodePtr,
        stack: &mut Stack<'_>,
        split_threshold: u32,
        key: &[u8],
        left_child: NodePtr,
        right_child: NodePtr,
        retired: &mut Vec<NodePtr>,
        guard: &Guard,
    ) -> Option<SplitReplacement> {
        let data_size: u32 = self.node_size + key.len() as u32 + PAYLOAD_SIZE + META_SIZE;
        let new_node_size: u32 = NODE_HEADER_SIZE + data_size;

        if new_node_size < split_threshold {
            // Fits: a single replacement node with the separator spliced in.
            // The stack is left as-is; our own breadcrumb on top is exactly
            // the "old parent" the install loop must swap out.
            return Some(SplitReplacement {
                node: NodePtr::alloc(Node::Internal(Self::from_range(
                    self,
                    0,
                    self.sorted_count,
                    Some(key),
                    left_child,
                    right_child,
                    None,
                    guard,
                ))),
                root_expected: None,
            });
        }

        assert!(
            self.sorted_count >= 2,
            "internal node with fewer than two entries"
        );

        let n_left: u32 = self.sorted_count >> 1;
        let separator_meta: RecordMetadata = self.metadata[n_left as usize];
        let separator: Vec<u8> = self.key_at(separator_meta).to_vec();
        assert!(!separator.is_empty(), "zero-length separator");

        // The separator migrates up; its subtree becomes the right half's
        // leftmost child.
        let separator_child: NodePtr = self.child_at(n_left, guard);

        let (left, right) = match key_compare(key, &separator) {
            std::cmp::Ordering::Less => (
                Self::from_range(self, 0, n_left, Some(key), left_child, right_child, None, guard),
                Self::from_range(
                    self,
                    n_left + 1,
                    self.sorted_count - n_left - 1,
                    None,
                    NodePtr::null(),
                    NodePtr::null(),
                    Some(separator_child),
                    guard,
                ),
            ),

            std::cmp::Ordering::Greater => (
                Self::from_range(
                    self,
                    0,
                    n_left,
                    None,
                    NodePtr::null(),
                    NodePtr::null(),
                    None,
                    guard,
                ),
                Self::from_range(
                    self,
                    n_left + 1,
                    self.sorted_count - n_left - 1,
                    Some(key),
                    left_child,
                    right_child,
                    Some(separator_child),
                    guard,
                ),
            ),

            std::cmp::Ordering::Equal => {
                unreachable!("migrating separator equals an existing separator")
            }
        };

        let left_ptr: NodePtr = NodePtr::alloc(Node::Internal(left));
        let right_ptr: NodePtr = NodePtr::alloc(Node::Internal(right));

        // Pop our own breadcrumb so the install loop sees the real parent.
        stack.pop();

        let Some(parent_frame) = stack.top() else {
            return Some(SplitReplacement {
                node: NodePtr::alloc(Node::Internal(Self::new_two_child(
                    &separator, left_ptr, right_ptr,
                ))),
                root_expected: Some(self_ptr),
            });
        };

        let mut parent_ptr: NodePtr = parent_frame.node;
        let mut parent_slot: u32 = parent_frame.slot;
        let mut freeze_retry: u32 = 0;

        loop {
            // SAFETY: stack addresses were read under this guard's epoch.
            let parent: &InternalNode = unsafe { parent_ptr.deref(guard) }.expect_internal();
            let frozen_by_us: bool = parent.freeze(guard);

            if frozen_by_us || parent.status_word(guard).is_frozen() {
                if frozen_by_us {
                    retired.push(parent_ptr);
                } else if freeze_retry <= MAX_FREEZE_RETRY {
                    // Someone else holds the freeze; give their install a
                    // chance to land before proceeding against it.
                    freeze_retry += 1;
                    std::hint::spin_loop();
                    continue;
                }

                // The parent is frozen, so its child words are final. If it
                // no longer routes to this node, a competing install won
                // this level and these halves are stale.
                if parent.child_at(parent_slot, guard) != self_ptr {
                    debug_log!("internal split: node superseded under its parent, abandoning");
                    return None;
                }

                return parent.prepare_for_split(
                    parent_ptr,
                    stack,
                    split_threshold,
                    &separator,
                    left_ptr,
                    right_ptr,
                    retired,
                    guard,
                );
            }

            debug_log!("internal split: parent freeze lost, retraversing");
            stack.clear();

            if !stack.tree.traverse_to_node(stack, &separator, self_ptr, guard) {
                // This node is gone from the tree; the SMO is stale.
                return None;
            }

            stack.pop();

            let Some(frame) = stack.top() else {
                return Some(SplitReplacement {
                    node: NodePtr::alloc(Node::Internal(Self::new_two_child(
                        &separator, left_ptr, right_ptr,
                    ))),
                    root_expected: Some(self_ptr),
                });
            };

            parent_ptr = frame.node;
            parent_slot = frame.slot;
            freeze_retry += 1;
        }
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Append a human-readable rendition of this node's entries to `out`.
    pub(crate) fn dump_into(&self, out: &mut String, indent: usize, guard: &Guard) {
        let pad: String = " ".repeat(indent);
        let _ = writeln!(
            out,
            "{pad}internal {{ {}, sorted_count: {} }}",
            self.status_word(guard),
            self.sorted_count,
        );

        for slot in 0..self.sorted_count {
            let meta: RecordMetadata = self.metadata[slot as usize];
            let key: &[u8] = self.key_at(meta);

            let _ = writeln!(
                out,
                "{pad}  [{slot}] {} -> {:#x}",
                if key.is_empty() {
                    "<dummy>".to_string()
                } else {
                    format!("{:?}", String::from_utf8_lossy(key))
                },
                self.child_at(slot, guard).addr(),
            );
        }
    }
}

// ============================================================================
//  EntryWriter
// ============================================================================

/// Builds an internal node's entry arrays back-to-front from the high end of
/// the key region, mirroring the record layout of leaves.
struct EntryWriter {
    metadata: Vec<RecordMetadata>,
    payloads: Vec<u64>,
    keys: Vec<u8>,
    offset: u32,
}

impl EntryWriter {
    fn new(alloc_size: u32, slots: usize) -> Self {
        Self {
            metadata: Vec::with_capacity(slots),
            payloads: Vec::with_capacity(slots),
            keys: vec![0; alloc_size as usize],
            offset: alloc_size,
        }
    }

    fn push(&mut self, key: &[u8], key_length: u32, total_length: u32, payload: u64) {
        debug_assert!(self.offset >= total_length);
        self.offset -= total_length;

        let offset: usize = self.offset as usize;
        self.keys[offset..offset + key.len()].copy_from_slice(key);

        self.metadata.push(RecordMetadata::finalize_for_insert(
            self.offset,
            key_length,
            total_length,
        ));
        self.payloads.push(payload);
    }

    /// Repoint the most recently pushed entry.
    fn replace_last_payload(&mut self, payload: u64) {
        let last: usize = self.payloads.len() - 1;
        self.payloads[last] = payload;
    }

    /// Repoint the entry pushed before the most recent one.
    fn replace_payload_before_last(&mut self, payload: u64) {
        let index: usize = self.payloads.len() - 2;
        self.payloads[index] = payload;
    }

    fn finish(self, alloc_size: u32) -> InternalNode {
        InternalNode {
            status: U64Pointer::new(StatusWord::new().word()),
            sorted_count: self.metadata.len() as u32,
            node_size: alloc_size,
            metadata: self.metadata.into_boxed_slice(),
            payloads: self
                .payloads
                .into_iter()
                .map(U64Pointer::new)
                .collect(),
            keys: self.keys.into_boxed_slice(),
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
