//! Filepath: src/node.rs
//!
//! Node sum type and 64-bit node addressing.
//!
//! The tree has exactly two node kinds, dispatched by matching on [`Node`]
//! rather than through any vtable - the variant set is closed and every hot
//! path branches on leaf/internal anyway.
//!
//! A node is reachable only through a 64-bit address word: a child-pointer
//! word of an internal node or the tree's root cell, both of which are
//! multi-word-CAS targets. [`NodePtr`] is that address. Nodes are allocated
//! fully formed, published by installing their address with a CAS, and
//! reclaimed through the epoch manager once unlinked so that no thread still
//! inside an earlier epoch can observe freed memory.

use crossbeam_epoch::Guard;

use crate::internal::InternalNode;
use crate::leaf::LeafNode;

/// Byte size charged for a node header in the space accounting
/// (status word + sorted count + node size).
pub(crate) const NODE_HEADER_SIZE: u32 = 16;

// ============================================================================
//  Node
// ============================================================================

/// A tree node: either a leaf holding records or an internal routing node.
pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    #[inline]
    #[must_use]
    pub(crate) const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Leaf reference; panics on an internal node.
    ///
    /// Callers use this where the traversal contract guarantees the kind;
    /// a mismatch is an invariant violation.
    #[inline]
    #[must_use]
    pub(crate) fn expect_leaf(&self) -> &LeafNode {
        match self {
            Self::Leaf(leaf) => leaf,

            Self::Internal(_) => panic!("expected a leaf node"),
        }
    }

    /// Internal reference; panics on a leaf.
    #[inline]
    #[must_use]
    pub(crate) fn expect_internal(&self) -> &InternalNode {
        match self {
            Self::Leaf(_) => panic!("expected an internal node"),

            Self::Internal(internal) => internal,
        }
    }
}

// ============================================================================
//  NodePtr
// ============================================================================

/// A node address as stored in child-pointer words and the root cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodePtr(u64);

impl NodePtr {
    #[inline]
    #[must_use]
    pub(crate) const fn null() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub(crate) const fn from_addr(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn addr(self) -> u64 {
        self.0
    }

    /// Allocate a node on the heap and return its address.
    ///
    /// The node is unreachable until the address is installed somewhere via
    /// CAS; until then the caller owns it.
    #[must_use]
    pub(crate) fn alloc(node: Node) -> Self {
        Self(Box::into_raw(Box::new(node)) as u64)
    }

    /// Dereference the address for the duration of the epoch guard.
    ///
    /// # Safety
    ///
    /// The address must have been read from a live CAS target (root cell or
    /// child word) while `guard`'s epoch was pinned, or the caller must own
    /// the node. Retired nodes stay valid until every guard pinned before
    /// the retirement is dropped.
    #[inline]
    #[must_use]
    pub(crate) unsafe fn deref<'g>(self, _guard: &'g Guard) -> &'g Node {
        debug_assert!(!self.is_null());

        unsafe { &*(self.0 as *const Node) }
    }

    /// Schedule the node for reclamation once all current epochs drain.
    ///
    /// # Safety
    ///
    /// The node must be unlinked: no CAS target may still hold (or be able
    /// to re-install) this address.
    pub(crate) unsafe fn retire(self, guard: &Guard) {
        let addr: u64 = self.0;

        unsafe {
            guard.defer_unchecked(move || {
                drop(Box::from_raw(addr as *mut Node));
            });
        }
    }

    /// Free this node and every node reachable through it, immediately.
    ///
    /// Dropping a [`Node`] never follows child addresses, so teardown walks
    /// the subtree explicitly.
    ///
    /// # Safety
    ///
    /// Exclusive access: no concurrent reader or writer may reach any node
    /// of the subtree (tree drop, or a never-published subtree).
    pub(crate) unsafe fn drop_subtree(self) {
        if self.is_null() {
            return;
        }

        // SAFETY: exclusive access per the caller's contract.
        let guard: &Guard = unsafe { crossbeam_epoch::unprotected() };
        let node: Box<Node> = unsafe { Box::from_raw(self.0 as *mut Node) };

        if let Node::Internal(internal) = node.as_ref() {
            for slot in 0..internal.sorted_count() {
                let child: NodePtr = internal.child_at(slot, guard);

                unsafe { child.drop_subtree() };
            }
        }

        drop(node);
    }
}
