//! Filepath: src/status.rs
//!
//! Per-node status word.
//!
//! [`StatusWord`] packs a node's concurrency-relevant state into a single
//! 64-bit word so that every contended mutation is exactly one multi-word
//! CAS entry. The live word is held in an [`mwcas::U64Pointer`]; code works
//! on detached [`StatusWord`] copies and installs them via [`MwCas`].
//!
//! # Layout
//!
//! | Bits  | Field          |
//! |-------|----------------|
//! | 0-2   | control (reserved for the CAS engine) |
//! | 3     | frozen         |
//! | 4-19  | `record_count` |
//! | 20-41 | `block_size`   |
//! | 42-63 | `delete_size`  |
//!
//! `record_count` and `block_size` are monotone non-decreasing until the
//! frozen bit is set; deletes only grow `delete_size`. Space is reclaimed by
//! consolidation, never in place.

use std::fmt as StdFmt;

use crossbeam_epoch::Guard;
use mwcas::{MwCas, U64Pointer};

// ============================================================================
//  Bit Constants
// ============================================================================

/// Low bits reserved for the CAS engine's tagging.
const CONTROL_MASK: u64 = 0x7;

/// Frozen bit: the node is being superseded, no further mutation commits.
const FROZEN_BIT: u64 = 1 << 3;

const RECORD_COUNT_SHIFT: u32 = 4;
const RECORD_COUNT_BITS: u32 = 16;
const RECORD_COUNT_MASK: u64 = ((1 << RECORD_COUNT_BITS) - 1) << RECORD_COUNT_SHIFT;

const BLOCK_SIZE_SHIFT: u32 = 20;
const BLOCK_SIZE_BITS: u32 = 22;
const BLOCK_SIZE_MASK: u64 = ((1 << BLOCK_SIZE_BITS) - 1) << BLOCK_SIZE_SHIFT;

const DELETE_SIZE_SHIFT: u32 = 42;
const DELETE_SIZE_BITS: u32 = 22;
const DELETE_SIZE_MASK: u64 = ((1 << DELETE_SIZE_BITS) - 1) << DELETE_SIZE_SHIFT;

/// Largest node size expressible in the `block_size`/`delete_size` fields.
pub(crate) const MAX_NODE_SIZE: u32 = (1 << BLOCK_SIZE_BITS) - 1;

// ============================================================================
//  StatusWord
// ============================================================================

/// A detached copy of a node's packed status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct StatusWord {
    word: u64,
}

impl StatusWord {
    /// An empty status word: not frozen, nothing reserved.
    #[inline]
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self { word: 0 }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn from_word(word: u64) -> Self {
        Self { word }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn word(self) -> u64 {
        self.word
    }

    // ========================================================================
    //  Field Accessors
    // ========================================================================

    #[inline]
    #[must_use]
    pub(crate) const fn is_frozen(self) -> bool {
        self.word & FROZEN_BIT != 0
    }

    /// Number of metadata slots ever reserved. Does not shrink on delete.
    #[inline]
    #[must_use]
    pub(crate) const fn record_count(self) -> u32 {
        ((self.word & RECORD_COUNT_MASK) >> RECORD_COUNT_SHIFT) as u32
    }

    /// Bytes consumed in the record region. Does not shrink on delete.
    #[inline]
    #[must_use]
    pub(crate) const fn block_size(self) -> u32 {
        ((self.word & BLOCK_SIZE_MASK) >> BLOCK_SIZE_SHIFT) as u32
    }

    /// Bytes logically freed by deletions; reset to zero by consolidation.
    #[inline]
    #[must_use]
    pub(crate) const fn delete_size(self) -> u32 {
        ((self.word & DELETE_SIZE_MASK) >> DELETE_SIZE_SHIFT) as u32
    }

    // ========================================================================
    //  Transitions
    // ========================================================================

    /// Copy with the frozen bit set.
    #[inline]
    #[must_use]
    pub(crate) const fn freeze(self) -> Self {
        Self {
            word: self.word | FROZEN_BIT,
        }
    }

    /// Copy with one more slot reserved and `total_size` more record bytes
    /// consumed. Phase 1 of a leaf insert.
    #[inline]
    #[must_use]
    pub(crate) fn prepare_for_insert(self, total_size: u32) -> Self {
        debug_assert!(!self.is_frozen());

        self.with_record_count(self.record_count() + 1)
            .with_block_size(self.block_size() + total_size)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn with_record_count(self, record_count: u32) -> Self {
        Self {
            word: (self.word & !RECORD_COUNT_MASK)
                | ((record_count as u64) << RECORD_COUNT_SHIFT),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn with_block_size(self, block_size: u32) -> Self {
        Self {
            word: (self.word & !BLOCK_SIZE_MASK) | ((block_size as u64) << BLOCK_SIZE_SHIFT),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn with_delete_size(self, delete_size: u32) -> Self {
        Self {
            word: (self.word & !DELETE_SIZE_MASK) | ((delete_size as u64) << DELETE_SIZE_SHIFT),
        }
    }
}

impl StdFmt::Display for StatusWord {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(
            f,
            "status {{ control: {:#x}, frozen: {}, record_count: {}, block_size: {}, delete_size: {} }}",
            self.word & CONTROL_MASK,
            self.is_frozen(),
            self.record_count(),
            self.block_size(),
            self.delete_size(),
        )
    }
}

// ============================================================================
//  Freeze Helper
// ============================================================================

/// Set the frozen bit with a single-entry multi-word CAS.
///
/// Returns `false` if the node was already frozen or the CAS lost to a
/// concurrent status mutation. Freezing is sticky: once set, no later CAS
/// that expects an unfrozen status can commit.
pub(crate) fn try_freeze(status: &U64Pointer, guard: &Guard) -> bool {
    let expected = StatusWord::from_word(status.read(guard));

    if expected.is_frozen() {
        return false;
    }

    let desired: StatusWord = expected.freeze();

    let mut mwcas = MwCas::new();
    mwcas.compare_exchange_u64(status, expected.word(), desired.word());
    mwcas.exec(guard)
}

// ============================================================================
//  Tests
// ============================================================================
