//! Filepath: src/metadata.rs
//!
//! Per-slot record metadata.
//!
//! [`RecordMetadata`] is the 8-byte descriptor that governs a record's
//! visibility. Like the status word it is packed into one 64-bit word so a
//! state transition is a single multi-word CAS entry; the live word sits in
//! an [`mwcas::U64Pointer`] in the node's metadata array.
//!
//! # Layout
//!
//! | Bits  | Field          |
//! |-------|----------------|
//! | 0-2   | control (reserved for the CAS engine) |
//! | 3     | visible        |
//! | 4-31  | `offset` (byte offset of the key within the node) |
//! | 32-47 | `key_length`   |
//! | 48-63 | `total_length` (padded key + payload) |
//!
//! # Lifecycle
//!
//! ```text
//! Vacant (all zero)
//!   -> Inserting(epoch)   reservation; epoch stamped into the offset field
//!                         with the field's top bit set as the marker
//!   -> Visible            committed, offset/lengths final
//!   -> Deleted            visible = 0, offset = 0, lengths kept for
//!                         delete_size accounting
//! ```
//!
//! An insert abandoned by the phase-2 duplicate recheck finalizes straight to
//! the Deleted encoding (never observable as Visible).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::key::PAYLOAD_SIZE;

// ============================================================================
//  Bit Constants
// ============================================================================

const VISIBLE_BIT: u64 = 1 << 3;

const OFFSET_SHIFT: u32 = 4;
const OFFSET_BITS: u32 = 28;
const OFFSET_MASK: u64 = ((1 << OFFSET_BITS) - 1) << OFFSET_SHIFT;

/// Top bit of the offset field: while set (and not visible), the offset field
/// holds the reserving epoch rather than a real offset.
const EPOCH_FLAG: u32 = 1 << (OFFSET_BITS - 1);

const KEY_LENGTH_SHIFT: u32 = 32;
const KEY_LENGTH_MASK: u64 = 0xFFFF << KEY_LENGTH_SHIFT;

const TOTAL_LENGTH_SHIFT: u32 = 48;

/// Size of one metadata word in the node's space accounting.
pub(crate) const META_SIZE: u32 = 8;

// ============================================================================
//  Global Epoch
// ============================================================================

/// Epoch stamped into in-progress insert reservations.
///
/// Recovery uses the stamp to tell abandoned reservations from committed
/// records; a transient build never advances it.
static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(0);

#[inline]
#[must_use]
pub(crate) fn global_epoch() -> u32 {
    (GLOBAL_EPOCH.load(Ordering::Relaxed) as u32) & (EPOCH_FLAG - 1)
}

// ============================================================================
//  RecordMetadata
// ============================================================================

/// A detached copy of a slot's packed metadata word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct RecordMetadata {
    word: u64,
}

impl RecordMetadata {
    /// The all-zero Vacant state.
    #[inline]
    #[must_use]
    pub(crate) const fn vacant() -> Self {
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
    //  State Predicates
    // ========================================================================

    #[inline]
    #[must_use]
    pub(crate) const fn is_vacant(self) -> bool {
        self.word == 0
    }

    #[inline]
    #[must_use]
    pub(crate) const fn is_visible(self) -> bool {
        self.word & VISIBLE_BIT != 0
    }

    /// Reserved but not yet finalized: not visible, offset field carries the
    /// epoch marker.
    #[inline]
    #[must_use]
    pub(crate) const fn is_inserting(self) -> bool {
        !self.is_visible() && (self.offset() & EPOCH_FLAG) != 0
    }

    // ========================================================================
    //  Field Accessors
    // ========================================================================

    /// Byte offset of the record's key within the node arena.
    ///
    /// Only meaningful once Visible; while Inserting the field holds the
    /// reserving epoch, and after deletion it is zero.
    #[inline]
    #[must_use]
    pub(crate) const fn offset(self) -> u32 {
        ((self.word & OFFSET_MASK) >> OFFSET_SHIFT) as u32
    }

    #[inline]
    #[must_use]
    pub(crate) const fn key_length(self) -> u32 {
        ((self.word & KEY_LENGTH_MASK) >> KEY_LENGTH_SHIFT) as u32
    }

    /// Padded key length plus payload size.
    #[inline]
    #[must_use]
    pub(crate) const fn total_length(self) -> u32 {
        (self.word >> TOTAL_LENGTH_SHIFT) as u32
    }

    #[inline]
    #[must_use]
    pub(crate) const fn padded_key_length(self) -> u32 {
        self.total_length() - PAYLOAD_SIZE
    }

    // ========================================================================
    //  Transitions
    // ========================================================================

    /// Vacant -> Inserting: reserve the slot, stamping the current global
    /// epoch into the offset field under the epoch marker.
    #[inline]
    #[must_use]
    pub(crate) const fn inserting(epoch: u32) -> Self {
        Self {
            word: (((EPOCH_FLAG | epoch) as u64) << OFFSET_SHIFT),
        }
    }

    /// Inserting -> Visible: commit the record with its final geometry.
    #[inline]
    #[must_use]
    pub(crate) const fn finalize_for_insert(offset: u32, key_length: u32, total_length: u32) -> Self {
        Self {
            word: VISIBLE_BIT
                | ((offset as u64) << OFFSET_SHIFT)
                | ((key_length as u64) << KEY_LENGTH_SHIFT)
                | ((total_length as u64) << TOTAL_LENGTH_SHIFT),
        }
    }

    /// Inserting -> Deleted: abandon a reservation that lost a duplicate
    /// recheck. Lengths are kept so the slot's consumed bytes stay accounted.
    #[inline]
    #[must_use]
    pub(crate) const fn abandon(key_length: u32, total_length: u32) -> Self {
        Self {
            word: ((key_length as u64) << KEY_LENGTH_SHIFT)
                | ((total_length as u64) << TOTAL_LENGTH_SHIFT),
        }
    }

    /// Visible -> Deleted: clear visibility and the offset, keep lengths for
    /// `delete_size` accounting.
    #[inline]
    #[must_use]
    pub(crate) const fn delete(self) -> Self {
        Self {
            word: self.word & !(VISIBLE_BIT | OFFSET_MASK),
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
