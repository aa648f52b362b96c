//! Filepath: src/leaf.rs
//!
//! Leaf node: a fixed-size arena of records with latch-free mutation.
//!
//! # Layout
//!
//! Low to high address: header (status word, `sorted_count`), then the
//! metadata array growing forward one slot per reserved record, a free gap,
//! and the key region growing backward from `node_size`. Slot `i`'s 64-bit
//! payload word lives in a parallel array so it can be a multi-word-CAS
//! target; its bytes are charged to the record region exactly as if it sat
//! behind the padded key (`total_length` = padded key + payload).
//!
//! Slots `[0, sorted_count)` are fully key-sorted; slots
//! `[sorted_count, record_count)` are in insertion order. `record_count` and
//! `block_size` never shrink while the node is live; deletes only grow
//! `delete_size`, and consolidation rebuilds a fully sorted node to reclaim
//! the space.
//!
//! # Two-phase insert
//!
//! Phase 1 reserves: one CAS advances the status word (count + block) and
//! flips the target metadata slot Vacant -> Inserting(epoch). The key bytes
//! are then written into the reserved byte range, which no other thread can
//! address. Phase 2 publishes: one CAS finalizes the metadata to Visible,
//! installs the payload word, and compare-and-sets the status word to itself
//! to catch a concurrent freeze. Readers that do not observe Inserting see
//! either the pre-state or the committed record; the phase-2 CAS is the
//! linearization point.

use std::cell::{RefCell, UnsafeCell};
use std::cmp::Ordering as CmpOrdering;
use std::fmt::Write as _;

use crossbeam_epoch::Guard;
use mwcas::{MwCas, U64Pointer};

use crate::error::{OpError, OpResult};
use crate::internal::InternalNode;
use crate::key::{key_compare, key_in_range, pad_key_length, RangePosition, PAYLOAD_SIZE};
use crate::metadata::{global_epoch, RecordMetadata, META_SIZE};
use crate::node::{Node, NodePtr, NODE_HEADER_SIZE};
use crate::scanner::Record;
use crate::stack::Stack;
use crate::status::{try_freeze, StatusWord};
use crate::tracing_helpers::{debug_log, trace_log};
use crate::tree::{SplitReplacement, MAX_FREEZE_RETRY};

thread_local! {
    /// Scratch for consolidation/split metadata sorting; reused across calls
    /// to keep the SMO path allocation-free.
    static META_BUF: RefCell<Vec<(RecordMetadata, u32)>> = const { RefCell::new(Vec::new()) };
}

// ============================================================================
//  Uniqueness
// ============================================================================

/// Outcome of the pre-reservation duplicate probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Uniqueness {
    /// No record with this key, and no reservation that could become one.
    IsUnique,

    /// A visible record with this key exists.
    Duplicate,

    /// An in-progress reservation was seen; it may or may not collide, so
    /// phase 2 must re-probe the unsorted suffix before publishing.
    ReCheck,

    /// The node froze while probing (recheck only).
    NodeFrozen,
}

// ============================================================================
//  LeafNode
// ============================================================================

/// A leaf node. See the module docs for layout and protocol.
pub(crate) struct LeafNode {
    /// Packed [`StatusWord`]; multi-word-CAS target.
    status: U64Pointer,

    /// Length of the sorted prefix. Written only during construction.
    sorted_count: u32,

    /// Arena capacity in bytes; offsets are relative to this.
    node_size: u32,

    /// One packed [`RecordMetadata`] word per slot; CAS targets.
    metadata: Box<[U64Pointer]>,

    /// One payload word per slot; CAS targets (update swaps in place).
    payloads: Box<[U64Pointer]>,

    /// Key byte region. Each reserved record's byte range is written by
    /// exactly one thread before its metadata becomes visible, and is
    /// immutable afterwards.
    keys: Box<[UnsafeCell<u8>]>,
}

// SAFETY: all shared mutation goes through the CAS words; the raw key region
// is only written inside a reservation that no other thread can address, and
// only read once published (see key_slice/write_key_bytes contracts).
unsafe impl Send for LeafNode {}
unsafe impl Sync for LeafNode {}

impl LeafNode {
    /// Create an empty leaf with a `node_size`-byte arena.
    #[must_use]
    pub(crate) fn new(node_size: u32) -> Self {
        // Slot count is capped by the status word's 16-bit record count.
        let slots: usize = (node_size / (META_SIZE + PAYLOAD_SIZE)).min(0xFFFF) as usize;

        Self {
            status: U64Pointer::new(0),
            sorted_count: 0,
            node_size,
            metadata: (0..slots).map(|_| U64Pointer::new(0)).collect(),
            payloads: (0..slots).map(|_| U64Pointer::new(0)).collect(),
            keys: (0..node_size).map(|_| UnsafeCell::new(0)).collect(),
        }
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
    fn metadata_at(&self, slot: u32, guard: &Guard) -> RecordMetadata {
        RecordMetadata::from_word(self.metadata[slot as usize].read(guard))
    }

    #[inline]
    #[must_use]
    fn payload_at(&self, slot: u32, guard: &Guard) -> u64 {
        self.payloads[slot as usize].read(guard)
    }

    /// Header + metadata array + record region bytes currently accounted.
    #[inline]
    #[must_use]
    fn used_space(status: StatusWord) -> u32 {
        NODE_HEADER_SIZE + status.block_size() + status.record_count() * META_SIZE
    }

    /// Key bytes of a published record.
    #[inline]
    #[must_use]
    fn key_at(&self, meta: RecordMetadata) -> &[u8] {
        debug_assert!(!meta.is_inserting() && meta.offset() != 0);

        // SAFETY: a visible record's bytes were fully written before its
        // metadata was published and are never rewritten afterwards.
        unsafe { self.key_slice(meta.offset(), meta.key_length()) }
    }

    /// # Safety
    ///
    /// The range must belong to a record whose writer has published it (or
    /// the caller must be that writer).
    #[inline]
    unsafe fn key_slice(&self, offset: u32, len: u32) -> &[u8] {
        debug_assert!((offset + len) as usize <= self.keys.len());

        unsafe {
            std::slice::from_raw_parts(self.keys[offset as usize].get().cast_const(), len as usize)
        }
    }

    /// # Safety
    ///
    /// The caller must hold the reservation covering `[offset, offset+len)`;
    /// no other thread can address these bytes yet.
    unsafe fn write_key_bytes(&self, offset: u32, key: &[u8]) {
        debug_assert!(offset as usize + key.len() <= self.keys.len());

        unsafe {
            std::ptr::copy_nonoverlapping(
                key.as_ptr(),
                self.keys[offset as usize].get(),
                key.len(),
            );
        }
    }

    /// # Safety
    ///
    /// Same contract as [`Self::write_key_bytes`].
    unsafe fn zero_key_bytes(&self, offset: u32, len: u32) {
        debug_assert!((offset + len) as usize <= self.keys.len());

        unsafe {
            std::ptr::write_bytes(self.keys[offset as usize].get(), 0, len as usize);
        }
    }

    // ========================================================================
    //  Search
    // ========================================================================

    /// Unified record lookup: binary search over the sorted prefix
    /// `[start, min(end, sorted_count))` tolerating deleted middles, then a
    /// linear pass over the unsorted suffix `[sorted_count, min(end,
    /// record_count))`.
    ///
    /// With `check_concurrency` set, an in-progress insert in the suffix is
    /// returned as a hit (for uniqueness probing); otherwise it is skipped
    /// (reads are unordered with concurrent inserts).
    fn search_record_meta(
        &self,
        key: &[u8],
        start: u32,
        end: u32,
        check_concurrency: bool,
        guard: &Guard,
    ) -> Option<u32> {
        let sorted_count: u32 = self.sorted_count;

        if start < sorted_count {
            let mut first: i64 = i64::from(start);
            let mut last: i64 = i64::from(end.min(sorted_count - 1));

            while first <= last {
                let probe: i64 = (first + last) / 2;
                let mut middle: i64 = probe;

                // Deleted middle: scan left, then right, for a visible
                // neighbor; if the whole window is deleted, fall through to
                // the unsorted suffix.
                while !self.metadata_at(middle as u32, guard).is_visible() && first < middle {
                    middle -= 1;
                }

                if !self.metadata_at(middle as u32, guard).is_visible() {
                    middle = probe;

                    while !self.metadata_at(middle as u32, guard).is_visible() && middle < last {
                        middle += 1;
                    }
                }

                let current: RecordMetadata = self.metadata_at(middle as u32, guard);
                if !current.is_visible() {
                    break;
                }

                match key_compare(key, self.key_at(current)) {
                    CmpOrdering::Less => last = middle - 1,

                    CmpOrdering::Equal => return Some(middle as u32),

                    CmpOrdering::Greater => first = middle + 1,
                }
            }
        }

        if end > sorted_count {
            let linear_end: u32 = self.status_word(guard).record_count().min(end);

            for slot in sorted_count..linear_end {
                let current: RecordMetadata = self.metadata_at(slot, guard);

                if current.is_inserting() {
                    if check_concurrency {
                        return Some(slot);
                    }
                    continue;
                }

                if current.is_visible() && key_compare(key, self.key_at(current)) == CmpOrdering::Equal
                {
                    return Some(slot);
                }
            }
        }

        None
    }

    /// Pre-reservation duplicate probe over the whole node.
    fn check_unique(&self, key: &[u8], guard: &Guard) -> Uniqueness {
        let Some(slot) = self.search_record_meta(key, 0, u32::MAX, true, guard) else {
            return Uniqueness::IsUnique;
        };

        // The slot may have finished (or abandoned) its insert between the
        // search and this read; re-read and re-compare before deciding.
        let meta: RecordMetadata = self.metadata_at(slot, guard);

        if meta.is_inserting() {
            return Uniqueness::ReCheck;
        }

        if meta.is_visible() && key_compare(key, self.key_at(meta)) == CmpOrdering::Equal {
            return Uniqueness::Duplicate;
        }

        Uniqueness::ReCheck
    }

    /// Phase-2 duplicate probe, restricted to suffix slots reserved before
    /// ours (`[sorted_count, reserved_slot)`). Spins while an earlier
    /// reservation is still undecided.
    fn recheck_unique(&self, key: &[u8], reserved_slot: u32, guard: &Guard) -> Uniqueness {
        loop {
            if self.status_word(guard).is_frozen() {
                return Uniqueness::NodeFrozen;
            }

            let Some(slot) =
                self.search_record_meta(key, self.sorted_count, reserved_slot, true, guard)
            else {
                return Uniqueness::IsUnique;
            };

            let meta: RecordMetadata = self.metadata_at(slot, guard);

            if meta.is_inserting() {
                // An earlier reservation is still in flight; it may be this
                // key. Wait for it to commit or abandon.
                continue;
            }

            if !meta.is_visible() {
                return Uniqueness::IsUnique;
            }

            if key_compare(key, self.key_at(meta)) == CmpOrdering::Equal {
                return Uniqueness::Duplicate;
            }

            return Uniqueness::IsUnique;
        }
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Two-phase reserve-then-publish insert.
    pub(crate) fn insert(
        &self,
        key: &[u8],
        payload: u64,
        split_threshold: u32,
        guard: &Guard,
    ) -> OpResult<()> {
        let key_length: u32 = key.len() as u32;
        let padded_key_size: u32 = pad_key_length(key_length);
        let total_size: u32 = padded_key_size + PAYLOAD_SIZE;

        loop {
            let expected_status: StatusWord = self.status_word(guard);

            if expected_status.is_frozen() {
                return Err(OpError::NodeFrozen);
            }

            let uniqueness: Uniqueness = self.check_unique(key, guard);
            if uniqueness == Uniqueness::Duplicate {
                return Err(OpError::KeyExists);
            }

            let new_size: u32 = Self::used_space(expected_status) + META_SIZE + total_size;
            if new_size >= split_threshold {
                return Err(OpError::NotEnoughSpace);
            }

            let slot: u32 = expected_status.record_count();
            if slot as usize >= self.metadata.len() {
                return Err(OpError::NotEnoughSpace);
            }

            let expected_meta: RecordMetadata = self.metadata_at(slot, guard);
            if !expected_meta.is_vacant() {
                // Raced with another reservation; re-read the status word.
                continue;
            }

            let desired_status: StatusWord = expected_status.prepare_for_insert(total_size);
            let desired_meta: RecordMetadata = RecordMetadata::inserting(global_epoch());

            // Phase 1: reserve the slot and its byte range atomically.
            let mut mwcas = MwCas::new();
            mwcas.compare_exchange_u64(&self.status, expected_status.word(), desired_status.word());
            mwcas.compare_exchange_u64(
                &self.metadata[slot as usize],
                expected_meta.word(),
                desired_meta.word(),
            );

            if !mwcas.exec(guard) {
                continue;
            }

            // The byte range [offset, offset + total) is ours alone now.
            let offset: u32 = self.node_size - desired_status.block_size();
            unsafe { self.write_key_bytes(offset, key) };

            return self.insert_phase_two(
                key,
                payload,
                slot,
                offset,
                total_size,
                uniqueness,
                desired_meta,
                guard,
            );
        }
    }

    /// Phase 2: optional duplicate recheck, then the publishing CAS.
    #[allow(clippy::too_many_arguments)]
    fn insert_phase_two(
        &self,
        key: &[u8],
        payload: u64,
        slot: u32,
        offset: u32,
        total_size: u32,
        uniqueness: Uniqueness,
        reserved_meta: RecordMetadata,
        guard: &Guard,
    ) -> OpResult<()> {
        let key_length: u32 = key.len() as u32;
        let mut abandoned: bool = false;

        if uniqueness == Uniqueness::ReCheck {
            match self.recheck_unique(key, slot, guard) {
                Uniqueness::Duplicate => {
                    debug_log!("concurrent duplicate insert, abandoning reservation");
                    unsafe { self.zero_key_bytes(offset, key_length) };
                    abandoned = true;
                }

                Uniqueness::NodeFrozen => return Err(OpError::NodeFrozen),

                _ => {}
            }
        }

        let final_meta: RecordMetadata = if abandoned {
            RecordMetadata::abandon(key_length, total_size)
        } else {
            RecordMetadata::finalize_for_insert(offset, key_length, total_size)
        };

        loop {
            let status: StatusWord = self.status_word(guard);

            if status.is_frozen() {
                return Err(OpError::NodeFrozen);
            }

            // Publish: finalize the metadata, install the payload word, and
            // compare-and-set the status word to itself so any concurrent
            // freeze aborts us instead of losing the record.
            let mut mwcas = MwCas::new();
            mwcas.compare_exchange_u64(&self.status, status.word(), status.word());
            mwcas.compare_exchange_u64(
                &self.metadata[slot as usize],
                reserved_meta.word(),
                final_meta.word(),
            );
            if !abandoned {
                mwcas.compare_exchange_u64(&self.payloads[slot as usize], 0, payload);
            }

            if mwcas.exec(guard) {
                return if abandoned {
                    Err(OpError::KeyExists)
                } else {
                    Ok(())
                };
            }

            trace_log!("insert phase-2 mwcas failure, retrying");
        }
    }

    // ========================================================================
    //  Read / Update / Delete
    // ========================================================================

    /// Point read. A concurrent in-progress insert is treated as absent.
    pub(crate) fn read(&self, key: &[u8], guard: &Guard) -> Option<u64> {
        let slot: u32 = self.search_record_meta(key, 0, u32::MAX, false, guard)?;
        let meta: RecordMetadata = self.metadata_at(slot, guard);

        if !meta.is_visible() {
            return None;
        }

        Some(self.payload_at(slot, guard))
    }

    /// Swap the payload of an existing record in place.
    ///
    /// Three-word CAS: payload old -> new, metadata to itself, status to
    /// itself. The self-entries abort the swap if the record is deleted or
    /// the node freezes concurrently.
    pub(crate) fn update(&self, key: &[u8], payload: u64, guard: &Guard) -> OpResult<()> {
        loop {
            let status: StatusWord = self.status_word(guard);

            if status.is_frozen() {
                return Err(OpError::NodeFrozen);
            }

            let Some(slot) = self.search_record_meta(key, 0, u32::MAX, true, guard) else {
                return Err(OpError::NotFound);
            };

            let meta: RecordMetadata = self.metadata_at(slot, guard);

            if meta.is_inserting() {
                continue;
            }

            if !meta.is_visible() {
                return Err(OpError::NotFound);
            }

            let old_payload: u64 = self.payload_at(slot, guard);
            if old_payload == payload {
                return Ok(());
            }

            let mut mwcas = MwCas::new();
            mwcas.compare_exchange_u64(&self.payloads[slot as usize], old_payload, payload);
            mwcas.compare_exchange_u64(&self.metadata[slot as usize], meta.word(), meta.word());
            mwcas.compare_exchange_u64(&self.status, status.word(), status.word());

            if mwcas.exec(guard) {
                return Ok(());
            }
        }
    }

    /// Logically delete a record: hide the metadata and grow `delete_size`.
    /// The record's bytes stay accounted until consolidation.
    pub(crate) fn delete(&self, key: &[u8], guard: &Guard) -> OpResult<()> {
        loop {
            let status: StatusWord = self.status_word(guard);

            if status.is_frozen() {
                return Err(OpError::NodeFrozen);
            }

            let Some(slot) = self.search_record_meta(key, 0, u32::MAX, true, guard) else {
                return Err(OpError::NotFound);
            };

            let old_meta: RecordMetadata = self.metadata_at(slot, guard);

            if old_meta.is_inserting() {
                continue;
            }

            if !old_meta.is_visible() {
                // Deleted between search and read; the fresh search above
                // will report NotFound.
                continue;
            }

            let new_meta: RecordMetadata = old_meta.delete();
            let new_status: StatusWord =
                status.with_delete_size(status.delete_size() + old_meta.total_length());

            let mut mwcas = MwCas::new();
            mwcas.compare_exchange_u64(&self.status, status.word(), new_status.word());
            mwcas.compare_exchange_u64(
                &self.metadata[slot as usize],
                old_meta.word(),
                new_meta.word(),
            );

            if mwcas.exec(guard) {
                return Ok(());
            }
        }
    }

    // ========================================================================
    //  Range Scan
    // ========================================================================

    /// Collect every visible record with key in `[low, high]` (inclusive;
    /// `high = None` means unbounded above), sorted by key on return.
    ///
    /// Within the sorted prefix, the first key above `high` short-circuits
    /// to the unsorted suffix, which may still hold in-range keys.
    pub(crate) fn range_scan(
        &self,
        low: &[u8],
        high: Option<&[u8]>,
        result: &mut Vec<Record>,
        guard: &Guard,
    ) {
        let record_count: u32 = self.status_word(guard).record_count();
        let mut slot: u32 = 0;

        while slot < record_count {
            let meta: RecordMetadata = self.metadata_at(slot, guard);

            if !meta.is_visible() {
                slot += 1;
                continue;
            }

            let key: &[u8] = self.key_at(meta);

            match key_in_range(key, low, high) {
                RangePosition::InRange => {
                    result.push(Record::new(key, self.payload_at(slot, guard)));
                }

                RangePosition::AboveHigh if slot < self.sorted_count => {
                    slot = self.sorted_count;
                    continue;
                }

                _ => {}
            }

            slot += 1;
        }

        result.sort_by(|a, b| key_compare(a.key(), b.key()));
    }

    // ========================================================================
    //  Freeze / Consolidate
    // ========================================================================

    /// Set the frozen bit. Returns `false` if already frozen or the CAS lost.
    #[inline]
    pub(crate) fn freeze(&self, guard: &Guard) -> bool {
        try_freeze(&self.status, guard)
    }

    /// Number of currently visible records.
    #[must_use]
    pub(crate) fn visible_records(&self, guard: &Guard) -> u32 {
        let record_count: u32 = self.status_word(guard).record_count();

        (0..record_count)
            .filter(|&slot| self.metadata_at(slot, guard).is_visible())
            .count() as u32
    }

    /// Freeze this node and build its compacted replacement: all visible
    /// records in key order, `sorted_count = record_count`, `delete_size` 0.
    ///
    /// Returns `None` if the freeze was lost (another thread is already
    /// superseding this node).
    pub(crate) fn consolidate(&self, guard: &Guard) -> Option<LeafNode> {
        if !self.freeze(guard) {
            return None;
        }

        Some(self.consolidated_copy(guard))
    }

    /// Build the compacted copy of an already-frozen node.
    pub(crate) fn consolidated_copy(&self, guard: &Guard) -> LeafNode {
        debug_assert!(self.status_word(guard).is_frozen());

        META_BUF.with(|buf| {
            let mut meta_vec = buf.borrow_mut();
            meta_vec.clear();
            self.sort_visible_metadata(&mut meta_vec, guard);

            let mut new_leaf = LeafNode::new(self.node_size);
            new_leaf.copy_from(self, &meta_vec, guard);
            new_leaf
        })
    }

    /// Collect `(metadata, slot)` for every visible record, key-sorted.
    /// Returns the total record bytes of the collected set.
    ///
    /// The caller has frozen the node (or exhausted its freeze retries), so
    /// the visible set is stable.
    fn sort_visible_metadata(
        &self,
        meta_vec: &mut Vec<(RecordMetadata, u32)>,
        guard: &Guard,
    ) -> u32 {
        let record_count: u32 = self.status_word(guard).record_count();
        let mut total_size: u32 = 0;

        for slot in 0..record_count {
            let meta: RecordMetadata = self.metadata_at(slot, guard);

            if meta.is_visible() {
                debug_assert!(meta.total_length() >= PAYLOAD_SIZE);
                total_size += meta.total_length();
                meta_vec.push((meta, slot));
            }
        }

        meta_vec.sort_by(|a, b| key_compare(self.key_at(a.0), self.key_at(b.0)));
        total_size
    }

    /// Rebuild this (fresh, unpublished) leaf from `metas`, which must be
    /// key-sorted records of `src`. Records are laid out back-to-front from
    /// the high end of the arena; the metadata array becomes a fully sorted
    /// prefix.
    fn copy_from(&mut self, src: &LeafNode, metas: &[(RecordMetadata, u32)], guard: &Guard) {
        let mut offset: u32 = self.node_size;
        let mut nrecords: u32 = 0;

        for &(meta, src_slot) in metas {
            let total_length: u32 = meta.total_length();
            debug_assert!(offset >= total_length);
            debug_assert_eq!(meta.padded_key_length() + PAYLOAD_SIZE, total_length);
            offset -= total_length;

            unsafe { self.write_key_bytes(offset, src.key_at(meta)) };

            self.payloads[nrecords as usize] = U64Pointer::new(src.payload_at(src_slot, guard));
            self.metadata[nrecords as usize] = U64Pointer::new(
                RecordMetadata::finalize_for_insert(offset, meta.key_length(), total_length)
                    .word(),
            );

            nrecords += 1;
        }

        self.status = U64Pointer::new(
            StatusWord::new()
                .with_record_count(nrecords)
                .with_block_size(self.node_size - offset)
                .word(),
        );
        self.sorted_count = nrecords;
    }

    // ========================================================================
    //  Split
    // ========================================================================

    /// Split this (frozen) leaf into two halves and carry the separator up.
    ///
    /// The split point is the first sorted index whose cumulative record
    /// bytes reach half of the visible total; the separator is the last key
    /// of the left half (traversal goes left on `<=`, right on `>`).
    ///
    /// Returns the node to install in place of the popped ancestor: either
    /// the parent rebuilt with the separator, a higher-level rebuild if the
    /// parent itself split, or a fresh two-entry root when the stack runs
    /// out. Ancestors frozen along the way are appended to `retired`.
    /// Returns `None` when this node vanished from the tree mid-chain (a
    /// competing repair replaced it); the caller must abandon the SMO.
    pub(crate) fn prepare_for_split(
        &self,
        self_ptr: NodePtr,
        stack: &mut Stack<'_>,
        split_threshold: u32,
        retired: &mut Vec<NodePtr>,
        guard: &Guard,
    ) -> Option<SplitReplacement> {
        let record_count: u32 = self.status_word(guard).record_count();
        assert!(record_count > 2, "cannot split a leaf with fewer than three records");

        let mut left = LeafNode::new(self.node_size);
        let mut right = LeafNode::new(self.node_size);

        let separator: Vec<u8> = META_BUF.with(|buf| {
            let mut meta_vec = buf.borrow_mut();
            meta_vec.clear();
            let total_size: u32 = self.sort_visible_metadata(&mut meta_vec, guard);

            let mut remaining: i64 = i64::from(total_size / 2);
            let mut nleft: usize = 0;

            for &(meta, _) in meta_vec.iter() {
                nleft += 1;
                remaining -= i64::from(meta.total_length());

                if remaining <= 0 {
                    break;
                }
            }

            // The right half must get at least one record: the separator has
            // to stay strictly below this leaf's upper bound, or it would
            // collide with the parent separator already covering it.
            if nleft == meta_vec.len() {
                nleft -= 1;
            }

            left.copy_from(self, &meta_vec[..nleft], guard);
            right.copy_from(self, &meta_vec[nleft..], guard);

            self.key_at(meta_vec[nleft - 1].0).to_vec()
        });
        assert!(!separator.is_empty(), "zero-length separator");

        let left_ptr: NodePtr = NodePtr::alloc(Node::Leaf(left));
        let right_ptr: NodePtr = NodePtr::alloc(Node::Leaf(right));

        let Some(parent_frame) = stack.top() else {
            // This leaf was the root: the replacement root carries the
            // separator and the two new leaves.
            return Some(SplitReplacement {
                node: NodePtr::alloc(Node::Internal(InternalNode::new_two_child(
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
                // no longer routes to this leaf, a repair swapped the leaf
                // out before the freeze and these halves are stale.
                if parent.child_at(parent_slot, guard) != self_ptr {
                    debug_log!("leaf split: leaf superseded under its parent, abandoning");
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

            // The freeze CAS lost to a plain status mutation; retraverse
            // down to this leaf and pick up whatever routes to it now.
            debug_log!("leaf split: parent freeze lost, retraversing");
            stack.clear();

            if !stack.tree.traverse_to_node(stack, &separator, self_ptr, guard) {
                // This leaf is gone from the tree; the SMO is stale.
                return None;
            }

            stack.pop();

            let Some(frame) = stack.top() else {
                return Some(SplitReplacement {
                    node: NodePtr::alloc(Node::Internal(InternalNode::new_two_child(
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

    /// Append a human-readable rendition of this node to `out`.
    pub(crate) fn dump_into(&self, out: &mut String, indent: usize, guard: &Guard) {
        let status: StatusWord = self.status_word(guard);
        let pad: String = " ".repeat(indent);

        let _ = writeln!(
            out,
            "{pad}leaf {{ {status}, sorted_count: {}, free: {} }}",
            self.sorted_count,
            self.node_size.saturating_sub(Self::used_space(status)),
        );

        for slot in 0..status.record_count().max(self.sorted_count) {
            let meta: RecordMetadata = self.metadata_at(slot, guard);

            if meta.is_visible() {
                let _ = writeln!(
                    out,
                    "{pad}  [{slot}] {:?} = {}",
                    String::from_utf8_lossy(self.key_at(meta)),
                    self.payload_at(slot, guard),
                );
            } else {
                let _ = writeln!(
                    out,
                    "{pad}  [{slot}] {}",
                    if meta.is_inserting() { "<inserting>" } else { "<deleted>" },
                );
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

    const NODE_SIZE: u32 = 4096;
    const THRESHOLD: u32 = 4096;

    fn leaf_with(entries: &[(&[u8], u64)]) -> LeafNode {
        let leaf = LeafNode::new(NODE_SIZE);
        let guard = crossbeam_epoch::pin();

        for &(key, payload) in entries {
            leaf.insert(key, payload, THRESHOLD, &guard).unwrap();
        }

        leaf
    }

    // ========================================================================
    //  Insert / Read
    // ========================================================================

    #[test]
    fn insert_then_read() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"def", 100), (b"bdef", 100), (b"abc", 100)]);

        assert_eq!(leaf.read(b"abc", &guard), Some(100));
        assert_eq!(leaf.read(b"bdef", &guard), Some(100));
        assert_eq!(leaf.read(b"def", &guard), Some(100));
        assert_eq!(leaf.read(b"missing", &guard), None);

        let status = leaf.status_word(&guard);
        assert_eq!(status.record_count(), 3);
        // "def"/"abc" pad to 8, "bdef" pads to 8; each record adds a payload.
        assert_eq!(status.block_size(), 3 * 16);
        assert_eq!(leaf.sorted_count(), 0);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"abc", 100), (b"bdef", 100)]);

        assert_eq!(
            leaf.insert(b"abc", 200, THRESHOLD, &guard),
            Err(OpError::KeyExists)
        );
        assert_eq!(leaf.read(b"abc", &guard), Some(100));
    }

    #[test]
    fn duplicate_survives_consolidation() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"abc", 100)]);
        let new_leaf = leaf.consolidate(&guard).unwrap();

        assert_eq!(
            new_leaf.insert(b"abc", 200, THRESHOLD, &guard),
            Err(OpError::KeyExists)
        );
    }

    #[test]
    fn insert_reports_full_node() {
        let guard = crossbeam_epoch::pin();
        let leaf = LeafNode::new(NODE_SIZE);

        // Threshold small enough that the second insert cannot fit.
        let threshold: u32 = NODE_HEADER_SIZE + 2 * (META_SIZE + 16);
        leaf.insert(b"a", 1, threshold, &guard).unwrap();

        assert_eq!(
            leaf.insert(b"b", 2, threshold, &guard),
            Err(OpError::NotEnoughSpace)
        );
    }

    // ========================================================================
    //  Update / Delete
    // ========================================================================

    #[test]
    fn update_swaps_payload() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"k", 1)]);

        assert_eq!(leaf.update(b"k", 2, &guard), Ok(()));
        assert_eq!(leaf.read(b"k", &guard), Some(2));

        // Idempotent when equal.
        assert_eq!(leaf.update(b"k", 2, &guard), Ok(()));
        assert_eq!(leaf.update(b"missing", 9, &guard), Err(OpError::NotFound));
    }

    #[test]
    fn delete_hides_record_and_accounts_bytes() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"a", 1), (b"b", 2)]);

        assert_eq!(leaf.delete(b"a", &guard), Ok(()));
        assert_eq!(leaf.read(b"a", &guard), None);
        assert_eq!(leaf.read(b"b", &guard), Some(2));
        assert_eq!(leaf.delete(b"a", &guard), Err(OpError::NotFound));

        let status = leaf.status_word(&guard);
        // record_count and block_size do not shrink; delete_size grows by
        // the record's total length (1-byte key pads to 8, plus payload).
        assert_eq!(status.record_count(), 2);
        assert_eq!(status.block_size(), 2 * 16);
        assert_eq!(status.delete_size(), 16);
    }

    #[test]
    fn delete_then_reinsert() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"k", 1)]);

        leaf.delete(b"k", &guard).unwrap();
        assert_eq!(leaf.insert(b"k", 7, THRESHOLD, &guard), Ok(()));
        assert_eq!(leaf.read(b"k", &guard), Some(7));
    }

    // ========================================================================
    //  Freeze
    // ========================================================================

    #[test]
    fn frozen_node_rejects_mutation() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"k", 1)]);

        assert!(leaf.freeze(&guard));
        assert!(!leaf.freeze(&guard));

        assert_eq!(
            leaf.insert(b"x", 1, THRESHOLD, &guard),
            Err(OpError::NodeFrozen)
        );
        assert_eq!(leaf.update(b"k", 2, &guard), Err(OpError::NodeFrozen));
        assert_eq!(leaf.delete(b"k", &guard), Err(OpError::NodeFrozen));

        // Reads still work on a frozen node.
        assert_eq!(leaf.read(b"k", &guard), Some(1));
    }

    // ========================================================================
    //  Consolidate
    // ========================================================================

    #[test]
    fn consolidate_sorts_and_compacts() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"def", 100), (b"bdef", 100), (b"abc", 100)]);

        let new_leaf = leaf.consolidate(&guard).unwrap();

        let status = new_leaf.status_word(&guard);
        assert_eq!(status.record_count(), 3);
        assert_eq!(new_leaf.sorted_count(), 3);
        assert_eq!(status.delete_size(), 0);

        let mut result = Vec::new();
        new_leaf.range_scan(b"", None, &mut result, &guard);
        let keys: Vec<&[u8]> = result.iter().map(Record::key).collect();
        assert_eq!(keys, vec![&b"abc"[..], b"bdef", b"def"]);

        // Binary search now serves all lookups.
        assert_eq!(new_leaf.read(b"bdef", &guard), Some(100));
    }

    #[test]
    fn consolidate_drops_deleted_records() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"a", 1), (b"b", 2), (b"c", 3)]);
        leaf.delete(b"b", &guard).unwrap();

        let new_leaf = leaf.consolidate(&guard).unwrap();

        let status = new_leaf.status_word(&guard);
        assert_eq!(status.record_count(), 2);
        assert_eq!(status.delete_size(), 0);
        assert_eq!(status.block_size(), 2 * 16);
        assert_eq!(new_leaf.read(b"a", &guard), Some(1));
        assert_eq!(new_leaf.read(b"b", &guard), None);
        assert_eq!(new_leaf.read(b"c", &guard), Some(3));
    }

    #[test]
    fn consolidate_on_frozen_node_fails() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"a", 1)]);

        assert!(leaf.freeze(&guard));
        assert!(leaf.consolidate(&guard).is_none());
    }

    // ========================================================================
    //  Search over deleted middles
    // ========================================================================

    #[test]
    fn sorted_search_tolerates_deleted_middles() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"a", 1), (b"b", 2), (b"c", 3), (b"d", 4), (b"e", 5)]);
        let sorted = leaf.consolidate(&guard).unwrap();

        sorted.delete(b"c", &guard).unwrap();
        assert_eq!(sorted.read(b"a", &guard), Some(1));
        assert_eq!(sorted.read(b"b", &guard), Some(2));
        assert_eq!(sorted.read(b"c", &guard), None);
        assert_eq!(sorted.read(b"d", &guard), Some(4));
        assert_eq!(sorted.read(b"e", &guard), Some(5));

        sorted.delete(b"a", &guard).unwrap();
        sorted.delete(b"e", &guard).unwrap();
        assert_eq!(sorted.read(b"b", &guard), Some(2));
        assert_eq!(sorted.read(b"d", &guard), Some(4));
        assert_eq!(sorted.read(b"a", &guard), None);
        assert_eq!(sorted.read(b"e", &guard), None);
    }

    // ========================================================================
    //  Range Scan
    // ========================================================================

    #[test]
    fn range_scan_mixes_prefix_and_suffix() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"b", 2), (b"d", 4), (b"f", 6)]);
        let sorted = leaf.consolidate(&guard).unwrap();

        // Unsorted suffix entries interleaved with the sorted prefix.
        sorted.insert(b"a", 1, THRESHOLD, &guard).unwrap();
        sorted.insert(b"e", 5, THRESHOLD, &guard).unwrap();

        let mut result = Vec::new();
        sorted.range_scan(b"a", Some(b"e"), &mut result, &guard);

        let got: Vec<(&[u8], u64)> = result.iter().map(|r| (r.key(), r.payload())).collect();
        assert_eq!(
            got,
            vec![
                (&b"a"[..], 1),
                (&b"b"[..], 2),
                (&b"d"[..], 4),
                (&b"e"[..], 5),
            ]
        );
    }

    #[test]
    fn range_scan_skips_deleted() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"a", 1), (b"b", 2), (b"c", 3)]);
        leaf.delete(b"b", &guard).unwrap();

        let mut result = Vec::new();
        leaf.range_scan(b"a", Some(b"c"), &mut result, &guard);

        let keys: Vec<&[u8]> = result.iter().map(Record::key).collect();
        assert_eq!(keys, vec![&b"a"[..], b"c"]);
    }

    // ========================================================================
    //  Dump
    // ========================================================================

    #[test]
    fn dump_shows_records() {
        let guard = crossbeam_epoch::pin();
        let leaf = leaf_with(&[(b"abc", 7)]);

        let mut out = String::new();
        leaf.dump_into(&mut out, 0, &guard);

        assert!(out.contains("record_count: 1"));
        assert!(out.contains("abc"));
        assert!(out.contains("= 7"));
    }
}
