//! Filepath: src/scanner.rs
//!
//! Ordered range scans.
//!
//! [`RangeScanner`] materializes a scan one leaf at a time: it re-traverses
//! to the leaf covering the current cursor, pulls that leaf's visible
//! records at-or-after the cursor (already key-sorted), and advances the
//! cursor just past the leaf's key coverage, which lands the next traversal
//! in the following leaf.
//!
//! Scans are snapshot-free: a record committed before the scan's epoch is
//! always seen; records committed during the scan may or may not be. Output
//! order is strictly ascending regardless.

use crate::key::{key_compare, successor};
use crate::stack::Stack;
use crate::tree::BzTree;

// ============================================================================
//  Record
// ============================================================================

/// An owned key/payload pair emitted by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    key: Box<[u8]>,
    payload: u64,
}

impl Record {
    #[inline]
    #[must_use]
    pub(crate) fn new(key: &[u8], payload: u64) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[inline]
    #[must_use]
    pub const fn payload(&self) -> u64 {
        self.payload
    }
}

// ============================================================================
//  RangeScanner
// ============================================================================

/// A cursor over `[begin, end]`, both bounds inclusive.
///
/// Created by [`BzTree::range_scan`]. Each exhausted batch triggers a fresh
/// traversal, so the scanner follows splits and consolidations that happen
/// mid-scan.
pub struct RangeScanner<'t> {
    tree: &'t BzTree,

    /// Inclusive lower bound of the next batch.
    cursor: Vec<u8>,

    /// Inclusive upper bound of the scan.
    end: Vec<u8>,

    batch: std::vec::IntoIter<Record>,
    exhausted: bool,
}

impl<'t> RangeScanner<'t> {
    #[must_use]
    pub(crate) fn new(tree: &'t BzTree, begin: &[u8], end: &[u8]) -> Self {
        Self {
            tree,
            cursor: begin.to_vec(),
            end: end.to_vec(),
            batch: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    /// Pull the next leaf's records at-or-after the cursor.
    ///
    /// The per-leaf pull is unbounded above; the emission filter applies
    /// `end`. The cursor then moves past the leaf's whole coverage: the
    /// nearest ancestor separator bounding it from above (a leaf's largest
    /// record may have been deleted, so its own keys cannot tell us where
    /// its range ends). Only the rightmost leaf has no such separator;
    /// coming up empty there is the end of the tree.
    fn pull_batch(&mut self) {
        if key_compare(&self.cursor, &self.end) == std::cmp::Ordering::Greater {
            self.exhausted = true;
            return;
        }

        let guard = crossbeam_epoch::pin();
        let mut stack = Stack::new(self.tree);

        let leaf_ptr = self
            .tree
            .traverse_to_leaf(Some(&mut stack), &self.cursor, true, &guard);
        // SAFETY: just traversed under this guard's epoch.
        let leaf = unsafe { leaf_ptr.deref(&guard) }.expect_leaf();

        let mut records: Vec<Record> = Vec::new();
        leaf.range_scan(&self.cursor, None, &mut records, &guard);

        // Nearest ancestor entry to the right of the followed path.
        let mut upper: Option<Vec<u8>> = None;

        while let Some(frame) = stack.pop() {
            // SAFETY: breadcrumb addresses were read under this guard's epoch.
            let internal = unsafe { frame.node.deref(&guard) }.expect_internal();

            if frame.slot + 1 < internal.sorted_count() {
                upper = Some(internal.separator_at(frame.slot + 1).to_vec());
                break;
            }
        }

        match (upper, records.last()) {
            (Some(upper_key), _) => self.cursor = successor(&upper_key),

            (None, Some(last)) => self.cursor = successor(last.key()),

            (None, None) => self.exhausted = true,
        }

        self.batch = records.into_iter();
    }
}

impl Iterator for RangeScanner<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        loop {
            if self.exhausted {
                return None;
            }

            if let Some(record) = self.batch.next() {
                if key_compare(record.key(), &self.end) == std::cmp::Ordering::Greater {
                    self.exhausted = true;
                    return None;
                }

                return Some(record);
            }

            self.pull_batch();
        }
    }
}

impl std::iter::FusedIterator for RangeScanner<'_> {}
