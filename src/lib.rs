//! # BzTree
//!
//! A latch-free, concurrent, ordered key-value index: a B+tree whose entire
//! concurrency discipline is expressed through a multi-word compare-and-swap
//! primitive. Keys are arbitrary byte strings; payloads are fixed-width
//! 64-bit values.
//!
//! ## Design
//!
//! - No per-node latches: every observable state change is the single
//!   linearization point of a [`mwcas`] multi-word CAS over packed 64-bit
//!   words (node status, per-record metadata, payloads, child pointers, the
//!   root cell).
//! - Leaves grow from both ends of a fixed arena: a sorted metadata prefix
//!   plus an unsorted insertion-order suffix, re-sorted by consolidation.
//!   Inserts reserve in one CAS and publish in a second, which is what lets
//!   concurrent inserts proceed while freezes stay correct.
//! - Structural modifications are cooperative: a full node is frozen
//!   (sticky), copied into fresh replacements, and published by one CAS in
//!   an ancestor or on the root cell. Competing installers race
//!   compare-and-swaps with identical expected values, so exactly one wins.
//! - Reclamation is epoch-based via [`crossbeam_epoch`]; superseded nodes
//!   are retired only after the replacing CAS commits.
//!
//! ## Example
//!
//! ```
//! use bztree::BzTree;
//!
//! let tree = BzTree::new();
//!
//! tree.insert(b"apple", 1).unwrap();
//! tree.upsert(b"banana", 2).unwrap();
//! assert_eq!(tree.read(b"apple"), Some(1));
//!
//! tree.delete(b"apple").unwrap();
//! assert_eq!(tree.read(b"apple"), None);
//!
//! for record in tree.range_scan(b"a", b"z") {
//!     assert_eq!(record.key(), b"banana");
//!     assert_eq!(record.payload(), 2);
//! }
//! ```

mod error;
mod internal;
mod key;
mod leaf;
mod metadata;
mod node;
mod scanner;
mod stack;
mod status;
mod tracing_helpers;
mod tree;

pub use error::Error;
pub use scanner::{RangeScanner, Record};
pub use tree::{BzTree, Params};
