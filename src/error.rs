//! Filepath: src/error.rs
//!
//! Error types for tree operations.
//!
//! Two layers:
//!
//! - [`Error`] - user-visible outcomes returned by the public [`BzTree`]
//!   surface. These are final: the driver has already retried everything
//!   transient.
//! - [`OpError`] - crate-internal protocol codes produced by node-level
//!   operations. `NodeFrozen`, `NotEnoughSpace` and `MwCasFailure` are
//!   transient observations consumed by the driver's retry/SMO loops and
//!   never escape a public entry point.
//!
//! [`BzTree`]: crate::BzTree

use std::fmt as StdFmt;

// ============================================================================
//  Error (public)
// ============================================================================

/// Errors returned by the public tree operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The key is already present (insert only).
    KeyExists,

    /// The key is not present (read/update/delete).
    NotFound,

    /// The key's record would not fit into an empty leaf node, so no amount
    /// of splitting could make room for it.
    KeyTooLong,
}

impl StdFmt::Display for Error {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::KeyExists => write!(f, "key already exists"),

            Self::NotFound => write!(f, "key not found"),

            Self::KeyTooLong => write!(f, "key too long for configured node size"),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
//  OpError (internal)
// ============================================================================

/// Node-level operation outcome codes.
///
/// Mirrors the protocol's return-code set. The first two map directly onto
/// [`Error`]; the rest are transient and drive the caller's retry or SMO
/// logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpError {
    /// A visible record with this key already exists.
    KeyExists,

    /// No visible record with this key.
    NotFound,

    /// The node's frozen bit is set; it is being superseded. Retraverse.
    NodeFrozen,

    /// The record would push the node past its split threshold. Split.
    NotEnoughSpace,

    /// A multi-word CAS lost to a concurrent one. Retraverse and retry.
    MwCasFailure,
}

pub(crate) type OpResult<T> = Result<T, OpError>;
