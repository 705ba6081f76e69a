//! Error taxonomy for the internal heap surface.
//!
//! Double-free is deliberately absent from this enum: it is not a
//! recoverable condition, and is handled as a process abort at the call
//! site rather than plumbed through `Result` (see [`crate::free`]).

use thiserror::Error;

/// Internal result type used by every helper below the public `malloc`-shaped
/// surface. The outermost entry points collapse this to a raw pointer or
/// `bool`, matching the allocator's C-shaped public surface.
pub type HeapResult<T> = Result<T, AllocError>;

/// Reasons an allocation request can be refused without any diagnostic
/// being emitted — both are silent, benign nulls at the public API.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// `size == 0` or `size >= ARENA_SIZE`.
    #[error("invalid allocation request")]
    InvalidRequest,
    /// The OS refused to hand back a new chunk.
    #[error("out of memory")]
    OutOfMemory,
}

/// A named reason the validator's structural checks failed. Not part of the
/// public surface (`verify()` stays a plain `bool`), but used internally and
/// by tests to assert *which* invariant broke.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    #[error("cycle detected in free-list bucket {bucket}")]
    Cycle { bucket: usize },
    #[error("free-list bucket {bucket} has a node whose neighbors disagree about it")]
    BadLinks { bucket: usize },
    #[error("chunk {chunk} violates the boundary-tag invariant at offset {offset}")]
    BoundaryTag { chunk: usize, offset: usize },
    #[error("chunk {chunk} is not bracketed by fenceposts")]
    MissingFencepost { chunk: usize },
    #[error("free-list bucket {bucket} holds a block whose size maps to bucket {expected}")]
    WrongBucket { bucket: usize, expected: usize },
}
