//! Compile-time parameters governing the shape of the heap.
//!
//! These are the knobs the rest of the crate is generic over: the number of
//! segregated free-list buckets, the size of a chunk requested from the OS,
//! the in-memory size of a block header, and the bound on how many OS
//! chunks the validator can account for.

use static_assertions::const_assert;

use crate::header::BlockHeader;

/// Number of segregated free-list buckets. Sizes `[32, 496)` each get their
/// own bucket in 8-byte steps; everything `>= 496` shares the last one.
pub const N_LISTS: usize = 59;

/// Size, in bytes, of a chunk requested from the OS in one call. Must be a
/// multiple of 8 and at least `4 * ALLOC_HEADER_SIZE`.
pub const ARENA_SIZE: usize = 4096;

/// Size, in bytes, of the fixed portion of a block header (`object_size` and
/// `object_left_size`). Derived from the header's actual layout rather than
/// hand-maintained, so it can never drift from what the struct really is.
pub const ALLOC_HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Bound on how many distinct OS chunks the validator can account for. A
/// chunk that coalesces into its predecessor does not consume a slot.
pub const MAX_OS_CHUNKS: usize = 1024;

const_assert!(ALLOC_HEADER_SIZE % 8 == 0);
const_assert!(ARENA_SIZE % 8 == 0);
const_assert!(ARENA_SIZE >= 4 * ALLOC_HEADER_SIZE);
const_assert!(N_LISTS >= 2);

/// The lower bound for every live block's `object_size`: a header plus room
/// for the free-list link pair that overlays the block's data when it is
/// unallocated.
pub const MIN_BLOCK_SIZE: usize = 2 * ALLOC_HEADER_SIZE;

const_assert!(MIN_BLOCK_SIZE >= 16);

/// Size threshold past which every block shares the terminal, unsorted
/// bucket. Kept separate from `N_LISTS` so the relationship between the two
/// is explicit at the call site instead of buried in arithmetic.
pub const LAST_LINEAR_SIZE: usize = 496;

const_assert!((LAST_LINEAR_SIZE / 8) - 3 == N_LISTS - 1);

/// Parameters a [`crate::chunk::ChunkSource`] test double needs in order to
/// exercise chunk growth and coalescing without allocating real OS memory on
/// the scale of [`ARENA_SIZE`] per test.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// Size of a single chunk obtained from the `ChunkSource`, in bytes.
    pub arena_size: usize,
}

impl HeapConfig {
    /// The configuration used by the process-wide production heap.
    pub const PRODUCTION: HeapConfig = HeapConfig {
        arena_size: ARENA_SIZE,
    };
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::PRODUCTION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_reasonable() {
        assert_eq!(ALLOC_HEADER_SIZE, 16);
        assert_eq!(MIN_BLOCK_SIZE, 32);
    }
}
