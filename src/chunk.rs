//! The OS chunk provider: obtains `ARENA_SIZE`-aligned contiguous regions
//! and installs the sentinel fenceposts that bracket them.
//!
//! The actual OS collaborator is abstracted behind [`ChunkSource`] so the
//! heap's splitting/coalescing logic can be exercised against a small,
//! deterministic in-memory double instead of real address space, whose
//! layout (and thus whether two chunks end up contiguous) this crate does
//! not control.

use std::ptr::NonNull;

use crate::config::ALLOC_HEADER_SIZE;
use crate::error::{AllocError, HeapResult};
use crate::header::{BlockHeader, ObjectState};

/// Supplies contiguous regions of memory to the heap. Implementations need
/// not guarantee that consecutive calls return adjacent regions; the heap
/// detects contiguity itself and coalesces only when it actually occurs.
pub trait ChunkSource {
    /// Obtain `size` freshly mapped, zero-initialized bytes.
    fn obtain(&mut self, size: usize) -> HeapResult<NonNull<u8>>;
}

/// Production [`ChunkSource`]: anonymous, private `mmap` pages.
#[derive(Debug, Default)]
pub struct OsChunkSource {
    _private: (),
}

impl ChunkSource for OsChunkSource {
    fn obtain(&mut self, size: usize) -> HeapResult<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            log::debug!("mmap refused to grow the heap by {size} bytes");
            return Err(AllocError::OutOfMemory);
        }
        Ok(NonNull::new(ptr.cast::<u8>()).expect("mmap succeeded but returned null"))
    }
}

/// Deterministic in-memory [`ChunkSource`] for tests. Hands out slices of one
/// pre-allocated backing buffer, either contiguously or with a deliberate
/// gap after every chunk so tests can force the non-coalescing path without
/// depending on what the real OS's address-space layout happens to do.
pub struct FakeChunkSource {
    backing: Box<[u8]>,
    cursor: usize,
    contiguous: bool,
}

impl FakeChunkSource {
    /// `capacity` must be large enough for every chunk the test requests,
    /// including the gap bytes burned when `contiguous` is false.
    pub fn new(capacity: usize, contiguous: bool) -> Self {
        FakeChunkSource {
            backing: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
            contiguous,
        }
    }
}

impl ChunkSource for FakeChunkSource {
    fn obtain(&mut self, size: usize) -> HeapResult<NonNull<u8>> {
        if !self.contiguous && self.cursor != 0 {
            // Burn a gap so this chunk cannot abut the previous one.
            self.cursor += size;
        }
        if self.cursor + size > self.backing.len() {
            return Err(AllocError::OutOfMemory);
        }
        let ptr = unsafe { self.backing.as_mut_ptr().add(self.cursor) };
        self.cursor += size;
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }
}

/// The three headers written when a new chunk is installed.
pub struct InstalledChunk {
    pub left_fencepost: NonNull<BlockHeader>,
    pub right_fencepost: NonNull<BlockHeader>,
    pub interior: NonNull<BlockHeader>,
}

/// Writes fenceposts at both ends of a freshly obtained `size`-byte region
/// and configures its interior as a single unallocated block.
///
/// # Safety
/// `mem` must point to at least `size` writable, exclusively-owned bytes.
pub unsafe fn install_chunk(mem: NonNull<u8>, size: usize) -> InstalledChunk {
    debug_assert_eq!(size % 8, 0);
    debug_assert!(size >= 2 * ALLOC_HEADER_SIZE);

    let left_fencepost = mem.cast::<BlockHeader>();
    BlockHeader::init(left_fencepost, ALLOC_HEADER_SIZE, ObjectState::Fencepost, 0);

    let interior_size = size - 2 * ALLOC_HEADER_SIZE;
    let interior = unsafe { NonNull::new_unchecked(mem.as_ptr().add(ALLOC_HEADER_SIZE).cast()) };
    BlockHeader::init(
        interior,
        interior_size,
        ObjectState::Unallocated,
        ALLOC_HEADER_SIZE,
    );

    let right_fencepost =
        unsafe { NonNull::new_unchecked(mem.as_ptr().add(size - ALLOC_HEADER_SIZE).cast()) };
    BlockHeader::init(
        right_fencepost,
        ALLOC_HEADER_SIZE,
        ObjectState::Fencepost,
        interior_size,
    );

    InstalledChunk {
        left_fencepost,
        right_fencepost,
        interior,
    }
}
