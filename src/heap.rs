//! The allocator core, the deallocator core, and the chunk coalescer: the
//! three pieces that actually mutate the heap, all gathered on [`HeapState`]
//! since every mutation touches the same shared sentinels/chunk-list/cursor
//! state.

use std::ptr::NonNull;

use arrayvec::ArrayVec;

use crate::chunk::{install_chunk, ChunkSource};
use crate::config::{HeapConfig, ALLOC_HEADER_SIZE, MAX_OS_CHUNKS, MIN_BLOCK_SIZE};
use crate::error::{AllocError, HeapResult};
use crate::freelist::{bucket_index, FreeLists};
use crate::header::{
    data_ptr, get_left_header, get_right_header, header_from_data, BlockHeader, ObjectState,
};

/// Rounds `n` up to the next multiple of 8.
fn round_up_8(n: usize) -> usize {
    (n + 7) & !7
}

/// All process-wide mutable heap state, gathered into one aggregate so the
/// mutex in `crate::api` guards exactly one value. See the "Global mutable
/// state" design note for why this is one struct rather than several
/// separately locked globals.
pub struct HeapState<S: ChunkSource> {
    free_lists: FreeLists,
    chunk_source: S,
    config: HeapConfig,
    os_chunk_list: ArrayVec<NonNull<BlockHeader>, MAX_OS_CHUNKS>,
    last_fencepost: Option<NonNull<BlockHeader>>,
    base: Option<NonNull<u8>>,
    initialized: bool,
}

// `HeapState` is only ever touched from behind a `Mutex`, and the raw
// pointers it stores all point into memory this `HeapState` exclusively
// owns (via its `ChunkSource`), never into another thread's stack.
unsafe impl<S: ChunkSource + Send> Send for HeapState<S> {}

impl<S: ChunkSource> HeapState<S> {
    pub fn new(chunk_source: S, config: HeapConfig) -> HeapState<S> {
        HeapState {
            free_lists: FreeLists::new(),
            chunk_source,
            config,
            os_chunk_list: ArrayVec::new(),
            last_fencepost: None,
            base: None,
            initialized: false,
        }
    }

    /// Runs the one-time init: self-link the sentinels,
    /// obtain the first OS chunk, and record `base`. Idempotent; safe to
    /// call at the top of every public entry point.
    pub fn ensure_init(&mut self) -> HeapResult<()> {
        if self.initialized {
            return Ok(());
        }
        self.free_lists.init_self_links();
        let arena_size = self.config.arena_size;
        let chunk = self.obtain_chunk(arena_size)?;
        self.base = Some(chunk.left_fencepost.cast());
        self.last_fencepost = Some(chunk.right_fencepost);
        self.record_os_chunk(chunk.left_fencepost);
        let bucket = bucket_index(unsafe { chunk.interior.as_ref().object_size() });
        unsafe { self.free_lists.insert(chunk.interior, bucket) };
        self.initialized = true;
        Ok(())
    }

    fn obtain_chunk(&mut self, size: usize) -> HeapResult<crate::chunk::InstalledChunk> {
        let mem = self.chunk_source.obtain(size)?;
        Ok(unsafe { install_chunk(mem, size) })
    }

    fn record_os_chunk(&mut self, left_fencepost: NonNull<BlockHeader>) {
        if self.os_chunk_list.len() < MAX_OS_CHUNKS {
            self.os_chunk_list.push(left_fencepost);
        }
    }

    pub fn os_chunk_list(&self) -> &[NonNull<BlockHeader>] {
        &self.os_chunk_list
    }

    pub fn free_lists(&mut self) -> &mut FreeLists {
        &mut self.free_lists
    }

    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    /// Services a variable-sized allocation request.
    pub fn allocate_object(&mut self, raw_size: usize) -> HeapResult<NonNull<u8>> {
        self.ensure_init()?;

        if raw_size == 0 || raw_size >= self.config.arena_size {
            return Err(AllocError::InvalidRequest);
        }

        let need = std::cmp::max(
            MIN_BLOCK_SIZE,
            ALLOC_HEADER_SIZE + round_up_8(raw_size),
        );

        // A fresh chunk's interior is at most `arena_size - 2 * ALLOC_HEADER_SIZE`
        // bytes (the rest is its bracketing fenceposts), and non-contiguous
        // chunks never coalesce into something bigger. If `need` can't fit in
        // that interior, no amount of growing will ever produce a donor —
        // reject up front instead of growing the heap forever.
        if need > self.config.arena_size - 2 * ALLOC_HEADER_SIZE {
            return Err(AllocError::InvalidRequest);
        }

        let donor = loop {
            if let Some(donor) = unsafe { self.free_lists.find_donor(need) } {
                break donor;
            }
            self.grow()?;
        };

        Ok(self.split_and_take(donor, need))
    }

    /// Grows the heap by one new OS chunk, folding it into the previous
    /// chunk via the coalescer if the two turn out to be contiguous.
    fn grow(&mut self) -> HeapResult<()> {
        let arena_size = self.config.arena_size;
        let chunk = self.obtain_chunk(arena_size)?;

        // `lfp` (the previous chunk's right fencepost) occupies
        // `ALLOC_HEADER_SIZE` bytes of its own; the new chunk is contiguous
        // with it only if the new chunk's left fencepost begins exactly
        // where `lfp`'s bytes end, not at `lfp`'s own address.
        let contiguous = self.last_fencepost.is_some_and(|lfp| {
            let end_of_lfp = unsafe { lfp.as_ptr().cast::<u8>().add(ALLOC_HEADER_SIZE) };
            end_of_lfp == chunk.left_fencepost.as_ptr().cast::<u8>()
        });

        log::debug!(
            "growing heap by {arena_size} bytes, contiguous with previous chunk: {contiguous}"
        );

        if contiguous {
            self.coalesce_chunk(chunk.left_fencepost, chunk.right_fencepost, chunk.interior);
        } else {
            self.record_os_chunk(chunk.left_fencepost);
            let bucket = bucket_index(unsafe { chunk.interior.as_ref().object_size() });
            unsafe { self.free_lists.insert(chunk.interior, bucket) };
        }
        self.last_fencepost = Some(chunk.right_fencepost);
        Ok(())
    }

    /// The chunk coalescer. `new_left_fencepost` is the left fencepost of
    /// the chunk just obtained (`F2`), which begins exactly where the
    /// previous chunk's right fencepost (`F1`, `self.last_fencepost`) ends —
    /// `F1` and `F2` together span `2 * ALLOC_HEADER_SIZE` contiguous bytes,
    /// both of which fold into the merged free block rooted at `F1`.
    fn coalesce_chunk(
        &mut self,
        new_left_fencepost: NonNull<BlockHeader>,
        new_right_fencepost: NonNull<BlockHeader>,
        new_interior: NonNull<BlockHeader>,
    ) {
        let f1 = self.last_fencepost.expect("coalesce requires a prior chunk");
        debug_assert_eq!(
            unsafe { f1.as_ptr().cast::<u8>().add(ALLOC_HEADER_SIZE) },
            new_left_fencepost.as_ptr().cast::<u8>()
        );

        let interior_size = unsafe { new_interior.as_ref().object_size() };
        let folded_size = interior_size + 2 * ALLOC_HEADER_SIZE;

        unsafe {
            (*f1.as_ptr()).set_object_state(ObjectState::Unallocated);
            (*f1.as_ptr()).set_object_size(folded_size);
            let right = get_right_header(f1);
            debug_assert_eq!(right.as_ptr(), new_right_fencepost.as_ptr());
            (*right.as_ptr()).set_object_left_size(folded_size);
        }

        // `F1` is now a plain free block; merge it with whatever precedes it
        // using the same case B/D logic the deallocator uses.
        self.merge_left_if_free(f1);
    }

    /// Splits `donor` (of size `D`) to satisfy a request needing `need`
    /// bytes and returns a pointer to the carved-out block's data region.
    fn split_and_take(&mut self, donor: NonNull<BlockHeader>, need: usize) -> NonNull<u8> {
        let d = unsafe { donor.as_ref().object_size() };
        debug_assert!(d >= need);

        if d - need < MIN_BLOCK_SIZE {
            // Exact-fit branch: the remainder would be too small to host a
            // header plus its own link pair, so the whole donor is consumed.
            unsafe {
                self.free_lists.remove(donor);
                (*donor.as_ptr()).set_object_state(ObjectState::Allocated);
            }
            return data_ptr(donor);
        }

        // Carve the high-address `need` bytes off `donor` as the allocated
        // tail; the donor shrinks in place to `D - need`.
        let remainder = d - need;
        let old_bucket = bucket_index(d);
        let new_bucket = bucket_index(remainder);

        unsafe {
            (*donor.as_ptr()).set_object_size(remainder);

            let tail_ptr = NonNull::new_unchecked(donor.as_ptr().cast::<u8>().add(remainder).cast());
            BlockHeader::init(tail_ptr, need, ObjectState::Allocated, remainder);

            let right = get_right_header(tail_ptr);
            (*right.as_ptr()).set_object_left_size(need);

            if old_bucket != new_bucket {
                self.free_lists.remove(donor);
                self.free_lists.insert(donor, new_bucket);
            }

            data_ptr(tail_ptr)
        }
    }

    /// Releases a previously returned pointer. Returns `Err` only in the sense of
    /// "this was a double free"; callers must treat that as fatal, not
    /// recoverable (see `crate::api::free`).
    ///
    /// Implemented as two independent merge steps rather than as four
    /// separate cases: absorb a free right neighbor into `h` first (cases
    /// C/D), then merge the (possibly already-grown) `h` into a free left
    /// neighbor (cases B/D); a plain insert of `h` covers case A when
    /// neither merge applies.
    pub fn deallocate_object(&mut self, p: NonNull<u8>) -> Result<(), DoubleFree> {
        let h = unsafe { header_from_data(p) };

        if unsafe { h.as_ref().object_state() } == ObjectState::Unallocated {
            return Err(DoubleFree);
        }
        unsafe { (*h.as_ptr()).set_object_state(ObjectState::Unallocated) };

        let left = unsafe { get_left_header(h) };
        let left_free = unsafe { left.as_ref().object_state() } == ObjectState::Unallocated;

        let right = unsafe { get_right_header(h) };
        if unsafe { right.as_ref().object_state() } == ObjectState::Unallocated {
            self.absorb_right(h, right);
        }

        if left_free {
            let right_of_h = unsafe { get_right_header(h) };
            self.grow_left_neighbor(left, h, right_of_h);
        } else {
            let bucket = bucket_index(unsafe { h.as_ref().object_size() });
            unsafe { self.free_lists.insert(h, bucket) };
        }

        Ok(())
    }

    /// Removes `right` from its free-list and folds its size into `h`,
    /// updating the boundary tag of whatever now lies to `h`'s right.
    fn absorb_right(&mut self, h: NonNull<BlockHeader>, right: NonNull<BlockHeader>) {
        unsafe {
            self.free_lists.remove(right);
            let merged = h.as_ref().object_size() + right.as_ref().object_size();
            (*h.as_ptr()).set_object_size(merged);
            let new_right = get_right_header(h);
            (*new_right.as_ptr()).set_object_left_size(merged);
        }
    }

    /// Shared tail of deallocator cases B and D, and of the chunk
    /// coalescer: grows `left` to absorb `middle` (and `right`, if `right`
    /// was already folded into `middle`'s size by the caller), relocating
    /// `left` to a new bucket if its size class changed.
    fn grow_left_neighbor(
        &mut self,
        left: NonNull<BlockHeader>,
        middle: NonNull<BlockHeader>,
        right: NonNull<BlockHeader>,
    ) {
        let old_bucket = bucket_index(unsafe { left.as_ref().object_size() });
        let new_size =
            unsafe { left.as_ref().object_size() + middle.as_ref().object_size() };
        unsafe {
            (*left.as_ptr()).set_object_size(new_size);
            (*right.as_ptr()).set_object_left_size(new_size);
        }
        let new_bucket = bucket_index(new_size);
        if old_bucket != new_bucket {
            unsafe {
                self.free_lists.remove(left);
                self.free_lists.insert(left, new_bucket);
            }
        }
    }

    /// Used by the chunk coalescer: `f1` has just become a free block; fold
    /// it into its left neighbor if that neighbor is also free (cases B/D
    /// of the deallocator, applied with `f1` playing the role of `h`).
    fn merge_left_if_free(&mut self, f1: NonNull<BlockHeader>) {
        let left = unsafe { get_left_header(f1) };
        if unsafe { left.as_ref().object_state() } != ObjectState::Unallocated {
            let bucket = bucket_index(unsafe { f1.as_ref().object_size() });
            unsafe { self.free_lists.insert(f1, bucket) };
            return;
        }
        let right = unsafe { get_right_header(f1) };
        self.grow_left_neighbor(left, f1, right);
    }
}

/// Marker error: the pointer passed to `free` already referenced an
/// `Unallocated` header. Callers must abort, not recover.
#[derive(Debug, Clone, Copy)]
pub struct DoubleFree;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::FakeChunkSource;
    use test_log::test;

    fn test_heap(arena_size: usize, contiguous: bool) -> HeapState<FakeChunkSource> {
        let config = HeapConfig { arena_size };
        HeapState::new(FakeChunkSource::new(arena_size * 8, contiguous), config)
    }

    #[test]
    fn scenario_1_two_allocs_two_frees_recombine_whole_chunk() {
        let mut heap = test_heap(4096, true);
        let p = heap.allocate_object(1).unwrap();
        let q = heap.allocate_object(1).unwrap();
        heap.deallocate_object(p).unwrap();
        heap.deallocate_object(q).unwrap();

        let expected = 4096 - 2 * ALLOC_HEADER_SIZE;
        let bucket = bucket_index(expected);
        let found = unsafe { heap.free_lists.find_donor(expected) };
        assert!(found.is_some());
        assert_eq!(bucket, crate::config::N_LISTS - 1);
    }

    #[test]
    fn scenario_2_freeing_middle_block_leaves_a_gap() {
        let mut heap = test_heap(4096, true);
        let p = heap.allocate_object(24).unwrap();
        let q = heap.allocate_object(24).unwrap();
        let r = heap.allocate_object(24).unwrap();
        heap.deallocate_object(q).unwrap();

        let gap = unsafe { header_from_data(q) };
        assert_eq!(unsafe { gap.as_ref().object_size() }, 24 + ALLOC_HEADER_SIZE);
        assert_eq!(bucket_index(24 + ALLOC_HEADER_SIZE), 2);

        let p_header = unsafe { header_from_data(p) };
        let r_header = unsafe { header_from_data(r) };
        assert_eq!(unsafe { p_header.as_ref().object_state() }, ObjectState::Allocated);
        assert_eq!(unsafe { r_header.as_ref().object_state() }, ObjectState::Allocated);
    }

    #[test]
    fn scenario_3_freeing_both_neighbors_fully_recoalesces() {
        let mut heap = test_heap(4096, true);
        let a = heap.allocate_object(24).unwrap();
        let b = heap.allocate_object(24).unwrap();
        heap.deallocate_object(a).unwrap();
        heap.deallocate_object(b).unwrap();

        let expected = 4096 - 2 * ALLOC_HEADER_SIZE;
        let found = unsafe { heap.free_lists.find_donor(expected) };
        assert!(found.is_some());
    }

    #[test]
    fn scenario_4_growth_coalesces_when_chunks_are_contiguous() {
        let mut heap = test_heap(512, true);
        let need = 512 - 2 * ALLOC_HEADER_SIZE - ALLOC_HEADER_SIZE;
        let _p = heap.allocate_object(need).unwrap();
        let _q = heap.allocate_object(24).unwrap();
        assert_eq!(heap.os_chunk_list().len(), 1);
    }

    #[test]
    fn scenario_4b_growth_records_new_chunk_when_not_contiguous() {
        let mut heap = test_heap(512, false);
        let need = 512 - 2 * ALLOC_HEADER_SIZE - ALLOC_HEADER_SIZE;
        let _p = heap.allocate_object(need).unwrap();
        let _q = heap.allocate_object(24).unwrap();
        assert_eq!(heap.os_chunk_list().len(), 2);
    }

    #[test]
    fn scenario_5_zero_size_request_is_a_no_op() {
        let mut heap = test_heap(4096, true);
        assert_eq!(heap.allocate_object(0), Err(AllocError::InvalidRequest));
    }

    #[test]
    fn scenario_6_double_free_is_detected() {
        let mut heap = test_heap(4096, true);
        let p = heap.allocate_object(32).unwrap();
        heap.deallocate_object(p).unwrap();
        assert!(heap.deallocate_object(p).is_err());
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut heap = test_heap(4096, true);
        pretty_assertions::assert_eq!(
            heap.allocate_object(4096),
            Err(AllocError::InvalidRequest)
        );
    }

    /// `raw_size` below `arena_size` can still round up to a `need` that no
    /// single fresh chunk's interior could ever satisfy. This must be
    /// rejected immediately rather than growing the heap without bound.
    #[test]
    fn request_too_large_for_any_single_chunk_is_rejected() {
        let mut heap = test_heap(4096, false);
        let raw_size = 4096 - 3 * ALLOC_HEADER_SIZE + 1;
        pretty_assertions::assert_eq!(
            heap.allocate_object(raw_size),
            Err(AllocError::InvalidRequest)
        );
        assert_eq!(heap.os_chunk_list().len(), 1, "must not have grown the heap");
    }

    /// Drives a random sequence of allocate/free operations against a
    /// small-arena heap and checks, after every step, that the validator
    /// still accepts the structure and that every live allocation still
    /// falls on an 8-byte boundary.
    #[derive(Debug, Clone, Copy)]
    enum Op {
        Alloc(usize),
        FreeOldest,
    }

    fn op_strategy() -> impl proptest::strategy::Strategy<Value = Op> {
        use proptest::prelude::*;
        prop_oneof![
            (1usize..200).prop_map(Op::Alloc),
            Just(Op::FreeOldest),
        ]
    }

    use proptest::prelude::*;

    proptest::proptest! {
        #[test]
        fn random_alloc_free_sequences_preserve_invariants(ops in proptest::collection::vec(op_strategy(), 1..64)) {
            let mut heap = test_heap(1024, true);
            let mut live: std::collections::VecDeque<NonNull<u8>> = std::collections::VecDeque::new();

            for op in ops {
                match op {
                    Op::Alloc(size) => {
                        if let Ok(p) = heap.allocate_object(size) {
                            prop_assert_eq!(p.as_ptr() as usize % 8, 0);
                            live.push_back(p);
                        }
                    }
                    Op::FreeOldest => {
                        if let Some(p) = live.pop_front() {
                            prop_assert!(heap.deallocate_object(p).is_ok());
                        }
                    }
                }
                prop_assert!(crate::validator::verify_all(&mut heap).is_none());
            }
        }
    }
}
