//! The validator: cycle detection, bidirectional-link agreement, and
//! per-chunk boundary-tag consistency. Side-effect-free; safe to call while
//! holding the heap mutex, which is the only time it is ever called.

use std::ptr::NonNull;

use crate::chunk::ChunkSource;
use crate::config::N_LISTS;
use crate::error::Corruption;
use crate::freelist::bucket_index;
use crate::header::{get_right_header, links_mut, BlockHeader, ObjectState};
use crate::heap::HeapState;

/// Floyd tortoise-and-hare over bucket `bucket`'s circular list. Returns the
/// node a cycle was detected at, or `None` if the list is a simple loop back
/// to its own sentinel (the only cycle a well-formed list has).
fn detect_cycle_in_bucket(sentinel: NonNull<BlockHeader>) -> Option<NonNull<BlockHeader>> {
    let mut slow = sentinel;
    let mut fast = sentinel;
    loop {
        slow = unsafe { NonNull::new_unchecked(links_mut(slow).next) };
        fast = unsafe { NonNull::new_unchecked(links_mut(fast).next) };
        if fast.as_ptr() == sentinel.as_ptr() {
            return None;
        }
        fast = unsafe { NonNull::new_unchecked(links_mut(fast).next) };
        if fast.as_ptr() == sentinel.as_ptr() {
            return None;
        }
        if slow.as_ptr() == fast.as_ptr() {
            return Some(slow);
        }
    }
}

/// Runs the tortoise-and-hare cycle check over every
/// bucket, returning the first corruption found.
pub fn detect_cycles<S: ChunkSource>(heap: &mut HeapState<S>) -> Option<Corruption> {
    for bucket in 0..N_LISTS {
        let sentinel = heap.free_lists().sentinel_header_pub(bucket);
        if detect_cycle_in_bucket(sentinel).is_some() {
            return Some(Corruption::Cycle { bucket });
        }
    }
    None
}

/// For every free-list node, checks that
/// `cur->next->prev == cur && cur->prev->next == cur`.
pub fn verify_pointers<S: ChunkSource>(heap: &mut HeapState<S>) -> Option<Corruption> {
    for bucket in 0..N_LISTS {
        let sentinel = heap.free_lists().sentinel_header_pub(bucket);
        let mut cur = sentinel;
        loop {
            let (next, prev) = unsafe {
                let l = links_mut(cur);
                (NonNull::new_unchecked(l.next), NonNull::new_unchecked(l.prev))
            };
            let next_prev = unsafe { links_mut(next).prev };
            let prev_next = unsafe { links_mut(prev).next };
            if next_prev != cur.as_ptr() || prev_next != cur.as_ptr() {
                return Some(Corruption::BadLinks { bucket });
            }
            cur = next;
            if cur.as_ptr() == sentinel.as_ptr() {
                break;
            }
        }
    }
    None
}

/// Linear sweep of one chunk from its left
/// fencepost to its right fencepost, checking boundary-tag agreement
/// at every step and that the chunk is bracketed by fenceposts on both
/// ends.
fn verify_chunk(chunk_index: usize, left_fencepost: NonNull<BlockHeader>) -> Option<Corruption> {
    if unsafe { left_fencepost.as_ref().object_state() } != ObjectState::Fencepost {
        return Some(Corruption::MissingFencepost { chunk: chunk_index });
    }

    let mut cur = left_fencepost;
    loop {
        let size = unsafe { cur.as_ref().object_size() };
        let right = unsafe { get_right_header(cur) };
        if unsafe { right.as_ref().object_left_size() } != size {
            let offset = right.as_ptr() as usize - left_fencepost.as_ptr() as usize;
            return Some(Corruption::BoundaryTag {
                chunk: chunk_index,
                offset,
            });
        }
        if unsafe { right.as_ref().object_state() } == ObjectState::Fencepost {
            return None;
        }
        cur = right;
    }
}

/// Runs `verify_chunk` over every recorded OS chunk, plus the one global
/// check that isn't per-chunk: the first recorded chunk's left fencepost
/// must be `base`, the address fixed at init time.
pub fn verify_tags<S: ChunkSource>(heap: &mut HeapState<S>) -> Option<Corruption> {
    if let (Some(base), Some(&first)) = (heap.base(), heap.os_chunk_list().first()) {
        if base.cast() != first {
            return Some(Corruption::MissingFencepost { chunk: 0 });
        }
    }
    for (i, &left_fencepost) in heap.os_chunk_list().iter().enumerate() {
        if let Some(corruption) = verify_chunk(i, left_fencepost) {
            return Some(corruption);
        }
    }
    None
}

/// `verify_free_list_membership()`: every block reachable from bucket `i`'s
/// sentinel actually belongs there, i.e. `bucket_index(block->object_size) ==
/// i`. Walks the free-lists themselves rather than the chunk sweep
/// `verify_tags` performs, since membership is a property of *which list a
/// block sits in*, not of the block's position in the heap.
pub fn verify_free_list_membership<S: ChunkSource>(heap: &mut HeapState<S>) -> Option<Corruption> {
    for bucket in 0..N_LISTS {
        let sentinel = heap.free_lists().sentinel_header_pub(bucket);
        let mut cur = unsafe { links_mut(sentinel).next };
        while cur != sentinel.as_ptr() {
            let cur_nn = unsafe { NonNull::new_unchecked(cur) };
            let size = unsafe { cur_nn.as_ref().object_size() };
            let expected = bucket_index(size);
            if expected != bucket {
                return Some(Corruption::WrongBucket { bucket, expected });
            }
            cur = unsafe { links_mut(cur_nn).next };
        }
    }
    None
}

/// Runs every structural check, short-circuiting on the first failure. The
/// public `verify()` at the top of the crate collapses this to a plain
/// `bool`; the richer [`Corruption`] value here exists for the one `warn!`
/// log line emitted on failure, and for tests that want to assert exactly
/// which invariant broke.
pub fn verify_all<S: ChunkSource>(heap: &mut HeapState<S>) -> Option<Corruption> {
    detect_cycles(heap)
        .or_else(|| verify_pointers(heap))
        .or_else(|| verify_tags(heap))
        .or_else(|| verify_free_list_membership(heap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::FakeChunkSource;
    use crate::config::HeapConfig;
    use test_log::test;

    fn test_heap(arena_size: usize) -> HeapState<FakeChunkSource> {
        let config = HeapConfig { arena_size };
        HeapState::new(FakeChunkSource::new(arena_size * 8, true), config)
    }

    #[test]
    fn fresh_heap_passes_every_check() {
        let mut heap = test_heap(4096);
        heap.ensure_init().unwrap();
        assert!(verify_all(&mut heap).is_none());
    }

    #[test]
    fn verify_all_survives_a_busy_heap() {
        let mut heap = test_heap(4096);
        let a = heap.allocate_object(24).unwrap();
        let b = heap.allocate_object(48).unwrap();
        let c = heap.allocate_object(24).unwrap();
        heap.deallocate_object(b).unwrap();
        assert!(verify_all(&mut heap).is_none());
        heap.deallocate_object(a).unwrap();
        heap.deallocate_object(c).unwrap();
        assert!(verify_all(&mut heap).is_none());
    }

    #[test]
    fn detect_cycles_accepts_the_sentinel_self_loop() {
        let mut heap = test_heap(4096);
        heap.ensure_init().unwrap();
        assert!(detect_cycles(&mut heap).is_none());
    }

    #[test]
    fn verify_pointers_accepts_a_freshly_linked_bucket() {
        let mut heap = test_heap(4096);
        let p = heap.allocate_object(24).unwrap();
        heap.deallocate_object(p).unwrap();
        assert!(verify_pointers(&mut heap).is_none());
    }

    #[test]
    fn split_remainder_lands_in_its_own_matching_bucket() {
        // Allocating out of a fresh 4096-byte chunk splits off a 40-byte
        // remainder (24 + header) sized for bucket 2, leaving the rest of
        // the chunk (a different size, hence a different bucket) behind.
        let mut heap = test_heap(4096);
        let p = heap.allocate_object(24).unwrap();
        let q = heap.allocate_object(24).unwrap();
        heap.deallocate_object(q).unwrap();

        assert!(verify_free_list_membership(&mut heap).is_none());

        let gap = unsafe { crate::header::header_from_data(q) };
        let gap_size = unsafe { gap.as_ref().object_size() };
        let gap_bucket = bucket_index(gap_size);
        let found = unsafe { heap.free_lists().find_donor(gap_size) };
        assert_eq!(found, Some(gap));
        assert_eq!(gap_bucket, 2);
        let _ = p;
    }

    #[test]
    fn verify_free_list_membership_catches_a_relocated_block() {
        let mut heap = test_heap(4096);
        let p = heap.allocate_object(24).unwrap();
        heap.deallocate_object(p).unwrap();
        assert!(verify_free_list_membership(&mut heap).is_none());

        // Directly corrupt membership: move the free block into a bucket
        // that doesn't match its size, bypassing the normal insert/remove
        // call sites that would keep the two in sync.
        let block = unsafe { crate::header::header_from_data(p) };
        let correct_bucket = bucket_index(unsafe { block.as_ref().object_size() });
        let wrong_bucket = (correct_bucket + 1) % N_LISTS;
        unsafe {
            heap.free_lists().remove(block);
            heap.free_lists().insert(block, wrong_bucket);
        }

        assert!(matches!(
            verify_free_list_membership(&mut heap),
            Some(Corruption::WrongBucket { bucket, .. }) if bucket == wrong_bucket
        ));
    }
}
