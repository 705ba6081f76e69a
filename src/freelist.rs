//! The segregated free-list index: `N_LISTS` circular doubly-linked lists,
//! each anchored by a self-linked sentinel, plus the size-to-bucket function.
//!
//! A sentinel is laid out exactly like a real block header followed by its
//! overlaid link pair, so the same [`links_mut`] accessor used for ordinary
//! free blocks also works on a sentinel — there is no separate sentinel
//! type distinction anywhere above this module.

use std::ptr::NonNull;

use crate::config::{ALLOC_HEADER_SIZE, LAST_LINEAR_SIZE, N_LISTS};
use crate::header::{links_mut, BlockHeader, FreeLinks, ObjectState};

/// Maps an `object_size` to the bucket index it belongs in. Total,
/// monotonic, and reversible only within the first `N_LISTS - 1` buckets —
/// everything from `LAST_LINEAR_SIZE` upward collapses onto the terminal,
/// unsorted bucket.
pub fn bucket_index(object_size: usize) -> usize {
    if object_size >= LAST_LINEAR_SIZE {
        N_LISTS - 1
    } else {
        (object_size / 8) - 3
    }
}

/// A sentinel node: a zero-size, permanently self-referential anchor for one
/// bucket's circular list. Never itself `Unallocated`-tagged data a real
/// block could be mistaken for — it carries size 0, a state that is never
/// written anywhere else, and its address is the one fixed point every walk
/// of the bucket returns to.
#[repr(C)]
struct Sentinel {
    header: BlockHeader,
    links: FreeLinks,
}

/// Owns all `N_LISTS` sentinels. Lives in-place inside [`crate::heap::HeapState`]
/// and is only ever accessed through `&mut` while the heap mutex is held, so
/// no synchronization of its own is required.
pub struct FreeLists {
    sentinels: Box<[Sentinel]>,
}

impl FreeLists {
    /// Builds `N_LISTS` sentinels with null self-links. The self-links are
    /// not valid until [`FreeLists::init_self_links`] runs, which must
    /// happen only once this value is at its final, stable address (see
    /// `HeapState::ensure_init`) — computing `&sentinel.header` any earlier
    /// would capture an address the move into static storage invalidates.
    pub fn new() -> FreeLists {
        let sentinels = (0..N_LISTS)
            .map(|_| Sentinel {
                header: unsafe { std::mem::zeroed() },
                links: FreeLinks {
                    next: std::ptr::null_mut(),
                    prev: std::ptr::null_mut(),
                },
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        FreeLists { sentinels }
    }

    /// Self-links every sentinel. Must run exactly once, after `self` has
    /// reached its permanent address.
    pub fn init_self_links(&mut self) {
        for s in self.sentinels.iter_mut() {
            let header_ptr: *mut BlockHeader = &mut s.header;
            s.links.next = header_ptr;
            s.links.prev = header_ptr;
        }
    }

    fn sentinel_header(&mut self, bucket: usize) -> NonNull<BlockHeader> {
        unsafe { NonNull::new_unchecked(&mut self.sentinels[bucket].header) }
    }

    /// Exposes a bucket's sentinel to [`crate::validator`], the only other
    /// module allowed to walk a free-list without mutating it.
    pub fn sentinel_header_pub(&mut self, bucket: usize) -> NonNull<BlockHeader> {
        self.sentinel_header(bucket)
    }

    /// Inserts `block` as the new head of bucket `bucket`. Constant time.
    ///
    /// # Safety
    /// `block` must point to a header that is about to be, or already is,
    /// [`ObjectState::Unallocated`], and must not already be a member of any
    /// list.
    pub unsafe fn insert(&mut self, block: NonNull<BlockHeader>, bucket: usize) {
        let sentinel = self.sentinel_header(bucket);
        unsafe {
            let old_head_ptr = links_mut(sentinel).next;

            let block_links = links_mut(block);
            block_links.next = old_head_ptr;
            block_links.prev = sentinel.as_ptr();

            links_mut(NonNull::new_unchecked(old_head_ptr)).prev = block.as_ptr();
            links_mut(sentinel).next = block.as_ptr();
        }
    }

    /// Unlinks `block` from whichever bucket it currently occupies.
    ///
    /// # Safety
    /// `block` must currently be a member of exactly one free-list.
    pub unsafe fn remove(&mut self, block: NonNull<BlockHeader>) {
        unsafe {
            let FreeLinks { next, prev } = {
                let l = links_mut(block);
                FreeLinks { next: l.next, prev: l.prev }
            };
            links_mut(NonNull::new_unchecked(prev)).next = next;
            links_mut(NonNull::new_unchecked(next)).prev = prev;
        }
    }

    /// Scans buckets `start..N_LISTS` for the first block whose `object_size`
    /// is at least `need`, preferring the smallest bucket that could possibly
    /// hold one. The terminal bucket is unsorted by size, so within it (and
    /// only within it) every member is checked.
    ///
    /// # Safety
    /// Every block reachable from a sentinel this crate manages must be a
    /// validly initialized, currently-`Unallocated` header.
    pub unsafe fn find_donor(&mut self, need: usize) -> Option<NonNull<BlockHeader>> {
        let start = bucket_index(need);
        for bucket in start..N_LISTS {
            let sentinel = self.sentinel_header(bucket);
            let mut cur = unsafe { links_mut(sentinel).next };
            while cur != sentinel.as_ptr() {
                let cur_nn = unsafe { NonNull::new_unchecked(cur) };
                if unsafe { cur_nn.as_ref().object_size() } >= need {
                    return Some(cur_nn);
                }
                cur = unsafe { links_mut(cur_nn).next };
            }
        }
        None
    }
}

impl Default for FreeLists {
    fn default() -> Self {
        FreeLists::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bucket_index_is_total_and_monotonic() {
        let mut last = None;
        for size in (32..=4096).step_by(8) {
            let idx = bucket_index(size);
            assert!(idx < N_LISTS);
            if let Some(last) = last {
                assert!(idx >= last, "bucket_index must be monotonic");
            }
            last = Some(idx);
        }
    }

    #[test]
    fn bucket_index_terminal_bucket_absorbs_large_sizes() {
        assert_eq!(bucket_index(LAST_LINEAR_SIZE), N_LISTS - 1);
        assert_eq!(bucket_index(LAST_LINEAR_SIZE + 8), N_LISTS - 1);
        assert_eq!(bucket_index(1 << 20), N_LISTS - 1);
    }

    proptest! {
        #[test]
        fn bucket_index_never_panics_and_stays_in_range(size in 0usize..(1 << 24)) {
            let size = size - (size % 8);
            let idx = bucket_index(size.max(32));
            prop_assert!(idx < N_LISTS);
        }
    }

    #[test]
    fn insert_then_find_then_remove_round_trips() {
        let mut lists = FreeLists::new();
        lists.init_self_links();

        let layout = std::alloc::Layout::from_size_align(64, ALLOC_HEADER_SIZE).unwrap();
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let block = unsafe { NonNull::new_unchecked(raw.cast::<BlockHeader>()) };
        BlockHeader::init(block, 64, ObjectState::Unallocated, 0);

        let bucket = bucket_index(64);
        unsafe {
            lists.insert(block, bucket);
        }
        let found = unsafe { lists.find_donor(64) };
        assert_eq!(found, Some(block));

        unsafe {
            lists.remove(block);
        }
        assert_eq!(unsafe { lists.find_donor(64) }, None);

        unsafe { std::alloc::dealloc(raw, layout) };
    }
}
