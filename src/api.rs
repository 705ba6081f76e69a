//! The concurrency shell and the public, C-shaped surface: `malloc`, `free`,
//! `calloc`, `realloc`, `verify`. A single process-wide mutex serializes all
//! five; none of them has a suspension point inside the critical section
//! other than the OS memory-extension call `HeapState::grow` may make.

use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::chunk::OsChunkSource;
use crate::config::HeapConfig;
use crate::header::header_from_data;
use crate::heap::HeapState;
use crate::validator;

static HEAP: OnceLock<Mutex<HeapState<OsChunkSource>>> = OnceLock::new();

/// Construct-on-first-call access to the single process-wide heap. The
/// `HeapState` itself additionally runs its own one-time init (obtaining the
/// first OS chunk) the first time any of these entry points touches it,
/// gated by `HeapState::ensure_init` rather than by this `OnceLock` — the
/// two are separate one-shot gates for two separate things.
fn lock_heap() -> MutexGuard<'static, HeapState<OsChunkSource>> {
    HEAP.get_or_init(|| Mutex::new(HeapState::new(OsChunkSource::default(), HeapConfig::PRODUCTION)))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returns an 8-byte-aligned pointer to at least `size` writable bytes, or
/// null if `size` is zero, `size` is at least `ARENA_SIZE`, or the OS
/// refuses to extend the heap.
pub fn malloc(size: usize) -> *mut u8 {
    let mut heap = lock_heap();
    match heap.allocate_object(size) {
        Ok(p) => p.as_ptr(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Releases a previously returned pointer. Null is a no-op. Freeing a
/// pointer this allocator did not return is undefined; freeing an
/// already-freed pointer is detected and fatal.
pub fn free(ptr: *mut u8) {
    let Some(p) = NonNull::new(ptr) else {
        return;
    };
    let mut heap = lock_heap();
    if heap.deallocate_object(p).is_err() {
        // SAFETY of the log call: formatted only from data already on the
        // stack, so it cannot re-enter the allocator while `heap` is locked.
        log::error!("double free detected at {:p}", p);
        drop(heap);
        std::process::abort();
    }
}

/// `calloc(n, size) = memset(malloc(n * size), 0, n * size)`. Overflow of
/// `n * size` is not guarded; a caller that cannot bound `n` and `size`
/// independently must check for overflow itself before calling.
pub fn calloc(n: usize, size: usize) -> *mut u8 {
    let total = n * size;
    let ptr = malloc(total);
    if !ptr.is_null() {
        unsafe { std::ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// Allocates `size` bytes, copies `size` bytes from `ptr` into the new
/// region, frees `ptr`, and returns the new pointer.
///
/// The copy length is `size`, not `min(size, old_size)`: when growing, this
/// reads past the end of the old user region. This is the documented
/// contract of this function, not an oversight — a defensive variant would
/// clamp to the old block's recorded size, which the header makes
/// available, but callers that need the safe behavior should clamp `size`
/// themselves before calling. The `global` feature's `GlobalAlloc` shim
/// does exactly that.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    let new_ptr = malloc(size);
    if let Some(old) = NonNull::new(ptr) {
        if !new_ptr.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(old.as_ptr(), new_ptr, size);
            }
        }
        free(ptr);
    }
    new_ptr
}

/// Runs the validator's full structural check suite against the live heap.
pub fn verify() -> bool {
    let mut heap = lock_heap();
    if heap.ensure_init().is_err() {
        return false;
    }
    match validator::verify_all(&mut heap) {
        None => true,
        Some(corruption) => {
            log::warn!("verify() found structural corruption: {corruption}");
            false
        }
    }
}

/// Recovers the block header preceding a pointer this allocator returned,
/// for use by callers (e.g. the `GlobalAlloc` shim) that need the block's
/// recorded size without going through `malloc`/`free` again.
///
/// # Safety
/// `p` must be a pointer this allocator actually returned from a
/// `malloc`-family call, and the caller must not race a concurrent `free` of
/// the same pointer.
pub(crate) unsafe fn object_size(p: NonNull<u8>) -> usize {
    let _heap = lock_heap();
    unsafe { header_from_data(p).as_ref().object_size() }
}
