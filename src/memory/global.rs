//! Process-global facade over the allocator stack.
//!
//! Embedded firmware keeps one page allocator and one heap for the whole
//! work RAM; this module is that wiring. The state lives in a static, so
//! the heap's control block (which free chunks point back into) never
//! moves. The C-shaped functions are null-tolerant: a null pointer frees
//! to a no-op, a failed allocation returns null.

use std::ptr::{null_mut, NonNull};
use std::sync::atomic::Ordering;
use std::sync::{Mutex, OnceLock};

use super::buddy::PageAllocator;
use super::heap::HeapAllocator;
use super::region::Region;
use super::slob::SlobAllocator;
use super::stats;

struct WramState {
    pages: PageAllocator,
    heap: Option<HeapAllocator>,
}

static WRAM: OnceLock<Mutex<WramState>> = OnceLock::new();

fn state() -> Option<&'static Mutex<WramState>> {
    WRAM.get()
}

/// Bind the global page allocator to `region`. Returns true on success or
/// if already initialized (the original region stays bound).
pub fn page_init(region: Region) -> bool {
    if WRAM.get().is_some() {
        return true;
    }
    let candidate = Mutex::new(WramState {
        pages: PageAllocator::new(region),
        heap: None,
    });
    drop(WRAM.set(candidate));
    WRAM.get().is_some()
}

#[must_use]
pub fn page_has_init() -> bool {
    WRAM.get().is_some()
}

/// Allocate `1 << order` pages from the global high arena.
/// Returns null before `page_init` or on exhaustion.
///
/// # Panics
///
/// Panics if the global lock is poisoned.
#[must_use]
pub fn page_alloc(order: usize) -> *mut u8 {
    let Some(lock) = state() else {
        return null_mut();
    };
    let mut state = lock.lock().unwrap();
    state
        .pages
        .allocate_high_page(order)
        .map_or(null_mut(), NonNull::as_ptr)
}

/// Return a block from [`page_alloc`]. Null is a no-op.
///
/// # Safety
/// - A non-null `page` must have come from [`page_alloc`] with the same
///   `order`, and must not have been freed already.
///
/// # Panics
///
/// Panics if the global lock is poisoned.
pub unsafe fn page_free(page: *mut u8, order: usize) {
    let Some(ptr) = NonNull::new(page) else {
        return;
    };
    let Some(lock) = state() else {
        return;
    };
    // Safety: upheld by caller.
    unsafe { lock.lock().unwrap().pages.free_high_page(ptr, order) }
}

/// Initialize the global heap allocator. Requires the page allocator to be
/// initialized first; returns false otherwise. Idempotent.
///
/// # Panics
///
/// Panics if the global lock is poisoned.
pub fn malloc_init() -> bool {
    let Some(lock) = state() else {
        return false;
    };
    let mut state = lock.lock().unwrap();
    if state.heap.is_none() {
        state.heap = Some(HeapAllocator::new());
    }
    true
}

/// # Panics
///
/// Panics if the global lock is poisoned.
#[must_use]
pub fn malloc_has_init() -> bool {
    state().is_some_and(|lock| lock.lock().unwrap().heap.is_some())
}

/// Allocate `size` bytes from the global heap. Returns null before
/// `malloc_init`, for a zero size, or on exhaustion.
///
/// # Panics
///
/// Panics if the global lock is poisoned.
#[must_use]
pub fn malloc(size: usize) -> *mut u8 {
    let Some(lock) = state() else {
        return null_mut();
    };
    let mut guard = lock.lock().unwrap();
    let state = &mut *guard;
    let Some(heap) = state.heap.as_mut() else {
        return null_mut();
    };
    heap.allocate(&mut state.pages, size)
        .map_or(null_mut(), NonNull::as_ptr)
}

/// Return a block from [`malloc`]. Null is a no-op.
///
/// # Safety
/// - A non-null `ptr` must have come from [`malloc`] and must not have
///   been freed already.
///
/// # Panics
///
/// Panics if the global lock is poisoned.
pub unsafe fn free(ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };
    let Some(lock) = state() else {
        return;
    };
    let mut guard = lock.lock().unwrap();
    let state = &mut *guard;
    let Some(heap) = state.heap.as_mut() else {
        return;
    };
    // Safety: upheld by caller.
    unsafe { heap.deallocate(&mut state.pages, ptr) }
}

/// Allocate one object from `slob`, drawing frames from the global page
/// allocator. Returns null before `page_init` or on exhaustion.
///
/// # Panics
///
/// Panics if the global lock is poisoned.
#[must_use]
pub fn slob_alloc(slob: &mut SlobAllocator) -> *mut u8 {
    let Some(lock) = state() else {
        return null_mut();
    };
    let mut state = lock.lock().unwrap();
    slob.allocate(&mut state.pages)
        .map_or(null_mut(), NonNull::as_ptr)
}

/// Return an object to `slob`. Null and unrecognized pointers are no-ops.
///
/// # Safety
/// - A non-null `ptr` must point into the global region or at memory that
///   may be read harmlessly; see `SlobAllocator::deallocate`.
///
/// # Panics
///
/// Panics if the global lock is poisoned.
pub unsafe fn slob_free(slob: &mut SlobAllocator, ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };
    let Some(lock) = state() else {
        return;
    };
    let mut state = lock.lock().unwrap();
    // Safety: upheld by caller.
    unsafe { slob.deallocate(&mut state.pages, ptr) }
}

/// Snapshot of the diagnostic counters.
pub struct WramStats {
    pub high_pages_live: usize,
    pub low_pages_live: usize,
    pub heap_bytes_live: usize,
    pub slob_frames_live: usize,
    pub slob_objects_live: usize,
}

#[must_use]
pub fn wram_stats() -> WramStats {
    WramStats {
        high_pages_live: stats::HIGH_PAGES_LIVE.load(Ordering::Relaxed),
        low_pages_live: stats::LOW_PAGES_LIVE.load(Ordering::Relaxed),
        heap_bytes_live: stats::HEAP_BYTES_LIVE.load(Ordering::Relaxed),
        slob_frames_live: stats::SLOB_FRAMES_LIVE.load(Ordering::Relaxed),
        slob_objects_live: stats::SLOB_OBJECTS_LIVE.load(Ordering::Relaxed),
    }
}
