#[cfg(not(any(target_pointer_width = "32", target_pointer_width = "64")))]
compile_error!("ewram supports only 32-bit and 64-bit targets.");

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators
pub use memory::buddy::PageAllocator;
pub use memory::heap::HeapAllocator;
pub use memory::slob::{SlobAllocator, SlobConfig};

// region + build-time configuration
pub use memory::config::{
    BITMAP_ORDER_OFFSET, BITMAP_TOTAL_SIZE, EAGER_HIGH_BREAK_SHRINK, FASTBIN_MAX_ORDER,
    MAX_PAGE_FRAMES, MAX_PAGE_ORDER, PAGE_SHIFT, PAGE_SIZE, SMALLBIN_MAX_ORDER,
};
pub use memory::region::{MemError, Region};

// process-global facade
pub use memory::global::{
    free, malloc, malloc_has_init, malloc_init, page_alloc, page_free, page_has_init, page_init,
    slob_alloc, slob_free, wram_stats, WramStats,
};
