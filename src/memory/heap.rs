use std::ptr::{null_mut, NonNull};

use super::buddy::PageAllocator;
use super::config::{FASTBIN_MAX_ORDER, PAGE_SHIFT, PAGE_SIZE, SMALLBIN_MAX_ORDER};
use super::stats;

/// Bit 0 of the size word: the physically preceding chunk is in use.
const FLAG_PREV_IN_USE: u32 = 0b01;
/// Bit 1 of the size word: this chunk came straight from the page
/// allocator; its size word stores the page order, not a byte count.
const FLAG_PAGE_ALLOCATED: u32 = 0b10;
const FLAG_MASK: u32 = 0b11;

/// Payload sizes are rounded to the machine word so the free-node overlay
/// is always properly aligned.
const CHUNK_ALIGN: usize = std::mem::size_of::<usize>();

/// Every chunk starts with these two words.
///
/// ```text
///   +--------------+
///   | prev_size    |  size of the preceding chunk; meaningful only while
///   +----------+---+  that chunk is free
///   | size | M | P |  payload size, M = page-allocated, P = prev-in-use
///   +----------+---+
///   | payload ...  |  user bytes, or a free-node overlay while free
///   +--------------+
/// ```
#[repr(C)]
struct ChunkHdr {
    prev_size: u32,
    size: u32,
}

/// Distance from a chunk's first byte to its payload.
const PAYLOAD_OFFSET: usize = std::mem::size_of::<ChunkHdr>();

/// Free-node overlay for fast, small and unsorted chunks.
#[repr(C)]
struct SmallNode {
    prev: *mut SmallNode,
    next: *mut SmallNode,
}

/// Free-node overlay for large chunks. The first two fields mirror
/// [`SmallNode`]; `prev_size`/`next_size` thread the per-class size chain
/// through one representative per distinct size.
#[repr(C)]
struct LargeNode {
    prev: *mut SmallNode,
    next: *mut SmallNode,
    prev_size: *mut LargeNode,
    next_size: *mut LargeNode,
}

/// Smallest payload: a free chunk must be able to host a small node.
const MIN_PAYLOAD: usize = std::mem::size_of::<SmallNode>();

const NUM_SMALL_BINS: usize = SMALLBIN_MAX_ORDER - FASTBIN_MAX_ORDER;
const NUM_LARGE_BINS: usize = PAGE_SHIFT - SMALLBIN_MAX_ORDER;

const _: () = assert!(MIN_PAYLOAD.is_power_of_two());
const _: () = assert!(MIN_PAYLOAD <= 1 << (FASTBIN_MAX_ORDER - 1));
const _: () = assert!(std::mem::size_of::<LargeNode>() <= 1 << SMALLBIN_MAX_ORDER);

#[inline]
fn physical(payload: usize) -> usize {
    payload + PAYLOAD_OFFSET
}

/// Bin class for a chunk size: the `k` with `2^k < size <= 2^(k+1)`.
#[inline]
fn class_of_size(size: usize) -> usize {
    (size - 1).ilog2() as usize
}

#[inline]
fn is_large_range(size: usize) -> bool {
    size >= (1 << SMALLBIN_MAX_ORDER) && size < PAGE_SIZE
}

/// Cursor over a chunk header. Copyable; all accessors are raw reads and
/// writes into the managed region.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Chunk(*mut ChunkHdr);

impl Chunk {
    unsafe fn of_payload(payload: *mut u8) -> Self {
        // Safety: payload sits PAYLOAD_OFFSET bytes into its chunk.
        Self(unsafe { payload.sub(PAYLOAD_OFFSET) }.cast())
    }

    unsafe fn of_node(node: *mut SmallNode) -> Self {
        unsafe { Self::of_payload(node.cast()) }
    }

    unsafe fn size(self) -> usize {
        unsafe { ((*self.0).size & !FLAG_MASK) as usize }
    }

    /// Replace the size without erasing the flag bits.
    unsafe fn set_size(self, size: usize) {
        unsafe {
            let flags = (*self.0).size & FLAG_MASK;
            (*self.0).size = flags | size as u32;
        }
    }

    unsafe fn prev_size(self) -> usize {
        unsafe { (*self.0).prev_size as usize }
    }

    unsafe fn set_prev_size(self, size: usize) {
        unsafe { (*self.0).prev_size = size as u32 }
    }

    unsafe fn set_flag(self, flag: u32) {
        unsafe { (*self.0).size |= flag }
    }

    unsafe fn clear_flag(self, flag: u32) {
        unsafe { (*self.0).size &= !flag }
    }

    unsafe fn prev_in_use(self) -> bool {
        unsafe { (*self.0).size & FLAG_PREV_IN_USE != 0 }
    }

    unsafe fn page_allocated(self) -> bool {
        unsafe { (*self.0).size & FLAG_PAGE_ALLOCATED != 0 }
    }

    unsafe fn physical_size(self) -> usize {
        unsafe { physical(self.size()) }
    }

    unsafe fn next_physical(self) -> Chunk {
        unsafe { Chunk(self.0.cast::<u8>().add(self.physical_size()).cast()) }
    }

    unsafe fn prev_physical(self) -> Chunk {
        unsafe { Chunk(self.0.cast::<u8>().sub(physical(self.prev_size())).cast()) }
    }

    /// A chunk is in use iff its successor's P bit is set.
    unsafe fn in_use(self) -> bool {
        unsafe { self.next_physical().prev_in_use() }
    }

    unsafe fn payload(self) -> *mut u8 {
        unsafe { self.0.cast::<u8>().add(PAYLOAD_OFFSET) }
    }

    unsafe fn payload_nonnull(self) -> NonNull<u8> {
        // Safety: payload points into the managed region.
        unsafe { NonNull::new_unchecked(self.payload()) }
    }

    unsafe fn small_node(self) -> *mut SmallNode {
        unsafe { self.payload().cast() }
    }

    unsafe fn large_node(self) -> *mut LargeNode {
        unsafe { self.payload().cast() }
    }
}

// ----------------------------------------------------------------
// intrusive list surgery
//
// Every bin head is a sentinel node embedded in the control block, so the
// first element's `prev` is a real link site and unlinking never needs to
// know which bin a chunk is on.
// ----------------------------------------------------------------

unsafe fn unlink_small(node: *mut SmallNode) {
    unsafe {
        let prev = (*node).prev;
        let next = (*node).next;
        if !prev.is_null() {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*node).prev = null_mut();
        (*node).next = null_mut();
    }
}

unsafe fn insert_after(anchor: *mut SmallNode, node: *mut SmallNode) {
    unsafe {
        (*node).prev = anchor;
        (*node).next = (*anchor).next;
        if !(*anchor).next.is_null() {
            (*(*anchor).next).prev = node;
        }
        (*anchor).next = node;
    }
}

unsafe fn insert_before(anchor: *mut SmallNode, node: *mut SmallNode) {
    unsafe {
        (*node).prev = (*anchor).prev;
        (*node).next = anchor;
        if !(*anchor).prev.is_null() {
            (*(*anchor).prev).next = node;
        }
        (*anchor).prev = node;
    }
}

/// Unlink a chunk from a large bin, maintaining the size chain.
///
/// Representatives always carry a non-null `prev_size` (the bin head is a
/// real link site); peers carry null size links. When a representative
/// with peers leaves, its first peer is elevated into the size chain and
/// both neighbors are repointed at it.
unsafe fn unlink_large(node: *mut LargeNode) {
    unsafe {
        let prev_size = (*node).prev_size;
        let next_size = (*node).next_size;
        if !prev_size.is_null() || !next_size.is_null() {
            let follower = (*node).next.cast::<LargeNode>();
            if !follower.is_null() && follower != next_size {
                // The small-successor is one of our peers: elevate it.
                (*follower).prev_size = prev_size;
                (*follower).next_size = next_size;
                if !prev_size.is_null() {
                    (*prev_size).next_size = follower;
                }
                if !next_size.is_null() {
                    (*next_size).prev_size = follower;
                }
            } else {
                // No peers: splice the size chain past this node.
                if !prev_size.is_null() {
                    (*prev_size).next_size = next_size;
                }
                if !next_size.is_null() {
                    (*next_size).prev_size = prev_size;
                }
            }
            (*node).prev_size = null_mut();
            (*node).next_size = null_mut();
        }
        unlink_small(node.cast());
    }
}

/// Detach a free chunk from whatever bin it is on, dispatching on its size
/// range (large chunks carry the four-pointer node).
unsafe fn unlink_by_size(chunk: Chunk) {
    unsafe {
        if is_large_range(chunk.size()) {
            unlink_large(chunk.large_node());
        } else {
            unlink_small(chunk.small_node());
        }
    }
}

// ----------------------------------------------------------------
// coalescing
// ----------------------------------------------------------------

/// Absorb the run of free chunks physically preceding `chunk` into its
/// first member. Every absorbed chunk is unlinked from its bin; sizes and
/// `chunk`'s `prev_size` are maintained along the way. Returns the run's
/// first chunk (detached), or `None` when the predecessor is in use.
///
/// Each chunk is unlinked before any size merge touches it: the unlink
/// dispatch must see the size the chunk was binned under, not the
/// inflated one.
unsafe fn coalesce_before(chunk: Chunk) -> Option<Chunk> {
    unsafe {
        if chunk.prev_in_use() {
            return None;
        }
        let mut result = chunk.prev_physical();
        unlink_by_size(result);
        while !result.prev_in_use() {
            let before = result.prev_physical();
            unlink_by_size(before);
            let merged = result.prev_size() + result.physical_size();
            before.set_size(merged);
            chunk.set_prev_size(merged);
            result = before;
        }
        Some(result)
    }
}

/// Absorb the run of free chunks physically following `chunk` into it.
/// The run never reaches the top chunk: the chunk physically below the top
/// is folded into the top at deallocation time, so an in-use chunk always
/// terminates the walk first.
unsafe fn coalesce_after(chunk: Chunk) {
    unsafe {
        let mut visiting = chunk.next_physical();
        while !visiting.in_use() {
            unlink_by_size(visiting);
            let merged = visiting.prev_size() + visiting.physical_size();
            let after = visiting.next_physical();
            chunk.set_size(merged);
            after.set_prev_size(merged);
            visiting = after;
        }
    }
}

/// Coalesce an unsorted-bin chunk in both directions. The merged result
/// takes over the original chunk's place in the unsorted list and is
/// returned still linked there.
unsafe fn coalesce_unsorted(chunk: Chunk) -> Chunk {
    unsafe {
        let mut result = chunk;
        if let Some(merged) = coalesce_before(chunk) {
            result = merged;
            let anchor = chunk.small_node();
            let node = result.small_node();
            (*node).next = (*anchor).next;
            if !(*anchor).next.is_null() {
                (*(*anchor).next).prev = node;
            }
            (*node).prev = (*anchor).prev;
            if !(*anchor).prev.is_null() {
                (*(*anchor).prev).next = node;
            }
            (*anchor).prev = null_mut();
            (*anchor).next = null_mut();
        }
        coalesce_after(result);
        result
    }
}

/// Fine-grained heap allocator over the low-bump side of a
/// [`PageAllocator`], in the manner of Doug Lea's malloc.
///
/// Free chunks are indexed by four bin families:
/// - `fast` — per-class LIFO stacks for the smallest sizes, reused without
///   splitting or coalescing;
/// - `small` — size-sorted lists, first fit with splitting;
/// - `large` — per-class size chains with one representative per distinct
///   size and a peer chain behind each representative;
/// - `unsorted` — a holding pen for freed chunks; they get one chance to
///   be reused at their original size before the next allocation's sweep
///   coalesces and sorts them.
///
/// The top chunk sits at the high end of the bump and grows or shrinks it
/// by whole pages. Requests whose physical size reaches one page bypass
/// the bins entirely and are served as high-page blocks (flag `M`).
///
/// Bin heads are sentinel nodes inside this struct, and free chunks point
/// back at them: once the first allocation has been made, the allocator
/// must stay at a fixed address (keep it in a `static`, a `Box`, or other
/// pinned storage). The process-global facade does this automatically.
pub struct HeapAllocator {
    top: *mut ChunkHdr,
    fast: [SmallNode; FASTBIN_MAX_ORDER],
    small: [SmallNode; NUM_SMALL_BINS],
    large: [LargeNode; NUM_LARGE_BINS],
    unsorted: SmallNode,
}

// Safety: the heap owns its chunk bookkeeping; access is serialized by the
// caller (single hardware thread, or the global facade's mutex).
unsafe impl Send for HeapAllocator {}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapAllocator {
    #[must_use]
    pub fn new() -> Self {
        const EMPTY_SMALL: SmallNode = SmallNode {
            prev: null_mut(),
            next: null_mut(),
        };
        const EMPTY_LARGE: LargeNode = LargeNode {
            prev: null_mut(),
            next: null_mut(),
            prev_size: null_mut(),
            next_size: null_mut(),
        };
        Self {
            top: null_mut(),
            fast: [EMPTY_SMALL; FASTBIN_MAX_ORDER],
            small: [EMPTY_SMALL; NUM_SMALL_BINS],
            large: [EMPTY_LARGE; NUM_LARGE_BINS],
            unsorted: EMPTY_SMALL,
        }
    }

    fn fast_head(&mut self, class: usize) -> *mut SmallNode {
        &raw mut self.fast[class]
    }

    fn small_head(&mut self, class: usize) -> *mut SmallNode {
        &raw mut self.small[class - FASTBIN_MAX_ORDER]
    }

    fn large_head(&mut self, class: usize) -> *mut LargeNode {
        &raw mut self.large[class - SMALLBIN_MAX_ORDER]
    }

    fn unsorted_head(&mut self) -> *mut SmallNode {
        &raw mut self.unsorted
    }

    // ----------------------------------------------------------------
    // top chunk
    // ----------------------------------------------------------------

    unsafe fn top_chunk(&self) -> Chunk {
        Chunk(self.top)
    }

    /// Lazily install the top chunk over the first low page.
    fn ensure_top(&mut self, pages: &mut PageAllocator) -> bool {
        if !self.top.is_null() {
            return true;
        }
        if !pages.allocate_low_page(1) {
            return false;
        }
        let Some(base) = pages.low_page_break() else {
            return false;
        };
        let top = base.as_ptr().cast::<ChunkHdr>();
        // Safety: the fresh low page belongs to the heap now.
        unsafe {
            (*top).prev_size = 0;
            (*top).size = (PAGE_SIZE - PAYLOAD_OFFSET) as u32 | FLAG_PREV_IN_USE;
        }
        self.top = top;
        true
    }

    /// Extend the top chunk by one page.
    fn increase_top(&mut self, pages: &mut PageAllocator) -> bool {
        if !pages.allocate_low_page(1) {
            return false;
        }
        // Safety: the top exists (ensure_top ran) and the new page is
        // contiguous with its end.
        unsafe {
            let top = self.top_chunk();
            top.set_size(top.size() + PAGE_SIZE);
        }
        true
    }

    /// Give every whole page above the top chunk's header back to the bump.
    unsafe fn shrink_top(&mut self, pages: &mut PageAllocator) {
        let Some(low_top) = pages.low_page_break() else {
            return;
        };
        let top_page = self.top as usize >> PAGE_SHIFT;
        let break_page = low_top.as_ptr() as usize >> PAGE_SHIFT;
        if break_page > top_page {
            let released = pages.free_low_page(break_page - top_page);
            // Safety: the top keeps its header page; only whole pages past
            // it were released.
            unsafe {
                let top = self.top_chunk();
                top.set_size(top.size() - (released << PAGE_SHIFT));
            }
        }
    }

    // ----------------------------------------------------------------
    // bin maintenance
    // ----------------------------------------------------------------

    /// Sort a detached free chunk into its proper bin.
    unsafe fn arrange_chunk(&mut self, chunk: Chunk) {
        unsafe {
            let size = chunk.size();
            if size < (1 << FASTBIN_MAX_ORDER) {
                insert_after(self.fast_head(class_of_size(size)), chunk.small_node());
            } else if size < (1 << SMALLBIN_MAX_ORDER) {
                self.arrange_small(chunk, size);
            } else if size < PAGE_SIZE {
                self.arrange_large(chunk, size);
            } else {
                // Oversized merge results keep circulating through the
                // unsorted bin until a request claims them.
                insert_after(self.unsorted_head(), chunk.small_node());
            }
        }
    }

    /// Insert into the ascending size-sorted small list.
    unsafe fn arrange_small(&mut self, chunk: Chunk, size: usize) {
        let head = self.small_head(class_of_size(size).max(FASTBIN_MAX_ORDER));
        unsafe {
            let mut anchor = head;
            let mut cursor = (*head).next;
            while !cursor.is_null() {
                if Chunk::of_node(cursor).size() >= size {
                    insert_before(cursor, chunk.small_node());
                    return;
                }
                anchor = cursor;
                cursor = (*cursor).next;
            }
            insert_after(anchor, chunk.small_node());
        }
    }

    /// Insert into the two-dimensional large bin: representatives are
    /// sorted ascending along the size chain; same-size chunks queue as
    /// peers directly behind their representative.
    unsafe fn arrange_large(&mut self, chunk: Chunk, size: usize) {
        let head = self.large_head(class_of_size(size).max(SMALLBIN_MAX_ORDER));
        unsafe {
            let node = chunk.large_node();
            let mut anchor = head;
            let mut rep = (*head).next_size;
            while !rep.is_null() {
                let rep_size = Chunk::of_node(rep.cast()).size();
                if rep_size > size {
                    // New representative in front of `rep`.
                    insert_before(rep.cast(), node.cast());
                    (*node).prev_size = anchor;
                    (*node).next_size = rep;
                    (*anchor).next_size = node;
                    (*rep).prev_size = node;
                    return;
                }
                if rep_size == size {
                    // Join the size run as a peer.
                    insert_after(rep.cast(), node.cast());
                    (*node).prev_size = null_mut();
                    (*node).next_size = null_mut();
                    return;
                }
                anchor = rep;
                rep = (*rep).next_size;
            }
            // Largest size in the class: append after the last run.
            let mut tail = anchor.cast::<SmallNode>();
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            insert_after(tail, node.cast());
            (*node).prev_size = anchor;
            (*node).next_size = null_mut();
            (*anchor).next_size = node;
        }
    }

    // ----------------------------------------------------------------
    // splitting
    // ----------------------------------------------------------------

    /// Hand `chunk` (detached, `chunk.size() >= size`) to the user,
    /// splitting off the tail as a new free chunk when it can host a free
    /// node. Remainders below the fast-bin ceiling are trimmed to a power
    /// of two; the slack stays inside the allocated chunk.
    unsafe fn split_use(&mut self, chunk: Chunk, size: usize) -> NonNull<u8> {
        unsafe {
            let available = (chunk.size() - size) & !(CHUNK_ALIGN - 1);
            if available >= physical(MIN_PAYLOAD) {
                let remainder = if available >= physical(1 << FASTBIN_MAX_ORDER) {
                    available - PAYLOAD_OFFSET
                } else {
                    let mut r = 1usize << (FASTBIN_MAX_ORDER - 1);
                    while physical(r) > available {
                        r >>= 1;
                    }
                    r
                };

                let next = chunk.next_physical();
                next.set_prev_size(remainder);
                let split = next.prev_physical();
                (*split.0).size = remainder as u32;
                let used = chunk.size() - physical(remainder);
                split.set_prev_size(used);
                chunk.set_size(used);
                self.arrange_chunk(split);
            }
            chunk.next_physical().set_flag(FLAG_PREV_IN_USE);
            stats::HEAP_BYTES_LIVE.add(chunk.size());
            chunk.payload_nonnull()
        }
    }

    // ----------------------------------------------------------------
    // public surface
    // ----------------------------------------------------------------

    /// Allocate `size` bytes. Returns `None` on a zero-size request or
    /// when the region is exhausted.
    pub fn allocate(&mut self, pages: &mut PageAllocator, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size >= pages.total_frames() << PAGE_SHIFT {
            return None;
        }
        let size = round_request(size);
        let physical_size = physical(size);

        // Page-level request: served whole from the page allocator.
        if physical_size >= PAGE_SIZE {
            let span = physical_size.div_ceil(PAGE_SIZE);
            let order = span.next_power_of_two().trailing_zeros() as usize;
            let page = pages.allocate_high_page(order)?;
            let chunk = Chunk(page.as_ptr().cast());
            // Safety: the block belongs to this chunk now.
            unsafe {
                (*chunk.0).prev_size = 0;
                (*chunk.0).size = ((order as u32) << 2) | FLAG_PAGE_ALLOCATED;
                return Some(chunk.payload_nonnull());
            }
        }

        if !self.ensure_top(pages) {
            return None;
        }

        // Fast bin: one LIFO probe in the exact class, no splitting.
        if size < (1 << FASTBIN_MAX_ORDER) {
            let head = self.fast_head(class_of_size(size));
            // Safety: a non-null head successor is a live free chunk.
            unsafe {
                let node = (*head).next;
                if !node.is_null() {
                    let chunk = Chunk::of_node(node);
                    if chunk.size() >= size {
                        unlink_small(node);
                        chunk.next_physical().set_flag(FLAG_PREV_IN_USE);
                        stats::HEAP_BYTES_LIVE.add(chunk.size());
                        return Some(chunk.payload_nonnull());
                    }
                }
            }
        }

        // Small bins: first fit in the ascending lists, scanning classes
        // upward from the request's own.
        if size < (1 << SMALLBIN_MAX_ORDER) {
            let start = class_of_size(size).max(FASTBIN_MAX_ORDER);
            for class in start..SMALLBIN_MAX_ORDER {
                let head = self.small_head(class);
                // Safety: list nodes are live free chunks.
                unsafe {
                    let mut cursor = (*head).next;
                    while !cursor.is_null() {
                        let chunk = Chunk::of_node(cursor);
                        if chunk.size() >= size {
                            unlink_small(cursor);
                            return Some(self.split_use(chunk, size));
                        }
                        cursor = (*cursor).next;
                    }
                }
            }
        }

        // Large bins: walk the size chain to the first adequate
        // representative, preferring one of its peers so the size-chain
        // skeleton survives.
        {
            let start = class_of_size(size).max(SMALLBIN_MAX_ORDER);
            for class in start..PAGE_SHIFT {
                let head = self.large_head(class);
                // Safety: size-chain nodes are live free chunks.
                unsafe {
                    let mut rep = (*head).next_size;
                    while !rep.is_null() {
                        let rep_chunk = Chunk::of_node(rep.cast());
                        if rep_chunk.size() >= size {
                            let peer = (*rep).next;
                            let chosen = if !peer.is_null() && peer.cast::<LargeNode>() != (*rep).next_size
                            {
                                Chunk::of_node(peer)
                            } else {
                                rep_chunk
                            };
                            unlink_large(chosen.large_node());
                            return Some(self.split_use(chosen, size));
                        }
                        rep = (*rep).next_size;
                    }
                }
            }
        }

        // Unsorted sweep: coalesce every parked chunk, keep the tightest
        // adequate fit, sort the rest into their bins.
        let mut selected: Option<Chunk> = None;
        // Safety: the unsorted list holds live free chunks; `next` is read
        // only after the current chunk's coalescing settled the list.
        unsafe {
            let mut node = self.unsorted.next;
            while !node.is_null() {
                let merged = coalesce_unsorted(Chunk::of_node(node));
                let next = (*merged.small_node()).next;
                unlink_small(merged.small_node());
                if merged.size() >= size {
                    match selected {
                        None => selected = Some(merged),
                        Some(best) if best.size() > merged.size() => {
                            self.arrange_chunk(best);
                            selected = Some(merged);
                        }
                        Some(_) => self.arrange_chunk(merged),
                    }
                } else {
                    self.arrange_chunk(merged);
                }
                node = next;
            }
            if let Some(chunk) = selected {
                return Some(self.split_use(chunk, size));
            }
        }

        // Carve from the top, growing it page by page as needed.
        // Safety: the top chunk exists and is the last chunk of the bump.
        unsafe {
            while self.top_chunk().size() < physical_size {
                if !self.increase_top(pages) {
                    return None;
                }
            }
            let returned = self.top_chunk();
            let remained = returned.size() - physical_size;
            returned.set_size(size);
            let new_top = returned.next_physical();
            (*new_top.0).prev_size = size as u32;
            (*new_top.0).size = remained as u32 | FLAG_PREV_IN_USE;
            self.top = new_top.0;
            stats::HEAP_BYTES_LIVE.add(size);
            Some(returned.payload_nonnull())
        }
    }

    /// Return a block to the allocator.
    ///
    /// Non-page chunks are parked in the unsorted bin without coalescing;
    /// the next allocation's sweep merges them. When the freed chain
    /// reaches the top chunk, it is folded in and whole pages go back to
    /// the bump.
    ///
    /// # Safety
    /// - `ptr` must have been returned by [`Self::allocate`] on this
    ///   allocator (with the same page allocator), and not freed since.
    pub unsafe fn deallocate(&mut self, pages: &mut PageAllocator, ptr: NonNull<u8>) {
        // Safety: per contract, ptr is a live payload pointer.
        unsafe {
            let chunk = Chunk::of_payload(ptr.as_ptr());

            if chunk.page_allocated() {
                let order = chunk.size() >> 2;
                pages.free_high_page(NonNull::new_unchecked(chunk.0.cast()), order);
                return;
            }

            debug_assert!(!self.top.is_null(), "chunk freed into a heap with no top");
            if self.top.is_null() {
                return;
            }
            stats::sub_saturating(&stats::HEAP_BYTES_LIVE, chunk.size());

            // Wipe the link words before queueing.
            let node = chunk.small_node();
            (*node).prev = null_mut();
            (*node).next = null_mut();
            if is_large_range(chunk.size()) {
                let large = chunk.large_node();
                (*large).prev_size = null_mut();
                (*large).next_size = null_mut();
            }

            chunk.next_physical().clear_flag(FLAG_PREV_IN_USE);
            insert_after(self.unsorted_head(), node);

            // Fold a freed chain that reaches the top into the top chunk
            // and give whole pages back to the bump.
            let top = self.top_chunk();
            if !top.prev_in_use() {
                if let Some(merged) = coalesce_before(top) {
                    merged.set_size(merged.size() + top.physical_size());
                    self.top = merged.0;
                    self.shrink_top(pages);
                }
            }
        }
    }
}

fn round_request(size: usize) -> usize {
    size.max(MIN_PAYLOAD).next_multiple_of(CHUNK_ALIGN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testutil::TestRegion;

    fn setup(pages: usize) -> (TestRegion, PageAllocator, Box<HeapAllocator>) {
        let backing = TestRegion::new(pages);
        let pa = PageAllocator::new(backing.region());
        (backing, pa, Box::new(HeapAllocator::new()))
    }

    /// Walk the physical chunk chain from the bump base to the top chunk,
    /// checking the prev-size bookkeeping of every free chunk.
    fn walk_check(heap: &HeapAllocator, pa: &PageAllocator) {
        if heap.top.is_null() {
            return;
        }
        let base = pa.region().base().as_ptr();
        // Safety: Test code; the chain is intact between operations.
        unsafe {
            let mut chunk = Chunk(base.cast());
            while chunk.0 != heap.top {
                let next = chunk.next_physical();
                assert!(
                    next.0 <= heap.top,
                    "chunk at {:p} overran the top chunk",
                    chunk.0
                );
                if !next.prev_in_use() {
                    assert_eq!(next.prev_size(), chunk.size());
                }
                chunk = next;
            }
        }
    }

    #[test]
    fn test_zero_and_oversized_requests_fail() {
        let (_backing, mut pa, mut heap) = setup(16);
        assert!(heap.allocate(&mut pa, 0).is_none());
        assert!(heap.allocate(&mut pa, 16 * PAGE_SIZE).is_none());
        assert!(heap.allocate(&mut pa, usize::MAX).is_none());
        assert_eq!(pa.low_break_pages(), 0);
    }

    #[test]
    fn test_roundtrip_and_replay() {
        // Round-trip law: free(alloc(n)) leaves a state in which the same
        // sequence succeeds again.
        let (_backing, mut pa, mut heap) = setup(16);
        let sizes = [16usize, 200, 48, 1024, 96];
        for _ in 0..3 {
            let ptrs: Vec<_> = sizes
                .iter()
                .map(|&n| heap.allocate(&mut pa, n).expect("alloc"))
                .collect();
            for (ptr, &n) in ptrs.iter().zip(&sizes) {
                // Safety: Test code.
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x5A, n) };
            }
            walk_check(&heap, &pa);
            for ptr in ptrs {
                // Safety: Test code.
                unsafe { heap.deallocate(&mut pa, ptr) };
            }
            walk_check(&heap, &pa);
        }
    }

    #[test]
    fn test_top_chunk_grows_page_by_page() {
        // H2: the first page-filling request installs the top chunk, the
        // second grows it by one page before carving.
        let (_backing, mut pa, mut heap) = setup(16);
        let n = PAGE_SIZE - 2 * PAYLOAD_OFFSET;
        let a = heap.allocate(&mut pa, n).expect("first");
        assert_eq!(pa.low_break_pages(), 1);
        let b = heap.allocate(&mut pa, n).expect("second");
        assert_eq!(pa.low_break_pages(), 2);
        assert_ne!(a, b);
        walk_check(&heap, &pa);
    }

    #[test]
    fn test_unsorted_sweep_coalesces_neighbors() {
        // H3: freeing two physically adjacent chunks and allocating their
        // combined size returns one merged chunk at the first one's address.
        let (_backing, mut pa, mut heap) = setup(16);
        let a = heap.allocate(&mut pa, 32).expect("a");
        let b = heap.allocate(&mut pa, 32).expect("b");
        let c = heap.allocate(&mut pa, 32).expect("c");
        // Safety: Test code.
        unsafe { std::ptr::write_bytes(c.as_ptr(), 0xC3, 32) };

        // Safety: Test code.
        unsafe {
            heap.deallocate(&mut pa, b);
            heap.deallocate(&mut pa, a);
        }

        let merged_size = 32 + PAYLOAD_OFFSET + 32;
        let m = heap.allocate(&mut pa, merged_size).expect("merged");
        assert_eq!(m, a, "the merged chunk must start at a's address");
        // Safety: Test code; the merged payload spans across b.
        unsafe { std::ptr::write_bytes(m.as_ptr(), 0x11, merged_size) };
        // c's bytes must be untouched by the merge.
        // Safety: Test code.
        unsafe {
            for i in 0..32 {
                assert_eq!(c.as_ptr().add(i).read(), 0xC3);
            }
        }
        walk_check(&heap, &pa);
    }

    #[test]
    fn test_fast_bin_lifo_reuse() {
        let (_backing, mut pa, mut heap) = setup(16);
        let a = heap.allocate(&mut pa, 16).expect("a");
        let _g1 = heap.allocate(&mut pa, 16).expect("g1");
        let b = heap.allocate(&mut pa, 16).expect("b");
        let _g2 = heap.allocate(&mut pa, 16).expect("g2");

        // Safety: Test code.
        unsafe {
            heap.deallocate(&mut pa, a);
            heap.deallocate(&mut pa, b);
        }
        // This sweep sorts a and b into their fast bin (they cannot merge:
        // the guards are live) and carves the request from the top.
        let _big = heap.allocate(&mut pa, 200).expect("sweep trigger");

        // LIFO: a was arranged last, so it comes back first.
        let r1 = heap.allocate(&mut pa, 16).expect("r1");
        let r2 = heap.allocate(&mut pa, 16).expect("r2");
        assert_eq!(r1, a);
        assert_eq!(r2, b);
        walk_check(&heap, &pa);
    }

    #[test]
    fn test_large_bin_prefers_peers_over_representative() {
        // H6: with three equal-size chunks in a large bin, allocations use
        // the peers first and the representative last.
        let (_backing, mut pa, mut heap) = setup(32);
        let x1 = heap.allocate(&mut pa, 1024).expect("x1");
        let _g1 = heap.allocate(&mut pa, 16).expect("g1");
        let x2 = heap.allocate(&mut pa, 1024).expect("x2");
        let _g2 = heap.allocate(&mut pa, 16).expect("g2");
        let x3 = heap.allocate(&mut pa, 1024).expect("x3");
        let _g3 = heap.allocate(&mut pa, 16).expect("g3");

        // Safety: Test code.
        unsafe {
            heap.deallocate(&mut pa, x1);
            heap.deallocate(&mut pa, x2);
            heap.deallocate(&mut pa, x3);
        }
        // The sweep sorts all three into the large bin: x3 becomes the
        // representative (processed first), x1 and x2 queue as its peers.
        let _big = heap.allocate(&mut pa, 1500).expect("sweep trigger");

        let m1 = heap.allocate(&mut pa, 1024).expect("m1");
        let m2 = heap.allocate(&mut pa, 1024).expect("m2");
        let m3 = heap.allocate(&mut pa, 1024).expect("m3");
        assert_eq!(m1, x1, "first allocation takes the newest peer");
        assert_eq!(m2, x2, "second allocation takes the remaining peer");
        assert_eq!(m3, x3, "the representative goes last");
        walk_check(&heap, &pa);
    }

    #[test]
    fn test_page_sized_physical_request_uses_high_pages() {
        // Boundary: physical size exactly one page bypasses the bump.
        let (_backing, mut pa, mut heap) = setup(16);
        let n = PAGE_SIZE - PAYLOAD_OFFSET;
        let p = heap.allocate(&mut pa, n).expect("page chunk");
        assert_eq!(pa.low_break_pages(), 0, "no top chunk was created");
        assert_eq!(pa.high_break_pages(), 1);
        // Safety: Test code.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0x7E, n) };
        // Safety: Test code.
        unsafe { heap.deallocate(&mut pa, p) };
        assert_eq!(pa.high_break_pages(), 0);
    }

    #[test]
    fn test_multi_page_chunk_roundtrip() {
        let (_backing, mut pa, mut heap) = setup(16);
        let n = 3 * PAGE_SIZE;
        let p = heap.allocate(&mut pa, n).expect("multi-page chunk");
        // Physical size needs four pages, so an order-2 block serves it.
        assert_eq!(pa.high_break_pages(), 4);
        // Safety: Test code; the block is contiguous.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0x42, n) };
        // Safety: Test code.
        unsafe { heap.deallocate(&mut pa, p) };
        assert_eq!(pa.high_break_pages(), 0);
    }

    #[test]
    fn test_split_skips_sub_minimal_remainder() {
        // Boundary: a remainder too small for a free node stays inside the
        // allocated chunk.
        let (_backing, mut pa, mut heap) = setup(16);
        let a = heap.allocate(&mut pa, 80).expect("a");
        let _guard = heap.allocate(&mut pa, 16).expect("guard");
        // Safety: Test code.
        unsafe { heap.deallocate(&mut pa, a) };
        // Sort the 80-byte chunk into its small bin.
        let _trigger = heap.allocate(&mut pa, 200).expect("trigger");

        let m = heap
            .allocate(&mut pa, 80 - CHUNK_ALIGN)
            .expect("nearly exact fit");
        assert_eq!(m, a);
        // Safety: Test code; the whole 80 bytes were handed out.
        unsafe {
            assert_eq!(Chunk::of_payload(m.as_ptr()).size(), 80);
        }
        walk_check(&heap, &pa);
    }

    #[test]
    fn test_top_shrinks_after_free() {
        // Freeing the chunk below the top folds it in and returns whole
        // pages to the bump.
        let (_backing, mut pa, mut heap) = setup(16);
        let a = heap.allocate(&mut pa, 1024).expect("a");
        let b = heap.allocate(&mut pa, 1024).expect("b");
        assert_eq!(pa.low_break_pages(), 2, "b grew the top by one page");
        // Safety: Test code.
        unsafe { heap.deallocate(&mut pa, b) };
        assert_eq!(
            pa.low_break_pages(),
            1,
            "the bump shrinks back to the top chunk's header page"
        );
        // Safety: Test code.
        unsafe { heap.deallocate(&mut pa, a) };
        assert_eq!(pa.low_break_pages(), 1, "the top keeps its header page");
        walk_check(&heap, &pa);
    }

    #[test]
    fn test_exhaustion_returns_none_then_recovers() {
        let (_backing, mut pa, mut heap) = setup(4);
        // Two pages to the high side.
        let big = heap.allocate(&mut pa, PAGE_SIZE + 64).expect("high block");
        assert_eq!(pa.high_break_pages(), 2);
        // The rest of the budget to the bump.
        let a = heap.allocate(&mut pa, 1024).expect("first chunk");
        let b = heap.allocate(&mut pa, 1500).expect("second chunk");
        assert_eq!(pa.low_break_pages() + pa.high_break_pages(), 4);
        assert!(
            heap.allocate(&mut pa, 1800).is_none(),
            "no budget left to grow the top"
        );

        // Safety: Test code.
        unsafe { heap.deallocate(&mut pa, big) };
        let c = heap.allocate(&mut pa, 1800).expect("budget freed");
        // Safety: Test code.
        unsafe {
            heap.deallocate(&mut pa, a);
            heap.deallocate(&mut pa, b);
            heap.deallocate(&mut pa, c);
        }
        walk_check(&heap, &pa);
    }

    #[test]
    fn test_small_bin_first_fit_ascending() {
        // A smaller freed chunk is preferred over a larger one of the same
        // class, wherever it sits in the list.
        let (_backing, mut pa, mut heap) = setup(16);
        let big = heap.allocate(&mut pa, 120).expect("big");
        let _g1 = heap.allocate(&mut pa, 16).expect("g1");
        let small = heap.allocate(&mut pa, 96).expect("small");
        let _g2 = heap.allocate(&mut pa, 16).expect("g2");

        // Safety: Test code.
        unsafe {
            heap.deallocate(&mut pa, small);
            heap.deallocate(&mut pa, big);
        }
        let _trigger = heap.allocate(&mut pa, 300).expect("trigger");

        // Both now sit in small class 6 (65..128); 96 must win for a
        // 72-byte request even though 120 was freed later.
        let m = heap.allocate(&mut pa, 72).expect("m");
        assert_eq!(m, small);
        walk_check(&heap, &pa);
    }
}
