//! Global memory management: the PMM and heap instances, the global
//! allocator, and the memory report.

use muon_core::sync::SpinLock;
use muon_mm::PAGE_SIZE;
use muon_mm::heap::BlockAllocator;
use muon_mm::pmm::FrameFreeList;
use muon_mm::report::MemoryReport;

use crate::arch::interrupts;
use crate::boot::{BootInfo, MemoryRegionKind};
use crate::config;

static PMM: SpinLock<FrameFreeList> = SpinLock::new(FrameFreeList::new());
static HEAP: SpinLock<BlockAllocator> = SpinLock::new(BlockAllocator::new());

/// Builds the frame free list from the boot memory map and seeds the heap.
///
/// # Panics
///
/// Panics when the map has no usable memory for the initial heap.
pub fn init(boot_info: &impl BootInfo) {
    {
        let mut pmm = PMM.lock();
        for region in boot_info.memory_map() {
            if region.kind == MemoryRegionKind::Usable {
                // SAFETY: The loader hands over these regions exclusively;
                // the kernel runs identity-mapped.
                unsafe { pmm.add_region(region.start as usize, region.pages as usize) };
            }
        }
        let stats = pmm.stats();
        muon_core::kinfo!(
            "mm: {} frames ({} KB) usable",
            stats.total_pages,
            stats.total_pages * 4
        );
    }

    let (base, size) =
        alloc_frame_run(config::HEAP_INITIAL_PAGES).expect("no memory for the kernel heap");
    let mut heap = HEAP.lock();
    // SAFETY: The run is page-aligned, contiguous, and exclusively ours.
    unsafe { heap.init(base, size) };
    heap.set_grow_fn(grow_heap);
    muon_core::kinfo!("mm: heap at {base:#x}, {size} bytes");
}

/// Pops `pages` frames and returns the contiguous run they form.
///
/// Consecutive pops from a fresh free list descend through a region, so the
/// run spans downward from the first frame. This inherits the free list's
/// caveat: once frees have shuffled the list the frames stop being
/// adjacent, which is why growth steps are taken early and sized
/// generously.
fn alloc_frame_run(pages: usize) -> Option<(usize, usize)> {
    let mut pmm = PMM.lock();
    let first = pmm.alloc_pages(pages).ok()? as usize;
    Some((first - (pages - 1) * PAGE_SIZE, pages * PAGE_SIZE))
}

/// Heap growth callback.
fn grow_heap(min_bytes: usize) -> Option<(usize, usize)> {
    let pages = min_bytes
        .div_ceil(PAGE_SIZE)
        .max(config::HEAP_GROW_MIN_PAGES);
    alloc_frame_run(pages)
}

/// Allocates one zeroed frame for device DMA (identity-mapped).
pub fn dma_alloc_frame() -> Option<*mut u8> {
    interrupts::without(|| PMM.lock().alloc_page().ok())
}

/// Snapshot of both allocators for the `meminfo` command.
pub fn memory_report() -> MemoryReport {
    interrupts::without(|| MemoryReport {
        frames: PMM.lock().stats(),
        heap: HEAP.lock().stats(),
    })
}

// ---------------------------------------------------------------------------
// Global allocator (bare-metal only; hosted builds use std's)
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod global_alloc {
    use core::alloc::{GlobalAlloc, Layout};

    use super::{HEAP, interrupts};

    /// `GlobalAlloc` over the kernel heap.
    ///
    /// The heap aligns to 16 bytes; larger alignments are refused (nothing
    /// in the kernel asks for them). Interrupts are disabled across heap
    /// operations so an interrupt handler can never deadlock against an
    /// interrupted allocation.
    struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if layout.align() > 16 {
                return core::ptr::null_mut();
            }
            interrupts::without(|| HEAP.lock().alloc(layout.size()))
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            // SAFETY: `ptr` came from `alloc` on this heap.
            interrupts::without(|| unsafe { HEAP.lock().free(ptr) });
        }

        unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
            // SAFETY: `ptr` came from `alloc` on this heap.
            interrupts::without(|| unsafe { HEAP.lock().realloc(ptr, new_size) })
        }

        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            if layout.align() > 16 {
                return core::ptr::null_mut();
            }
            interrupts::without(|| HEAP.lock().calloc(1, layout.size()))
        }
    }

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;
}
