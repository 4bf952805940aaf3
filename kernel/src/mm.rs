//! Physical memory management
//! Provides page frame allocation using a free list (like xv6) and per-frame
//! reference counts.
//!
//! Physical memory is a statically carved arena of `NFRAME` frames. Frames
//! are named by index (`Pfn`), never by pointer: page-table entries and
//! shared-mapping records store the index, and the reference count for each
//! frame lives alongside the arena entry. A frame returns to the free list
//! only when its count reaches zero, regardless of which process installed
//! the last mapping to it.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use static_assertions::const_assert_eq;

use crate::params::{NFRAME, PAGE_SIZE, PAGE_SHIFT};
use crate::sync::Mutex;

extern crate alloc;
use alloc::vec::Vec;

/// Page frame number: index of a frame in the physical arena
pub type Pfn = usize;

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Check whether an address sits on a page boundary
#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

// ============================================================================
// Frame arena
// ============================================================================

const BANK_BYTES: usize = NFRAME * PAGE_SIZE;

const_assert_eq!(BANK_BYTES % PAGE_SIZE, 0);

/// Backing storage for all physical frames
#[repr(C, align(4096))]
struct FrameBank(UnsafeCell<[u8; BANK_BYTES]>);

// Safety: frame bytes are handed out through raw pointers; the reference
// counts and page-table discipline serialize who may touch which frame.
unsafe impl Sync for FrameBank {}

static BANK: FrameBank = FrameBank(UnsafeCell::new([0; BANK_BYTES]));

/// One reference count per arena entry. Counts live outside the process
/// locks: a map call mutates the destination's page table while only
/// reading the source's, yet both paths touch the same counters.
static REF_COUNTS: [AtomicU32; NFRAME] = [const { AtomicU32::new(0) }; NFRAME];

/// Free list based frame allocator
struct FrameAllocator {
    free: Vec<Pfn>,
    initialized: bool,
}

static FRAMES: Mutex<FrameAllocator> = Mutex::new(FrameAllocator {
    free: Vec::new(),
    initialized: false,
});

/// Initialize physical memory management
pub fn init() {
    let mut alloc = FRAMES.lock();
    if alloc.initialized {
        return;
    }
    alloc.free.reserve(NFRAME);
    for pfn in (0..NFRAME).rev() {
        alloc.free.push(pfn);
    }
    alloc.initialized = true;
    debug!(
        "mm: {} frames free ({} KB)",
        alloc.free.len(),
        alloc.free.len() * PAGE_SIZE / 1024
    );
}

/// Allocate a single physical frame (4KB), zeroed, with reference count 1.
/// Returns `None` when the arena is exhausted.
pub fn kalloc() -> Option<Pfn> {
    let pfn = FRAMES.lock().free.pop()?;
    unsafe {
        ptr::write_bytes(frame_ptr(pfn), 0, PAGE_SIZE);
    }
    let prev = REF_COUNTS[pfn].swap(1, Ordering::Release);
    debug_assert_eq!(prev, 0, "mm: allocated frame {pfn} had live references");
    Some(pfn)
}

/// Add a reference to an allocated frame.
/// Every page-table entry pointing at the frame holds one reference,
/// the original allocator's own mapping included.
pub fn frame_incref(pfn: Pfn) {
    let prev = REF_COUNTS[pfn].fetch_add(1, Ordering::Relaxed);
    if prev == 0 {
        panic!("mm: incref on free frame {pfn}");
    }
}

/// Drop one reference to a frame, returning it to the free list when the
/// last reference goes away. A count already at zero is a kernel bug.
pub fn kfree(pfn: Pfn) {
    assert!(pfn < NFRAME, "mm: kfree of frame {pfn} out of range");
    let prev = REF_COUNTS[pfn].fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
        panic!("mm: refcount underflow on frame {pfn}");
    }
    if prev == 1 {
        // Last reference gone; scrub the frame before it can be reused
        unsafe {
            ptr::write_bytes(frame_ptr(pfn), 0, PAGE_SIZE);
        }
        FRAMES.lock().free.push(pfn);
    }
}

/// Current reference count of a frame (0 for free frames)
pub fn frame_refcount(pfn: Pfn) -> u32 {
    REF_COUNTS[pfn].load(Ordering::Acquire)
}

/// Raw pointer to the first byte of a frame
pub fn frame_ptr(pfn: Pfn) -> *mut u8 {
    assert!(pfn < NFRAME, "mm: frame index {pfn} out of range");
    let base = BANK.0.get() as *mut u8;
    unsafe { base.add(pfn << PAGE_SHIFT) }
}

/// Number of frames currently on the free list
pub fn free_frames() -> usize {
    FRAMES.lock().free.len()
}
