//! Virtual memory management
//!
//! Per-process page tables. A page table maps virtual page numbers to PTEs;
//! a PTE packs a frame index (arena id) and permission bits. Entries never
//! store pointers into the frame bank, so cross-process aliases stay
//! comparable and a table can be torn down without touching frame memory.
//!
//! Software bit `PTE_S` marks an entry as a shared alias installed by the
//! shared-mapping manager.

extern crate alloc;

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::error::{KernelError, Result};
use crate::mm::{self, Pfn, is_page_aligned, page_round_down, page_round_up};
use crate::params::{MAXVA, PAGE_SHIFT, PAGE_SIZE};

/// Page table entry flags
pub mod flags {
    pub const PTE_V: usize = 1 << 0; // Valid
    pub const PTE_R: usize = 1 << 1; // Readable
    pub const PTE_W: usize = 1 << 2; // Writable
    pub const PTE_X: usize = 1 << 3; // Executable
    pub const PTE_U: usize = 1 << 4; // User accessible

    // Software-defined flag (reserved bits 8-9)
    pub const PTE_S: usize = 1 << 8; // Shared alias (software flag)
}

/// Low bits of a PTE hold the flags; the frame index sits above them
pub const PTE_FLAG_MASK: usize = 0x3FF;
pub const PTE_PFN_SHIFT: usize = 10;

/// Pack a frame index and permission bits into a PTE
#[inline]
pub const fn pfn_to_pte(pfn: Pfn, perm: usize) -> usize {
    (pfn << PTE_PFN_SHIFT) | (perm & PTE_FLAG_MASK) | flags::PTE_V
}

/// Frame index of a PTE
#[inline]
pub const fn pte_to_pfn(pte: usize) -> Pfn {
    pte >> PTE_PFN_SHIFT
}

/// Flag bits of a PTE
#[inline]
pub const fn pte_flags(pte: usize) -> usize {
    pte & PTE_FLAG_MASK
}

bitflags! {
    /// User-facing permission set for new mappings
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapPerm: usize {
        const READ = flags::PTE_R;
        const WRITE = flags::PTE_W;
        const EXEC = flags::PTE_X;
        const USER = flags::PTE_U;
    }
}

/// Per-process page table
///
/// Entries are kept ordered by virtual page number so range walks come out
/// in address order.
pub struct PageTable {
    entries: BTreeMap<usize, usize>,
}

#[inline]
const fn vpn(va: usize) -> usize {
    va >> PAGE_SHIFT
}

impl PageTable {
    /// Create a new empty page table
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Install a mapping for one page.
    /// Fails when the page is already mapped or lies outside user space.
    pub fn map_page(&mut self, va: usize, pfn: Pfn, perm: usize) -> Result<()> {
        debug_assert!(is_page_aligned(va), "vm: map_page of unaligned {va:#x}");
        if va >= MAXVA {
            return Err(KernelError::OutOfMemory);
        }
        if self.entries.contains_key(&vpn(va)) {
            // Already mapped
            return Err(KernelError::OutOfMemory);
        }
        self.entries.insert(vpn(va), pfn_to_pte(pfn, perm));
        Ok(())
    }

    /// Remove the mapping for one page, returning the frame it pointed at
    /// and the entry's flag bits. The frame's reference count is untouched;
    /// the caller decides whether to drop a reference.
    pub fn unmap_page(&mut self, va: usize) -> Result<(Pfn, usize)> {
        debug_assert!(is_page_aligned(va), "vm: unmap_page of unaligned {va:#x}");
        let pte = self
            .entries
            .remove(&vpn(va))
            .ok_or(KernelError::MappingNotFound)?;
        Ok((pte_to_pfn(pte), pte_flags(pte)))
    }

    /// Resolve a page-aligned virtual address to (frame, flags)
    pub fn translate(&self, va: usize) -> Option<(Pfn, usize)> {
        let pte = *self.entries.get(&vpn(va))?;
        Some((pte_to_pfn(pte), pte_flags(pte)))
    }

    /// Whether the page containing `va` is mapped
    pub fn is_mapped(&self, va: usize) -> bool {
        self.entries.contains_key(&vpn(va))
    }

    /// Number of mapped pages
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve any user virtual address to a raw pointer into its frame
pub fn resolve(pt: &PageTable, va: usize) -> Option<*mut u8> {
    let (pfn, _) = pt.translate(page_round_down(va))?;
    let offset = va & (PAGE_SIZE - 1);
    Some(unsafe { mm::frame_ptr(pfn).add(offset) })
}

// ============================================================================
// Address-space growth and teardown
// ============================================================================

/// Grow a process image from `oldsz` to `newsz`, allocating and mapping
/// fresh zeroed frames. Either the whole range is mapped or the table is
/// left exactly as it was.
pub fn uvmalloc(pt: &mut PageTable, oldsz: usize, newsz: usize) -> Result<usize> {
    if newsz <= oldsz {
        return Ok(oldsz);
    }
    if newsz > MAXVA {
        return Err(KernelError::OutOfMemory);
    }

    let start = page_round_up(oldsz);
    let end = page_round_up(newsz);
    let mut va = start;
    while va < end {
        let Some(pfn) = mm::kalloc() else {
            uvmunmap(pt, start, (va - start) / PAGE_SIZE);
            return Err(KernelError::OutOfMemory);
        };
        let perm = flags::PTE_R | flags::PTE_W | flags::PTE_U;
        if let Err(e) = pt.map_page(va, pfn, perm) {
            mm::kfree(pfn);
            uvmunmap(pt, start, (va - start) / PAGE_SIZE);
            return Err(e);
        }
        va += PAGE_SIZE;
    }
    Ok(newsz)
}

/// Unmap `npages` starting at `va`, dropping one frame reference per page
pub fn uvmunmap(pt: &mut PageTable, va: usize, npages: usize) {
    for i in 0..npages {
        if let Ok((pfn, _)) = pt.unmap_page(va + i * PAGE_SIZE) {
            mm::kfree(pfn);
        }
    }
}

/// Tear down an entire address space.
///
/// Drops one reference per remaining entry. Frames still referenced from
/// other page tables (surviving sharers of this process's memory) stay
/// allocated; everything else returns to the free list.
pub fn uvmfree(pt: &mut PageTable) {
    let ptes: alloc::vec::Vec<usize> = pt.entries.values().copied().collect();
    pt.entries.clear();
    for pte in ptes {
        mm::kfree(pte_to_pfn(pte));
    }
}

// ============================================================================
// Kernel/user copies
// ============================================================================

/// Copy data from kernel to user space, walking one page at a time.
///
/// # Safety
/// The caller must ensure no other context mutates the destination range
/// concurrently without synchronization.
pub unsafe fn copyout(pt: &PageTable, dstva: usize, src: &[u8]) -> Result<()> {
    let mut copied = 0;
    while copied < src.len() {
        let va = dstva + copied;
        let ptr = resolve(pt, va).ok_or(KernelError::BadRange)?;
        let page_left = PAGE_SIZE - (va & (PAGE_SIZE - 1));
        let n = page_left.min(src.len() - copied);
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr().add(copied), ptr, n);
        }
        copied += n;
    }
    Ok(())
}

/// Copy data from user space to kernel, walking one page at a time.
///
/// # Safety
/// The caller must ensure no other context mutates the source range
/// concurrently without synchronization.
pub unsafe fn copyin(pt: &PageTable, dst: &mut [u8], srcva: usize) -> Result<()> {
    let mut copied = 0;
    while copied < dst.len() {
        let va = srcva + copied;
        let ptr = resolve(pt, va).ok_or(KernelError::BadRange)?;
        let page_left = PAGE_SIZE - (va & (PAGE_SIZE - 1));
        let n = page_left.min(dst.len() - copied);
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr().add(copied), n);
        }
        copied += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn map_translate_unmap_roundtrip() {
        crate::init();
        let mut pt = PageTable::new();
        let pfn = mm::kalloc().unwrap();

        pt.map_page(3 * PAGE_SIZE, pfn, flags::PTE_R | flags::PTE_W)
            .unwrap();
        assert_eq!(
            pt.translate(3 * PAGE_SIZE),
            Some((pfn, flags::PTE_V | flags::PTE_R | flags::PTE_W))
        );
        assert!(pt.translate(4 * PAGE_SIZE).is_none());

        // Double-map of the same page is rejected
        assert_eq!(
            pt.map_page(3 * PAGE_SIZE, pfn, flags::PTE_R),
            Err(KernelError::OutOfMemory)
        );

        let (got, fl) = pt.unmap_page(3 * PAGE_SIZE).unwrap();
        assert_eq!(got, pfn);
        assert_ne!(fl & flags::PTE_W, 0);
        assert_eq!(pt.mapped_pages(), 0);
        mm::kfree(pfn);
    }

    #[test]
    fn uvmalloc_then_uvmfree_releases_frames() {
        crate::init();
        let mut pt = PageTable::new();
        let sz = uvmalloc(&mut pt, 0, 3 * PAGE_SIZE + 5).unwrap();
        assert_eq!(sz, 3 * PAGE_SIZE + 5);
        assert_eq!(pt.mapped_pages(), 4);

        let frames: alloc::vec::Vec<Pfn> = (0..4)
            .map(|i| pt.translate(i * PAGE_SIZE).unwrap().0)
            .collect();
        for &pfn in &frames {
            assert_eq!(mm::frame_refcount(pfn), 1);
        }

        uvmfree(&mut pt);
        assert_eq!(pt.mapped_pages(), 0);
        for &pfn in &frames {
            assert_eq!(mm::frame_refcount(pfn), 0);
        }
    }

    #[test]
    fn copyout_copyin_cross_page_boundary() {
        crate::init();
        let mut pt = PageTable::new();
        uvmalloc(&mut pt, 0, 2 * PAGE_SIZE).unwrap();

        let msg = b"straddles a page boundary";
        let base = PAGE_SIZE - 7;
        unsafe { copyout(&pt, base, msg).unwrap() };

        let mut back = [0u8; 25];
        unsafe { copyin(&pt, &mut back, base).unwrap() };
        assert_eq!(&back, msg);

        uvmfree(&mut pt);
    }

    #[test]
    fn copyout_past_mapped_range_fails() {
        crate::init();
        let mut pt = PageTable::new();
        uvmalloc(&mut pt, 0, PAGE_SIZE).unwrap();

        let err = unsafe { copyout(&pt, PAGE_SIZE - 2, b"xxxx") };
        assert_eq!(err, Err(KernelError::BadRange));

        uvmfree(&mut pt);
    }

    proptest! {
        #[test]
        fn pte_pack_unpack_roundtrip(pfn in 0usize..crate::params::NFRAME, perm in 0usize..=PTE_FLAG_MASK) {
            let pte = pfn_to_pte(pfn, perm);
            prop_assert_eq!(pte_to_pfn(pte), pfn);
            prop_assert_eq!(pte_flags(pte) & !flags::PTE_V, perm & !flags::PTE_V);
            prop_assert_ne!(pte_flags(pte) & flags::PTE_V, 0);
        }

        #[test]
        fn rounding_brackets_address(addr in 0usize..(usize::MAX / 2)) {
            let down = page_round_down(addr);
            let up = page_round_up(addr);
            prop_assert!(down <= addr);
            prop_assert!(up >= addr);
            prop_assert!(up - down < 2 * PAGE_SIZE);
            prop_assert!(is_page_aligned(down) && is_page_aligned(up));
        }
    }
}
