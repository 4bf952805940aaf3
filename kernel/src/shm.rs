//! Shared page mapping
//!
//! Lets one process expose a range of its address space so that others can
//! alias the same physical frames, and revokes the aliases safely. The
//! manager never copies page contents: it resolves the source range to
//! frame indices, installs matching entries in the destination table with
//! the `PTE_S` bit set, and bumps each frame's reference count so the
//! frames survive the source's exit for as long as any alias remains.
//!
//! Both operations are whole-or-nothing: a failure mid-walk rolls back
//! every entry installed so far and leaves no partial state behind.

extern crate alloc;

use alloc::vec::Vec;

use log::debug;

use crate::error::{KernelError, Result};
use crate::mm::{self, Pfn, is_page_aligned, page_round_up};
use crate::params::{MAXVA, PAGE_SIZE};
use crate::process::{PROC, Pid, Proc};
use crate::vm::{MapPerm, flags};

/// One active shared mapping held by a destination process.
///
/// `dst_va` is page-aligned and `length` is a positive multiple of the page
/// size; the range never overlaps another live mapping in the holder's
/// address space.
#[derive(Debug, Clone)]
pub struct SharedMapping {
    /// Pid of the process the range was mapped from
    pub owner_pid: Pid,
    /// Base of the range in the owner's address space
    pub src_va: usize,
    /// Base of the alias in the holder's address space
    pub dst_va: usize,
    /// Length in bytes (whole pages)
    pub length: usize,
    /// Permissions carried over from the owner's entries
    pub perm: MapPerm,
}

/// Map `size` bytes starting at `src_va` in `src_pid`'s address space into
/// `dst_pid`'s address space. Returns the chosen destination base address.
///
/// `src_va` must be page-aligned; `size` need not be and is rounded up to
/// whole pages. The destination range is placed immediately above the
/// destination's current size, which grows to cover it (`getprocsize`
/// stays meaningful). Self-sharing is permitted and installs a second
/// alias within the one address space.
pub fn map_shared_pages(src_pid: Pid, dst_pid: Pid, src_va: usize, size: usize) -> Result<usize> {
    if size == 0 {
        return Err(KernelError::InvalidArgument);
    }
    if size > MAXVA || src_va >= MAXVA {
        return Err(KernelError::BadRange);
    }
    if !is_page_aligned(src_va) {
        return Err(KernelError::BadAddress);
    }

    let src_idx = PROC.lookup(src_pid).ok_or(KernelError::NoSuchProcess)?;
    let dst_idx = PROC.lookup(dst_pid).ok_or(KernelError::NoSuchProcess)?;

    if src_idx == dst_idx {
        // Self-share: one lock, source and destination are the same record
        let mut p = PROC.slot(src_idx).lock();
        if !p.is_live() || p.pid != src_pid {
            return Err(KernelError::NoSuchProcess);
        }
        let pages = collect_source_frames(&p, src_va, size)?;
        install_alias(&mut p, src_pid, src_va, &pages)
    } else {
        let (src, mut dst) = PROC.lock_pair((src_pid, src_idx), (dst_pid, dst_idx));
        if !src.is_live() || src.pid != src_pid || !dst.is_live() || dst.pid != dst_pid {
            return Err(KernelError::NoSuchProcess);
        }
        let pages = collect_source_frames(&src, src_va, size)?;
        install_alias(&mut dst, src_pid, src_va, &pages)
    }
}

/// Remove a shared mapping previously installed for `pid`.
///
/// The range must exactly match a recorded mapping: `addr` its base and
/// `size` (rounded up to whole pages) its length. Sub-range requests are
/// rejected. Frames lose one reference each and return to the free list
/// only when no other table points at them.
pub fn unmap_shared_pages(pid: Pid, addr: usize, size: usize) -> Result<()> {
    if size == 0 {
        return Err(KernelError::InvalidArgument);
    }
    if size > MAXVA || addr >= MAXVA {
        return Err(KernelError::BadRange);
    }
    if !is_page_aligned(addr) {
        return Err(KernelError::BadAddress);
    }

    let idx = PROC.lookup(pid).ok_or(KernelError::NoSuchProcess)?;
    let mut p = PROC.slot(idx).lock();
    if !p.is_live() || p.pid != pid {
        return Err(KernelError::NoSuchProcess);
    }

    let len = page_round_up(size);
    let pos = p
        .shared_mappings
        .iter()
        .position(|m| m.dst_va == addr && m.length == len)
        .ok_or(KernelError::MappingNotFound)?;
    let mapping = p.shared_mappings.remove(pos);
    drop_mapping(&mut p, &mapping);
    Ok(())
}

/// Release every shared mapping a process holds. Called from the exit path
/// with the process lock already held, before its own memory is torn down.
pub(crate) fn release_all(p: &mut Proc) {
    while let Some(mapping) = p.shared_mappings.pop() {
        drop_mapping(p, &mapping);
    }
}

/// Walk the source range one page at a time, resolving each page to its
/// backing frame and current permission bits. Any hole fails the whole
/// operation before anything is installed.
fn collect_source_frames(src: &Proc, src_va: usize, size: usize) -> Result<Vec<(Pfn, usize)>> {
    let end = src_va.checked_add(size).ok_or(KernelError::BadRange)?;
    if end > src.sz {
        return Err(KernelError::BadRange);
    }

    let len = page_round_up(size);
    let mut pages = Vec::with_capacity(len / PAGE_SIZE);
    let mut va = src_va;
    while va < src_va + len {
        let (pfn, fl) = src
            .pagetable
            .translate(va)
            .ok_or(KernelError::BadRange)?;
        pages.push((pfn, fl));
        va += PAGE_SIZE;
    }
    Ok(pages)
}

/// Install one alias entry per source page in the destination table,
/// bumping each frame's reference count. The range goes immediately above
/// the destination's current size. Rolls back on any failure.
fn install_alias(
    dst: &mut Proc,
    owner_pid: Pid,
    src_va: usize,
    pages: &[(Pfn, usize)],
) -> Result<usize> {
    let len = pages.len() * PAGE_SIZE;
    let dst_base = page_round_up(dst.sz);
    let dst_end = dst_base.checked_add(len).ok_or(KernelError::OutOfMemory)?;
    if dst_end > MAXVA {
        return Err(KernelError::OutOfMemory);
    }

    for (i, &(pfn, fl)) in pages.iter().enumerate() {
        let va = dst_base + i * PAGE_SIZE;
        let perm = (fl & !flags::PTE_V) | flags::PTE_S;
        if let Err(e) = dst.pagetable.map_page(va, pfn, perm) {
            for j in 0..i {
                if let Ok((installed, _)) = dst.pagetable.unmap_page(dst_base + j * PAGE_SIZE) {
                    mm::kfree(installed);
                }
            }
            return Err(e);
        }
        mm::frame_incref(pfn);
    }

    dst.sz = dst_end;
    let perm = MapPerm::from_bits_truncate(pages[0].1);
    dst.shared_mappings.push(SharedMapping {
        owner_pid,
        src_va,
        dst_va: dst_base,
        length: len,
        perm,
    });
    debug!(
        "shm: pid {} mapped {} pages from pid {} at {:#x}",
        dst.pid,
        pages.len(),
        owner_pid,
        dst_base
    );
    Ok(dst_base)
}

/// Remove one recorded mapping's entries and drop the frame references.
/// The record is trusted; a missing or non-shared entry under it means the
/// bookkeeping was corrupted.
fn drop_mapping(p: &mut Proc, mapping: &SharedMapping) {
    let mut va = mapping.dst_va;
    while va < mapping.dst_va + mapping.length {
        match p.pagetable.unmap_page(va) {
            Ok((pfn, fl)) => {
                debug_assert_ne!(fl & flags::PTE_S, 0, "shm: recorded entry not shared");
                mm::kfree(pfn);
            }
            Err(_) => panic!("shm: recorded mapping missing page at {va:#x}"),
        }
        va += PAGE_SIZE;
    }

    // Shrink the image back when the alias sat at the very top, the way
    // the placement policy put it there.
    if mapping.dst_va + mapping.length == page_round_up(p.sz) {
        p.sz = mapping.dst_va;
    }
    debug!(
        "shm: pid {} unmapped {} bytes at {:#x}",
        p.pid, mapping.length, mapping.dst_va
    );
}
