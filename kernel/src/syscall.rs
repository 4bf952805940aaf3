//! System call surface
//!
//! Thin wrappers over the kernel operations, consuming already-marshalled
//! integer arguments (register decoding happens in the trap path, outside
//! this crate). No structured error codes cross this boundary: every
//! failure collapses to the single sentinel `SYS_FAIL`, and a sentinel
//! return always means the operation did not happen — never a partial
//! effect.

use log::warn;

use crate::process::{PROC, Pid};
use crate::{shm, time};

/// Sentinel returned for any failed system call
pub const SYS_FAIL: u64 = u64::MAX;

/// Map `size` bytes of `src_pid`'s memory at `src_va` into `dst_pid`'s
/// address space. Returns the destination base address.
pub fn sys_map_shared_pages(src_pid: Pid, dst_pid: Pid, src_va: usize, size: usize) -> u64 {
    match shm::map_shared_pages(src_pid, dst_pid, src_va, size) {
        Ok(dst_va) => dst_va as u64,
        Err(e) => {
            warn!("syscall: map_shared_pages({src_pid}, {dst_pid}, {src_va:#x}, {size}): {e}");
            SYS_FAIL
        }
    }
}

/// Remove the shared mapping at `addr` from `pid`'s address space
pub fn sys_unmap_shared_pages(pid: Pid, addr: usize, size: usize) -> u64 {
    match shm::unmap_shared_pages(pid, addr, size) {
        Ok(()) => 0,
        Err(e) => {
            warn!("syscall: unmap_shared_pages({pid}, {addr:#x}, {size}): {e}");
            SYS_FAIL
        }
    }
}

/// Current mapped size of a process, in bytes
pub fn sys_getprocsize(pid: Pid) -> u64 {
    match PROC.size_of(pid) {
        Ok(sz) => sz as u64,
        Err(_) => SYS_FAIL,
    }
}

/// Clock tick interrupts since boot
pub fn sys_uptime() -> u64 {
    time::get_ticks()
}
