//! Teaching kernel core: shared-page mapping
//!
//! A small Unix-like kernel's memory-sharing subsystem, built around three
//! pieces of state: a physical frame arena with per-frame reference counts
//! (`mm`), per-process page tables storing frame indices (`vm`), and a
//! fixed process table with per-slot locks (`process`). The shared-mapping
//! manager (`shm`) ties them together so one process can expose a range of
//! its memory to others without copying, and revoke it safely even across
//! process exits.
//!
//! Scheduling, trap handling and the file system live elsewhere; this crate
//! exposes the syscall-shaped operations (`syscall`) that those layers
//! dispatch into.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod mm;
pub mod params;
pub mod process;
pub mod shm;
pub mod sync;
pub mod syscall;
pub mod time;
pub mod vm;

use sync::Once;

static BOOT: Once<()> = Once::new();

/// One-shot kernel initialization: carve the frame arena, start the clock,
/// set up the process table. Safe to call more than once.
pub fn init() {
    BOOT.call_once(|| {
        mm::init();
        time::init();
        process::PROC.init();
    });
}
