//! Kernel-wide tunables
//!
//! Compile-time parameters for the process table, the physical frame arena
//! and the user address-space layout, plus the polling knobs consumed by
//! the shared-log demo tests.

use static_assertions::{const_assert, const_assert_eq};

/// Maximum number of processes
pub const NPROC: usize = 64;

/// Number of physical frames in the arena
pub const NFRAME: usize = 1024;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// One past the highest user virtual address (Sv39-style layout)
pub const MAXVA: usize = 1 << 38;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);
const_assert_eq!(MAXVA % PAGE_SIZE, 0);
// The arena must fit below the user address ceiling when identity-counted in pages.
const_assert!(NFRAME * PAGE_SIZE < MAXVA);

/// Polling parameters for busy-wait consumers of shared memory.
///
/// Loops that poll a shared word take these explicitly so tests can run
/// them deterministically instead of relying on baked-in constants.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Ticks to advance the clock between successive polls
    pub interval_ticks: u64,
    /// Consecutive empty polls tolerated before the consumer gives up
    pub max_idle_polls: u32,
}

impl PollConfig {
    pub const fn new(interval_ticks: u64, max_idle_polls: u32) -> Self {
        Self {
            interval_ticks,
            max_idle_polls,
        }
    }
}
