//! Tick counter
//!
//! Process-wide clock state. The counter is initialized explicitly at boot
//! and only ever touched with its lock held; `clock_tick` is driven by the
//! timer interrupt path (or by tests simulating time).

use crate::sync::Mutex;

/// Global tick counter, guarded by its own lock
static TICKS: Mutex<u64> = Mutex::new(0);

/// Reset the counter at boot
pub fn init() {
    *TICKS.lock() = 0;
}

/// Advance the clock by one tick
pub fn clock_tick() {
    let mut ticks = TICKS.lock();
    *ticks += 1;
}

/// Read the number of ticks since boot
pub fn get_ticks() -> u64 {
    *TICKS.lock()
}
