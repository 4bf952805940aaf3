//! Synchronization primitives
//!
//! The kernel's lock vocabulary, re-exported from `spin` so the rest of the
//! tree spells them the same way. Process records, the pid registry, the
//! frame free list and the tick counter are all guarded by `Mutex`; one-shot
//! boot initialization goes through `Once`.
//!
//! The ordered acquisition of two process locks lives with the process
//! table (`process::ProcTable::lock_pair`), not here.

pub use spin::{Mutex, MutexGuard, Once};
