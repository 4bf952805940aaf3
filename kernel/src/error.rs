//! Kernel error types
//!
//! Every recoverable failure in the memory-sharing paths is reported as a
//! `KernelError`. The syscall layer collapses these to a single sentinel
//! value; inside the kernel the variants stay distinct so callers and tests
//! can tell rejection classes apart. Invariant violations (for example a
//! frame reference count underflow) are kernel bugs and panic instead.

use core::fmt;

/// Result alias used throughout the kernel
pub type Result<T> = core::result::Result<T, KernelError>;

/// Recoverable kernel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// PID does not resolve to a live process (unknown or already exited)
    NoSuchProcess,
    /// Address is not page-aligned
    BadAddress,
    /// Argument out of range (zero size)
    InvalidArgument,
    /// Virtual range has a hole or exceeds the process's mapped size
    BadRange,
    /// No free frames, or no destination virtual range available
    OutOfMemory,
    /// Unmap request does not match a recorded shared mapping
    MappingNotFound,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::NoSuchProcess => "no such process",
            KernelError::BadAddress => "address not page-aligned",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::BadRange => "virtual range not fully mapped",
            KernelError::OutOfMemory => "out of memory",
            KernelError::MappingNotFound => "no matching shared mapping",
        };
        f.write_str(msg)
    }
}
