//! Process management
//!
//! Process records live in a fixed table of `NPROC` slots, each guarded by
//! its own lock. A separate registry resolves live pids to slot indices;
//! pids vanish from the registry the moment a process exits, so stale
//! identifiers resolve to "not found" rather than to a recycled slot.
//!
//! Two-process operations (the shared-mapping manager) acquire both slot
//! locks through `lock_pair`, which imposes a total order on acquisition:
//! ascending pid, regardless of which process is source and which is
//! destination. Release happens in reverse order as the guards drop.

extern crate alloc;

use alloc::vec::Vec;
use core::hash::{BuildHasher, Hasher};

use hashbrown::HashMap;
use log::debug;

use crate::error::{KernelError, Result};
use crate::params::NPROC;
use crate::shm::{self, SharedMapping};
use crate::sync::{Mutex, MutexGuard};
use crate::vm::{self, PageTable};

/// Process ID type
pub type Pid = usize;

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
}

/// Process control block
pub struct Proc {
    pub pid: Pid,
    pub state: ProcState,
    /// Current mapped size of the process image, in bytes
    pub sz: usize,
    pub pagetable: PageTable,
    /// Shared mappings this process holds as a destination
    pub shared_mappings: Vec<SharedMapping>,
}

impl Proc {
    pub const fn new() -> Self {
        Self {
            pid: 0,
            state: ProcState::Unused,
            sz: 0,
            pagetable: PageTable::new(),
            shared_mappings: Vec::new(),
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.state == ProcState::Used
    }
}

// ============================================================================
// Pid registry
// ============================================================================

/// Hasher builder usable in const initializers
#[derive(Clone, Copy, Debug, Default)]
pub struct PidHasherBuilder;

impl BuildHasher for PidHasherBuilder {
    type Hasher = PidHasher;

    fn build_hasher(&self) -> Self::Hasher {
        PidHasher { state: 0 }
    }
}

/// Simple multiplicative hasher for pid keys
#[derive(Clone, Copy, Debug)]
pub struct PidHasher {
    state: u64,
}

impl Hasher for PidHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state = self.state.wrapping_mul(31).wrapping_add(byte as u64);
        }
    }
}

/// Live-pid index plus slot bookkeeping, guarded by one lock.
/// Never held together with a process slot lock.
struct Registry {
    map: HashMap<Pid, usize, PidHasherBuilder>,
    free_slots: Vec<usize>,
    next_pid: Pid,
    initialized: bool,
}

// ============================================================================
// Process table
// ============================================================================

/// Fixed table of process slots with per-slot locks
pub struct ProcTable {
    slots: [Mutex<Proc>; NPROC],
    registry: Mutex<Registry>,
}

/// Global process table
pub static PROC: ProcTable = ProcTable::new();

impl ProcTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { Mutex::new(Proc::new()) }; NPROC],
            registry: Mutex::new(Registry {
                map: HashMap::with_hasher(PidHasherBuilder),
                free_slots: Vec::new(),
                next_pid: 1,
                initialized: false,
            }),
        }
    }

    /// Populate the free-slot list at boot
    pub fn init(&self) {
        let mut reg = self.registry.lock();
        if reg.initialized {
            return;
        }
        reg.free_slots.reserve(NPROC);
        for idx in (0..NPROC).rev() {
            reg.free_slots.push(idx);
        }
        reg.map.reserve(NPROC);
        reg.initialized = true;
    }

    /// Resolve a pid to its slot index; `None` for exited or unknown pids
    pub fn lookup(&self, pid: Pid) -> Option<usize> {
        if pid == 0 {
            return None;
        }
        self.registry.lock().map.get(&pid).copied()
    }

    /// Access a slot's lock by index
    pub fn slot(&self, idx: usize) -> &Mutex<Proc> {
        &self.slots[idx]
    }

    /// Create a new process with an empty address space
    pub fn spawn(&self) -> Result<Pid> {
        let (idx, pid) = {
            let mut reg = self.registry.lock();
            let idx = reg.free_slots.pop().ok_or(KernelError::OutOfMemory)?;
            let pid = reg.next_pid;
            reg.next_pid += 1;
            (idx, pid)
        };

        {
            let mut p = self.slots[idx].lock();
            debug_assert_eq!(p.state, ProcState::Unused);
            p.pid = pid;
            p.state = ProcState::Used;
            p.sz = 0;
        }

        // Publish only once the slot is set up, so a concurrent lookup
        // never observes a half-initialized record.
        self.registry.lock().map.insert(pid, idx);
        debug!("process: spawned pid {pid}");
        Ok(pid)
    }

    /// Grow a process image by `nbytes`, returning the old size (sbrk)
    pub fn grow(&self, pid: Pid, nbytes: usize) -> Result<usize> {
        let idx = self.lookup(pid).ok_or(KernelError::NoSuchProcess)?;
        let mut p = self.slots[idx].lock();
        if !p.is_live() || p.pid != pid {
            return Err(KernelError::NoSuchProcess);
        }
        let oldsz = p.sz;
        let newsz = oldsz
            .checked_add(nbytes)
            .ok_or(KernelError::InvalidArgument)?;
        p.sz = vm::uvmalloc(&mut p.pagetable, oldsz, newsz)?;
        Ok(oldsz)
    }

    /// Current mapped size of a process
    pub fn size_of(&self, pid: Pid) -> Result<usize> {
        let idx = self.lookup(pid).ok_or(KernelError::NoSuchProcess)?;
        let p = self.slots[idx].lock();
        if !p.is_live() || p.pid != pid {
            return Err(KernelError::NoSuchProcess);
        }
        Ok(p.sz)
    }

    /// Acquire two distinct process locks without deadlocking against a
    /// concurrent acquisition of the same pair in the opposite roles.
    ///
    /// Locks are taken in ascending-pid order whichever way the roles point;
    /// the returned guards are in (source, destination) order. Callers must
    /// re-verify pid and liveness after acquisition: either process may have
    /// exited (and its slot been recycled) between lookup and locking.
    pub fn lock_pair(
        &self,
        src: (Pid, usize),
        dst: (Pid, usize),
    ) -> (MutexGuard<'_, Proc>, MutexGuard<'_, Proc>) {
        debug_assert_ne!(src.1, dst.1, "lock_pair on a single slot");
        if src.0 < dst.0 {
            let s = self.slots[src.1].lock();
            let d = self.slots[dst.1].lock();
            (s, d)
        } else {
            let d = self.slots[dst.1].lock();
            let s = self.slots[src.1].lock();
            (s, d)
        }
    }

    /// Process exit hook.
    ///
    /// Unpublishes the pid, then under the process's own lock releases every
    /// shared mapping it holds (destination role) and tears down its address
    /// space. The teardown drops one reference per frame; frames still
    /// referenced by surviving sharers of this process's memory (source
    /// role) are not returned to the free list until the last sharer lets go.
    pub fn exit(&self, pid: Pid) -> Result<()> {
        let idx = {
            let mut reg = self.registry.lock();
            reg.map.remove(&pid).ok_or(KernelError::NoSuchProcess)?
        };

        {
            let mut p = self.slots[idx].lock();
            debug_assert!(p.is_live() && p.pid == pid);

            shm::release_all(&mut p);
            vm::uvmfree(&mut p.pagetable);
            p.sz = 0;
            p.pid = 0;
            p.state = ProcState::Unused;
        }

        self.registry.lock().free_slots.push(idx);
        debug!("process: pid {pid} exited");
        Ok(())
    }
}
