//! Shared-memory smoke tests
//!
//! Hosted version of the parent/child mapping demo: a process allocates a
//! buffer, others map it, write through the alias, unmap, and the owner
//! observes the bytes. Also pins down the failure modes and the refcount
//! round-trip guarantees.

use kernel::error::KernelError;
use kernel::mm;
use kernel::params::PAGE_SIZE;
use kernel::process::{PROC, Pid};
use kernel::shm::{map_shared_pages, unmap_shared_pages};
use kernel::syscall::{SYS_FAIL, sys_getprocsize, sys_map_shared_pages};
use kernel::vm;

fn spawn_with_bytes(nbytes: usize) -> Pid {
    let pid = PROC.spawn().unwrap();
    if nbytes > 0 {
        PROC.grow(pid, nbytes).unwrap();
    }
    pid
}

fn write_user(pid: Pid, va: usize, bytes: &[u8]) {
    let idx = PROC.lookup(pid).unwrap();
    let p = PROC.slot(idx).lock();
    unsafe { vm::copyout(&p.pagetable, va, bytes).unwrap() };
}

fn read_user(pid: Pid, va: usize, len: usize) -> Vec<u8> {
    let idx = PROC.lookup(pid).unwrap();
    let p = PROC.slot(idx).lock();
    let mut buf = vec![0u8; len];
    unsafe { vm::copyin(&p.pagetable, &mut buf, va).unwrap() };
    buf
}

fn frame_of(pid: Pid, va: usize) -> usize {
    let idx = PROC.lookup(pid).unwrap();
    let p = PROC.slot(idx).lock();
    p.pagetable.translate(va).unwrap().0
}

#[test]
fn child_writes_parent_reads() {
    kernel::init();
    let parent = spawn_with_bytes(12);
    let child = spawn_with_bytes(0);

    let before = sys_getprocsize(child);
    let mapped = sys_map_shared_pages(parent, child, 0, 12);
    assert_ne!(mapped, SYS_FAIL);
    assert!(sys_getprocsize(child) > before);

    write_user(child, mapped as usize, b"Hello daddy\0");
    assert_eq!(read_user(parent, 0, 12), b"Hello daddy\0");

    unmap_shared_pages(child, mapped as usize, 12).unwrap();
    assert_eq!(sys_getprocsize(child), before);

    // The child's own allocations keep working after the unmap
    PROC.grow(child, 40 * PAGE_SIZE).unwrap();
    assert_eq!(sys_getprocsize(child), 40 * PAGE_SIZE as u64);

    PROC.exit(child).unwrap();
    PROC.exit(parent).unwrap();
}

#[test]
fn aliasing_is_byte_exact_in_both_directions() {
    kernel::init();
    let a = spawn_with_bytes(2 * PAGE_SIZE);
    let b = spawn_with_bytes(0);

    let base = map_shared_pages(a, b, 0, 2 * PAGE_SIZE).unwrap();

    // Write through the alias at assorted offsets, read through the source
    for k in [0usize, 1, PAGE_SIZE - 1, PAGE_SIZE, 2 * PAGE_SIZE - 1] {
        write_user(b, base + k, &[0xA5]);
        assert_eq!(read_user(a, k, 1), [0xA5]);
    }

    // And the other way around
    for k in [7usize, PAGE_SIZE + 3] {
        write_user(a, k, &[0x5A]);
        assert_eq!(read_user(b, base + k, 1), [0x5A]);
    }

    unmap_shared_pages(b, base, 2 * PAGE_SIZE).unwrap();
    PROC.exit(b).unwrap();
    PROC.exit(a).unwrap();
}

#[test]
fn map_unmap_round_trip_restores_state() {
    kernel::init();
    let a = spawn_with_bytes(3 * PAGE_SIZE);
    let b = spawn_with_bytes(PAGE_SIZE);

    let src_frames: Vec<usize> = (0..3).map(|i| frame_of(a, i * PAGE_SIZE)).collect();
    let counts_before: Vec<u32> = src_frames.iter().map(|&f| mm::frame_refcount(f)).collect();
    let b_sz_before = PROC.size_of(b).unwrap();
    let b_pages_before = {
        let idx = PROC.lookup(b).unwrap();
        PROC.slot(idx).lock().pagetable.mapped_pages()
    };

    let base = map_shared_pages(a, b, 0, 3 * PAGE_SIZE).unwrap();
    unmap_shared_pages(b, base, 3 * PAGE_SIZE).unwrap();

    let counts_after: Vec<u32> = src_frames.iter().map(|&f| mm::frame_refcount(f)).collect();
    assert_eq!(counts_before, counts_after);
    assert_eq!(PROC.size_of(b).unwrap(), b_sz_before);
    let b_pages_after = {
        let idx = PROC.lookup(b).unwrap();
        PROC.slot(idx).lock().pagetable.mapped_pages()
    };
    assert_eq!(b_pages_before, b_pages_after);

    PROC.exit(b).unwrap();
    PROC.exit(a).unwrap();
}

#[test]
fn many_sharers_balance_the_reference_count() {
    kernel::init();
    const NSHARERS: usize = 10;

    let owner = spawn_with_bytes(PAGE_SIZE);
    let frame = frame_of(owner, 0);
    assert_eq!(mm::frame_refcount(frame), 1);

    let sharers: Vec<(Pid, usize)> = (0..NSHARERS)
        .map(|_| {
            let pid = spawn_with_bytes(0);
            let base = map_shared_pages(owner, pid, 0, PAGE_SIZE).unwrap();
            (pid, base)
        })
        .collect();
    assert_eq!(mm::frame_refcount(frame), 1 + NSHARERS as u32);

    for (pid, base) in &sharers {
        unmap_shared_pages(*pid, *base, PAGE_SIZE).unwrap();
    }
    assert_eq!(mm::frame_refcount(frame), 1);

    for (pid, _) in sharers {
        PROC.exit(pid).unwrap();
    }
    PROC.exit(owner).unwrap();
    assert_eq!(mm::frame_refcount(frame), 0);
}

#[test]
fn sharers_survive_source_exit() {
    kernel::init();
    const NCHILDREN: usize = 10;

    let parent = spawn_with_bytes(PAGE_SIZE);
    write_user(parent, 0, b"still here after the owner died");
    let frame = frame_of(parent, 0);

    let children: Vec<(Pid, usize)> = (0..NCHILDREN)
        .map(|_| {
            let pid = spawn_with_bytes(0);
            let base = map_shared_pages(parent, pid, 0, PAGE_SIZE).unwrap();
            (pid, base)
        })
        .collect();

    // Parent exits while every child still holds its mapping
    PROC.exit(parent).unwrap();
    assert_eq!(mm::frame_refcount(frame), NCHILDREN as u32);

    // The frame must not be handed out again while references remain
    let probe: Vec<usize> = (0..8).filter_map(|_| mm::kalloc()).collect();
    for &p in &probe {
        assert_ne!(p, frame);
        mm::kfree(p);
    }

    // Children still read the bytes the parent wrote
    for (pid, base) in &children {
        assert_eq!(
            read_user(*pid, *base, 31),
            b"still here after the owner died"
        );
    }

    // The last child out turns off the lights
    for (i, (pid, _)) in children.iter().enumerate() {
        PROC.exit(*pid).unwrap();
        let expect = (NCHILDREN - 1 - i) as u32;
        assert_eq!(mm::frame_refcount(frame), expect);
    }
    assert_eq!(mm::frame_refcount(frame), 0);
}

#[test]
fn zero_size_and_unaligned_source_fail_cleanly() {
    kernel::init();
    let a = spawn_with_bytes(PAGE_SIZE);
    let b = spawn_with_bytes(0);

    assert_eq!(
        map_shared_pages(a, b, 0, 0),
        Err(KernelError::InvalidArgument)
    );
    assert_eq!(
        map_shared_pages(a, b, 64, PAGE_SIZE),
        Err(KernelError::BadAddress)
    );

    // No mapping was installed by either failure
    assert_eq!(PROC.size_of(b).unwrap(), 0);
    let idx = PROC.lookup(b).unwrap();
    assert_eq!(PROC.slot(idx).lock().pagetable.mapped_pages(), 0);

    PROC.exit(b).unwrap();
    PROC.exit(a).unwrap();
}

#[test]
fn mapping_into_exited_process_fails() {
    kernel::init();
    let a = spawn_with_bytes(PAGE_SIZE);
    let gone = spawn_with_bytes(0);
    PROC.exit(gone).unwrap();

    assert_eq!(
        map_shared_pages(a, gone, 0, PAGE_SIZE),
        Err(KernelError::NoSuchProcess)
    );
    assert_eq!(
        map_shared_pages(gone, a, 0, PAGE_SIZE),
        Err(KernelError::NoSuchProcess)
    );

    PROC.exit(a).unwrap();
}
