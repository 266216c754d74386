//! A process dying while holding a lock must not block the others.
#![cfg(target_os = "linux")]
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, Ordering};

use shm_arena::sync::RwLock;
use shm_arena::{Arena, ArenaError, ArenaObject, ArenaOptions};

#[repr(C)]
struct Locked {
    lock: RwLock,
}

unsafe impl ArenaObject for Locked {
    const TAG: u64 = u64::from_le_bytes(*b"locked-1");

    fn retire(&self, _: &Arena) -> shm_arena::Result<()> {
        Ok(())
    }
}

fn scratch_arena() -> (String, Arena) {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("/shm-arena-robust-{}-{n}", std::process::id());
    let _ = Arena::remove(&name);
    let arena = Arena::open_or_create(&name, &ArenaOptions::with_capacity(1 << 16)).unwrap();
    (name, arena)
}

/// Run `child` in a forked process that exits without unwinding, and wait for it.
fn in_child(child: impl FnOnce()) {
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            child();
            unsafe { libc::_exit(0) }
        }
        pid => {
            let mut status = 0;
            assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
            assert!(libc::WIFEXITED(status));
        }
    }
}

#[test]
fn dead_writer_is_reclaimed() {
    let (name, arena) = scratch_arena();
    let locked = arena
        .find_or_construct::<Locked, _>("lock", |_, ptr| unsafe {
            RwLock::init(addr_of_mut!((*ptr.as_ptr()).lock)).map_err(ArenaError::Lock)
        })
        .unwrap();

    in_child(|| {
        if let Ok(guard) = locked.lock.write() {
            std::mem::forget(guard);
        }
    });

    // Blocks until the waiter notices the owner is gone.
    drop(locked.lock.write().unwrap());
    drop(locked.lock.read().unwrap());

    drop(locked);
    Arena::remove(&name).unwrap();
}

#[test]
fn dead_reader_is_reclaimed() {
    let (name, arena) = scratch_arena();
    let locked = arena
        .find_or_construct::<Locked, _>("lock", |_, ptr| unsafe {
            RwLock::init(addr_of_mut!((*ptr.as_ptr()).lock)).map_err(ArenaError::Lock)
        })
        .unwrap();

    in_child(|| {
        if let Ok(guard) = locked.lock.read() {
            std::mem::forget(guard);
        }
    });

    assert!(locked.lock.reap().unwrap());
    drop(locked.lock.write().unwrap());

    drop(locked);
    Arena::remove(&name).unwrap();
}

#[test]
fn dead_allocator_is_recovered() {
    let (name, arena) = scratch_arena();

    in_child(|| {
        if let Ok(heap) = arena.heap() {
            std::mem::forget(heap);
        }
    });

    let mut heap = arena.heap().unwrap();
    let allocation = heap.allocate(100).unwrap();
    heap.deallocate(allocation.offset).unwrap();
    drop(heap);

    Arena::remove(&name).unwrap();
}
