//! Process-shared locks that live inside the arena.
//!
//! All primitives here are plain `#[repr(C)]` data, initialized in place once by the process
//! that formats the memory, and then used through shared references by every process that maps
//! it. None of them may be moved after initialization.
//!
//! ## Crash behaviour
//!
//! [`RobustMutex`] is a `PTHREAD_MUTEX_ROBUST` mutex. When its owner dies, the next locker gets
//! `EOWNERDEAD`, marks the mutex consistent and proceeds; the guard reports this through
//! [`MutexGuard::recovered`].
//!
//! [`RwLock`] only holds its inner mutex for short bookkeeping sections. The holders of the
//! shared and exclusive lock are recorded by pid. Waiters wake up periodically and reclaim holds
//! whose process no longer exists, so a process killed in the middle of a critical section does
//! not wedge the lock. The data the lock protects is not repaired; the reclaim is logged.
//!
//! Two caveats follow from pid tracking. A dead process must have been reaped by its parent
//! before its pid counts as gone, and a recycled pid keeps the hold alive until that process
//! exits as well.
//!
//! Pids are only meaningful inside one pid namespace. All processes sharing an arena must see
//! each other's pids: a live holder in another namespace, for example another container
//! sharing `/dev/shm`, looks dead to `kill(pid, 0)` and its hold is reclaimed while it is still
//! inside the critical section.
use core::cell::UnsafeCell;
use core::ffi::c_int;
use core::mem::MaybeUninit;
use core::ptr::addr_of_mut;
use std::io;
use std::time::Duration;

/// How long a waiter sleeps before checking lock holders for liveness.
const PROBE_INTERVAL: Duration = Duration::from_millis(20);

/// Distinct processes that can hold the shared lock at once.
pub const READER_SLOTS: usize = 64;

/// A robust, process-shared `pthread` mutex.
#[repr(C)]
pub struct RobustMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

/// Proof of holding a [`RobustMutex`].
pub struct MutexGuard<'lt> {
    mutex: &'lt RobustMutex,
    recovered: bool,
}

/// A process-shared condition variable, waiting on the monotonic clock.
#[repr(C)]
pub struct Condvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

/// A process-shared reader/writer lock that survives the death of its holders.
///
/// Readers are admitted whenever no writer holds the lock, a steady stream of them delays writers.
#[repr(C)]
pub struct RwLock {
    gate: RobustMutex,
    changed: Condvar,
    state: UnsafeCell<LockState>,
}

pub struct ReadGuard<'lt> {
    lock: &'lt RwLock,
    pid: u32,
}

pub struct WriteGuard<'lt> {
    lock: &'lt RwLock,
    pid: u32,
}

/// Only touched while `gate` is held.
#[repr(C)]
struct LockState {
    /// Pid of the exclusive holder, or zero.
    writer: u32,
    /// Total number of shared holds over all slots.
    readers: u32,
    slots: [ReaderSlot; READER_SLOTS],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ReaderSlot {
    pid: u32,
    holds: u32,
}

// Safety: all state is behind the pthread primitives, which are designed for sharing.
unsafe impl Sync for RobustMutex {}
unsafe impl Send for RobustMutex {}
unsafe impl Sync for Condvar {}
unsafe impl Send for Condvar {}
unsafe impl Sync for RwLock {}
unsafe impl Send for RwLock {}

fn check(ret: c_int) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        err => Err(io::Error::from_raw_os_error(err)),
    }
}

impl RobustMutex {
    /// Initialize a mutex in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory that no other thread or process uses yet, and the
    /// mutex must not be moved afterwards.
    pub unsafe fn init(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;

        let result = Self::init_with(this, attr.as_mut_ptr());
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        result
    }

    unsafe fn init_with(this: *mut Self, attr: *mut libc::pthread_mutexattr_t) -> io::Result<()> {
        check(libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED))?;
        check(libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST))?;
        let raw = UnsafeCell::raw_get(core::ptr::addr_of!((*this).inner));
        check(libc::pthread_mutex_init(raw, attr))
    }

    pub fn lock(&self) -> io::Result<MutexGuard<'_>> {
        // Safety: initialized by `init`, never moved.
        let ret = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        let recovered = self.settle(ret)?;
        Ok(MutexGuard {
            mutex: self,
            recovered,
        })
    }

    /// Interpret the result of a call that acquires the mutex.
    fn settle(&self, ret: c_int) -> io::Result<bool> {
        match ret {
            0 => Ok(false),
            libc::EOWNERDEAD => {
                tracing::warn!("recovered shared mutex from a dead owner");
                check(unsafe { libc::pthread_mutex_consistent(self.inner.get()) })?;
                Ok(true)
            }
            err => Err(io::Error::from_raw_os_error(err)),
        }
    }
}

impl MutexGuard<'_> {
    /// Whether the previous owner died while holding the mutex.
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let ret = unsafe { libc::pthread_mutex_unlock(self.mutex.inner.get()) };
        if ret != 0 {
            tracing::error!(errno = ret, "failed to unlock shared mutex");
        }
    }
}

impl Condvar {
    /// Initialize a condition variable in place.
    ///
    /// # Safety
    ///
    /// Same as [`RobustMutex::init`].
    pub unsafe fn init(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;

        let result = Self::init_with(this, attr.as_mut_ptr());
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        result
    }

    unsafe fn init_with(this: *mut Self, attr: *mut libc::pthread_condattr_t) -> io::Result<()> {
        check(libc::pthread_condattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED))?;
        check(libc::pthread_condattr_setclock(attr, libc::CLOCK_MONOTONIC))?;
        let raw = UnsafeCell::raw_get(core::ptr::addr_of!((*this).inner));
        check(libc::pthread_cond_init(raw, attr))
    }

    /// Wait for a notification or the timeout, whichever comes first.
    ///
    /// Spurious and timed-out wake ups are not distinguished, callers re-check their condition.
    pub fn wait_for(&self, guard: &mut MutexGuard<'_>, timeout: Duration) -> io::Result<()> {
        let deadline = monotonic_after(timeout)?;
        let ret = unsafe {
            libc::pthread_cond_timedwait(self.inner.get(), guard.mutex.inner.get(), &deadline)
        };

        match ret {
            libc::ETIMEDOUT => Ok(()),
            other => {
                if guard.mutex.settle(other)? {
                    guard.recovered = true;
                }

                Ok(())
            }
        }
    }

    pub fn notify_all(&self) {
        let ret = unsafe { libc::pthread_cond_broadcast(self.inner.get()) };
        if ret != 0 {
            tracing::error!(errno = ret, "failed to broadcast shared condition");
        }
    }
}

fn monotonic_after(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    if -1 == unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, now.as_mut_ptr()) } {
        return Err(io::Error::last_os_error());
    }

    // Safety: initialized on success.
    let now = unsafe { now.assume_init() };
    let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());

    Ok(libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}

/// Whether `pid` still names a process. Permission errors mean it exists.
fn alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }

    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

impl LockState {
    const EMPTY: Self = LockState {
        writer: 0,
        readers: 0,
        slots: [ReaderSlot { pid: 0, holds: 0 }; READER_SLOTS],
    };

    /// The slot of `pid`, or a free one.
    fn slot_for(&mut self, pid: u32) -> Option<&mut ReaderSlot> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.holds != 0 && slot.pid == pid)
            .or_else(|| self.slots.iter().position(|slot| slot.holds == 0))?;
        Some(&mut self.slots[index])
    }

    /// Drop holds of processes that no longer exist. Returns whether anything was reclaimed.
    fn reap(&mut self) -> bool {
        let mut reclaimed = false;

        if self.writer != 0 && !alive(self.writer) {
            tracing::warn!(pid = self.writer, "reclaiming exclusive lock of a dead process");
            self.writer = 0;
            reclaimed = true;
        }

        for slot in self.slots.iter_mut() {
            if slot.holds == 0 || alive(slot.pid) {
                continue;
            }

            tracing::warn!(pid = slot.pid, holds = slot.holds, "reclaiming shared lock of a dead process");
            self.readers = self.readers.saturating_sub(slot.holds);
            *slot = ReaderSlot { pid: 0, holds: 0 };
            reclaimed = true;
        }

        reclaimed
    }
}

impl RwLock {
    /// Initialize the lock in place, unlocked.
    ///
    /// # Safety
    ///
    /// Same as [`RobustMutex::init`].
    pub unsafe fn init(this: *mut Self) -> io::Result<()> {
        RobustMutex::init(addr_of_mut!((*this).gate))?;
        Condvar::init(addr_of_mut!((*this).changed))?;
        addr_of_mut!((*this).state).write(UnsafeCell::new(LockState::EMPTY));
        Ok(())
    }

    /// Acquire the lock shared. Blocks while a writer holds it.
    pub fn read(&self) -> io::Result<ReadGuard<'_>> {
        let pid = std::process::id();
        let mut gate = self.gate.lock()?;

        loop {
            // Safety: we hold `gate`.
            let state = unsafe { self.state_mut() };

            if state.writer == 0 {
                if let Some(slot) = state.slot_for(pid) {
                    slot.pid = pid;
                    slot.holds += 1;
                    state.readers += 1;
                    return Ok(ReadGuard { lock: self, pid });
                }
            }

            self.changed.wait_for(&mut gate, PROBE_INTERVAL)?;
            unsafe { self.state_mut() }.reap();
        }
    }

    /// Acquire the lock exclusively. Blocks while any reader or writer holds it.
    ///
    /// Like other reader/writer locks this is not reentrant: a thread holding a shared guard
    /// deadlocks requesting the exclusive one.
    pub fn write(&self) -> io::Result<WriteGuard<'_>> {
        let pid = std::process::id();
        let mut gate = self.gate.lock()?;

        loop {
            // Safety: we hold `gate`.
            let state = unsafe { self.state_mut() };

            if state.writer == 0 && state.readers == 0 {
                state.writer = pid;
                return Ok(WriteGuard { lock: self, pid });
            }

            self.changed.wait_for(&mut gate, PROBE_INTERVAL)?;
            unsafe { self.state_mut() }.reap();
        }
    }

    /// Reclaim holds of dead processes right away instead of on the next contended wait.
    pub fn reap(&self) -> io::Result<bool> {
        let _gate = self.gate.lock()?;
        let reclaimed = unsafe { self.state_mut() }.reap();
        if reclaimed {
            self.changed.notify_all();
        }

        Ok(reclaimed)
    }

    /// # Safety
    ///
    /// The caller holds `gate` and does not keep the reference across a release of it.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state_mut(&self) -> &mut LockState {
        &mut *self.state.get()
    }

    fn release_read(&self, pid: u32) {
        let Ok(_gate) = self.gate.lock() else {
            tracing::error!(pid, "failed to release shared lock");
            return;
        };

        let state = unsafe { self.state_mut() };
        if let Some(slot) = state.slots.iter_mut().find(|slot| slot.holds != 0 && slot.pid == pid) {
            slot.holds -= 1;
            if slot.holds == 0 {
                slot.pid = 0;
            }

            state.readers = state.readers.saturating_sub(1);
        }

        self.changed.notify_all();
    }

    fn release_write(&self, pid: u32) {
        let Ok(_gate) = self.gate.lock() else {
            tracing::error!(pid, "failed to release exclusive lock");
            return;
        };

        let state = unsafe { self.state_mut() };
        if state.writer == pid {
            state.writer = 0;
        }

        self.changed.notify_all();
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read(self.pid);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write(self.pid);
    }
}
