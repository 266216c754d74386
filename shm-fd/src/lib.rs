#![cfg_attr(not(feature = "std"), no_std)]
//! Named POSIX shared-memory objects.
//!
//! The crate has two halves. [`ShmName`] validates the names accepted by `shm_open`, and
//! [`op::Shm`] performs the actual calls through a table of OS functions that can be replaced
//! by the caller. A default table is available when linking against `libc`.
use core::ffi::c_int as RawFd;
extern crate alloc;

pub mod op;
mod name;

pub use name::{NameError, ShmName};
pub use op::{OpenMode, Shm, ShmError, ShmVTable, Stat};

/// A raw file descriptor referring to a shared memory object.
///
/// The descriptor is not closed on drop. Close it with [`Shm::close`] or convert it into an
/// owning type of your choice with [`SharedFd::into_raw_fd`].
pub struct SharedFd {
    fd: RawFd,
}

impl SharedFd {
    /// Wrap a raw descriptor.
    ///
    /// # Safety
    /// Caller asserts that the descriptor is open and not owned by any other resource.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        SharedFd { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn into_raw_fd(self) -> RawFd {
        let _this = core::mem::ManuallyDrop::new(self);
        _this.fd
    }
}

#[cfg(feature = "std")]
impl std::os::unix::io::AsRawFd for SharedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}
