use super::{SharedFd, ShmName};
use core::ffi::{c_char, c_int};
use alloc::sync::Arc;

/// Interact with `shm*` and related calls.
#[derive(Clone)]
pub struct Shm {
    inner: Arc<ShmInner>,
}

struct ShmInner {
    vtable: ShmVTable,
}

/// An error returned when interaction with a shared memory file.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShmError(c_int);

/// How to open a name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the object, failing if the name is taken.
    CreateExclusive,
    /// Open an object that must already exist.
    Existing,
}

/// *Fixed* type, not platform dependent.
type OffT = i64;
type BlkSizeT = i64;
type BlkCntT = i64;
type TimeT = i64;

#[non_exhaustive]
#[derive(Default)]
pub struct Stat {
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: OffT,
    pub st_blksize: BlkSizeT,
    pub st_blocks: BlkCntT,
    pub st_atime: TimeT,
    pub st_atime_nsec: i64,
    pub st_mtime: TimeT,
    pub st_mtime_nsec: i64,
    pub st_ctime: TimeT,
    pub st_ctime_nsec: i64,
}

/// A table of OS functions.
///
/// This enumerates the functions required to manage named shared memory objects. A vtable must
/// contain functions that behave according the POSIX/libc's specification of the correspondingly
/// named functions, see Safety precondition of [`Shm::new_unchecked`]. Note that a default
/// table can be initialized when linking against `libc`.
///
/// You're encouraged to provide your own objects here instead of hooking the functions themselves
/// with override/linker tricks.
#[non_exhaustive]
pub struct ShmVTable {
    /// Simplified `shm_open`: the `create` flag selects `O_CREAT | O_EXCL`, always read-write.
    pub open: fn(*const c_char, bool, u32) -> c_int,
    pub unlink: fn(*const c_char) -> c_int,
    pub truncate: fn(c_int, OffT) -> c_int,
    pub fstat: fn(c_int, Option<&mut Stat>) -> c_int,
    pub close: fn(c_int) -> c_int,
    pub errno: fn() -> c_int,

    pub eexist: c_int,
    pub enoent: c_int,
}

impl Shm {
    /// Create an `Shm` from a customized vtable.
    ///
    /// # Safety
    ///
    /// The VTable must contain a correct set of functions that implement the `shm*` interface.
    pub unsafe fn new_unchecked(vtable: ShmVTable) -> Self {
        Shm {
            inner: Arc::new(ShmInner { vtable }),
        }
    }

    #[cfg(feature = "libc")]
    pub fn new() -> Self {
        unsafe {
            Self::new_unchecked(ShmVTable::new_libc())
        }
    }

    /// Open a named object with the given permission bits (only used on creation).
    pub fn open(&self, name: &ShmName, how: OpenMode, mode: u32) -> Result<SharedFd, ShmError> {
        let create = matches!(how, OpenMode::CreateExclusive);
        let fd = (self.inner.vtable.open)(name.as_c_str().as_ptr(), create, mode);

        if fd < 0 {
            Err(self.last_error())
        } else {
            // Safety: the descriptor was just returned to us and nothing else holds it.
            Ok(unsafe { SharedFd::from_raw_fd(fd) })
        }
    }

    /// Remove the name. Objects stay alive while they are mapped or open.
    pub fn unlink(&self, name: &ShmName) -> Result<(), ShmError> {
        if (self.inner.vtable.unlink)(name.as_c_str().as_ptr()) < 0 {
            return Err(self.last_error());
        }

        Ok(())
    }

    pub fn truncate(&self, shared: &SharedFd, len: u64) -> Result<(), ShmError> {
        let len = OffT::try_from(len).map_err(|_| ShmError::EFBIG)?;

        if (self.inner.vtable.truncate)(shared.fd, len) < 0 {
            return Err(self.last_error());
        }

        Ok(())
    }

    pub fn stat(&self, shared: &SharedFd) -> Result<Stat, ShmError> {
        let mut stat = Stat::default();
        let inner = (self.inner.vtable.fstat)(shared.fd, Some(&mut stat));

        if inner < 0 {
            Err(self.last_error())
        } else {
            Ok(stat)
        }
    }

    pub fn close(&self, shared: SharedFd) -> Result<(), ShmError> {
        if (self.inner.vtable.close)(shared.into_raw_fd()) < 0 {
            return Err(self.last_error());
        }

        Ok(())
    }

    /// Did the call fail because the name is already taken?
    pub fn is_exists(&self, err: ShmError) -> bool {
        err.0 == self.inner.vtable.eexist
    }

    /// Did the call fail because no object with that name exists?
    pub fn is_not_found(&self, err: ShmError) -> bool {
        err.0 == self.inner.vtable.enoent
    }

    fn last_error(&self) -> ShmError {
        ShmError((self.inner.vtable.errno)())
    }
}

impl ShmError {
    // Linux value, only used when an offset does not fit `off_t`.
    const EFBIG: ShmError = ShmError(27);

    pub fn from_raw_os_error(errno: c_int) -> Self {
        ShmError(errno)
    }

    pub fn raw_os_error(self) -> c_int {
        self.0
    }
}

impl core::fmt::Debug for ShmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("ShmError").field(&self.0).finish()
    }
}

impl core::fmt::Display for ShmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "shared memory call failed with errno {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ShmError {}

#[cfg(feature = "std")]
impl From<ShmError> for std::io::Error {
    fn from(err: ShmError) -> Self {
        std::io::Error::from_raw_os_error(err.0)
    }
}

impl ShmVTable {
    #[cfg(feature = "libc")]
    pub fn new_libc() -> Self {
        fn _open(name: *const c_char, create: bool, mode: u32) -> c_int {
            let mut flags = libc::O_RDWR;
            if create {
                flags |= libc::O_CREAT | libc::O_EXCL;
            }

            // Safety: `name` is a NUL terminated string, from `ShmName`.
            unsafe { libc::shm_open(name, flags, mode as libc::mode_t) }
        }

        fn _unlink(name: *const c_char) -> c_int {
            unsafe { libc::shm_unlink(name) }
        }

        fn _truncate(fd: c_int, len: OffT) -> c_int {
            unsafe { libc::ftruncate(fd, len as libc::off_t) }
        }

        fn _fstat(fd: c_int, stat: Option<&mut Stat>) -> c_int {
            let mut uninit = core::mem::MaybeUninit::<libc::stat>::zeroed();
            // Safety: passing the correct pointer to a struct of libc::stat.
            let ret = unsafe { libc::fstat(fd, uninit.as_mut_ptr()) };

            if ret == 0 {
                // Safety: always initialized on return with success.
                let lstat = unsafe { uninit.assume_init() };
                if let Some(stat) = stat {
                    *stat = Stat {
                        st_mode: lstat.st_mode,
                        st_uid: lstat.st_uid,
                        st_gid: lstat.st_gid,
                        st_size: lstat.st_size,
                        st_blksize: lstat.st_blksize,
                        st_blocks: lstat.st_blocks,
                        st_atime: lstat.st_atime,
                        st_atime_nsec: lstat.st_atime_nsec,
                        st_mtime: lstat.st_mtime,
                        st_mtime_nsec: lstat.st_mtime_nsec,
                        st_ctime: lstat.st_ctime,
                        st_ctime_nsec: lstat.st_ctime_nsec,
                    };
                };
            }

            ret
        }

        fn _close_inner(fd: c_int) -> c_int {
            unsafe { libc::close(fd) }
        }

        fn _errno() -> c_int {
            unsafe { *libc::__errno_location() }
        }

        ShmVTable {
            open: _open,
            unlink: _unlink,
            truncate: _truncate,
            fstat: _fstat,
            close: _close_inner,
            errno: _errno,
            eexist: libc::EEXIST,
            enoent: libc::ENOENT,
        }
    }
}
