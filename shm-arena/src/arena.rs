use core::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memmap2::{MmapOptions, MmapRaw};
use shm_fd::{OpenMode, SharedFd, Shm, ShmError, ShmName};

use crate::heap::Heap;
use crate::segment::{Segment, MIN_CAPACITY};
use crate::{ArenaError, Offset, Result};

/// Options used when the arena has to be created.
#[derive(Clone, Debug)]
pub struct ArenaOptions {
    /// Size of the region in bytes, fixed once created.
    pub capacity: usize,
    /// Permission bits of a newly created object.
    pub mode: u32,
    /// How long to wait for a concurrent creator to finish formatting.
    pub attach_timeout: Duration,
}

/// A handle to a mapped arena.
///
/// Cheap to clone, all clones share one mapping. The mapping is released when the last clone is
/// dropped; the shared memory object itself persists until [`Arena::remove`].
#[derive(Clone)]
pub struct Arena {
    inner: Arc<Inner>,
}

struct Inner {
    name: Option<ShmName>,
    seg: Segment,
    created: bool,
    /// Keeps `seg` valid, not accessed besides `Drop`.
    #[allow(dead_code)]
    map: MmapRaw,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        ArenaOptions {
            capacity: 655_350,
            mode: 0o600,
            attach_timeout: Duration::from_secs(2),
        }
    }
}

impl ArenaOptions {
    pub fn with_capacity(capacity: usize) -> Self {
        ArenaOptions {
            capacity,
            ..ArenaOptions::default()
        }
    }
}

impl Arena {
    /// Attach to the arena called `name`, creating and formatting it if it does not exist.
    ///
    /// Exactly one of several racing processes creates the arena, the others wait for it to be
    /// formatted. Attaching to an existing arena of a different size fails.
    pub fn open_or_create(name: &str, options: &ArenaOptions) -> Result<Self> {
        let name = ShmName::new(name).map_err(|source| ArenaError::InvalidName {
            name: name.to_owned(),
            source,
        })?;

        if options.capacity < MIN_CAPACITY {
            return Err(ArenaError::CapacityTooSmall {
                requested: options.capacity,
                minimum: MIN_CAPACITY,
            });
        }

        let shm = Shm::new();
        let deadline = Instant::now() + options.attach_timeout;

        loop {
            match shm.open(&name, OpenMode::CreateExclusive, options.mode) {
                Ok(fd) => return Self::create_on(&shm, name, fd, options),
                Err(err) if shm.is_exists(err) => {}
                Err(err) => return Err(attach_error(&name, err)),
            }

            match shm.open(&name, OpenMode::Existing, 0) {
                Ok(fd) => return Self::attach_on(&shm, name, fd, options, deadline),
                // Removed in between, race for creating it again.
                Err(err) if shm.is_not_found(err) && Instant::now() < deadline => continue,
                Err(err) => return Err(attach_error(&name, err)),
            }
        }
    }

    /// Create an arena on an unnamed memory file.
    ///
    /// Other processes can only share it by inheriting the mapping.
    pub fn anonymous(capacity: usize) -> Result<Self> {
        if capacity < MIN_CAPACITY {
            return Err(ArenaError::CapacityTooSmall {
                requested: capacity,
                minimum: MIN_CAPACITY,
            });
        }

        let file = memfile::MemFile::create_default("shm-arena").map_err(ArenaError::Map)?;
        file.set_len(capacity as u64).map_err(ArenaError::Map)?;
        let map = MmapOptions::new()
            .len(capacity)
            .map_raw(&file)
            .map_err(ArenaError::Map)?;

        let arena = Self::from_map(None, map, true);
        // Safety: nobody else has seen the mapping.
        unsafe { arena.inner.seg.format() }.map_err(ArenaError::Map)?;
        arena.inner.seg.publish();

        tracing::debug!(capacity, "created anonymous arena");
        Ok(arena)
    }

    /// Remove the name of an arena. Returns whether the name existed.
    ///
    /// Processes that have it mapped keep using it, the memory is reclaimed once all of them
    /// detached.
    pub fn remove(name: &str) -> Result<bool> {
        let name = ShmName::new(name).map_err(|source| ArenaError::InvalidName {
            name: name.to_owned(),
            source,
        })?;

        let shm = Shm::new();
        match shm.unlink(&name) {
            Ok(()) => {
                tracing::info!(arena = %name, "removed arena");
                Ok(true)
            }
            Err(err) if shm.is_not_found(err) => Ok(false),
            Err(err) => Err(ArenaError::Unlink {
                name: name.to_string(),
                source: err.into(),
            }),
        }
    }

    fn create_on(shm: &Shm, name: ShmName, fd: SharedFd, options: &ArenaOptions) -> Result<Self> {
        let mapped = shm
            .truncate(&fd, options.capacity as u64)
            .map_err(|err| attach_error(&name, err))
            .and_then(|()| {
                MmapOptions::new()
                    .len(options.capacity)
                    .map_raw(fd.as_raw_fd())
                    .map_err(ArenaError::Map)
            });

        let _ = shm.close(fd);
        let map = match mapped {
            Ok(map) => map,
            Err(err) => {
                // Do not leave an unformatted object behind for others to wait on.
                let _ = shm.unlink(&name);
                return Err(err);
            }
        };

        let arena = Self::from_map(Some(name), map, true);
        // Safety: until `publish` other processes only poll the state word.
        if let Err(err) = unsafe { arena.inner.seg.format() } {
            if let Some(name) = &arena.inner.name {
                let _ = shm.unlink(name);
            }

            return Err(ArenaError::Map(err));
        }

        arena.inner.seg.publish();

        tracing::info!(
            arena = %arena.display_name(),
            capacity = options.capacity,
            "created arena"
        );
        Ok(arena)
    }

    fn attach_on(
        shm: &Shm,
        name: ShmName,
        fd: SharedFd,
        options: &ArenaOptions,
        deadline: Instant,
    ) -> Result<Self> {
        let size = loop {
            let stat = match shm.stat(&fd) {
                Ok(stat) => stat,
                Err(err) => {
                    let _ = shm.close(fd);
                    return Err(attach_error(&name, err));
                }
            };

            if stat.st_size > 0 {
                break stat.st_size as usize;
            }

            // The creator has not sized the object yet.

            if Instant::now() >= deadline {
                let _ = shm.close(fd);
                return Err(ArenaError::NotReady {
                    name: name.to_string(),
                });
            }

            tracing::debug!(arena = %name, "waiting for the creator to size the arena");
            std::thread::sleep(Duration::from_millis(1));
        };

        if size != options.capacity {
            let _ = shm.close(fd);
            return Err(ArenaError::IncompatibleSize {
                name: name.to_string(),
                expected: options.capacity,
                found: size,
            });
        }

        let mapped = MmapOptions::new()
            .len(size)
            .map_raw(fd.as_raw_fd())
            .map_err(ArenaError::Map);
        let _ = shm.close(fd);

        let arena = Self::from_map(Some(name), mapped?, false);
        let seg = arena.inner.seg;

        while !seg.is_ready() {
            if Instant::now() >= deadline {
                return Err(ArenaError::NotReady {
                    name: arena.display_name().to_owned(),
                });
            }

            std::thread::sleep(Duration::from_millis(1));
        }

        if !seg.is_compatible() {
            return Err(ArenaError::Incompatible {
                name: arena.display_name().to_owned(),
            });
        }

        tracing::info!(arena = %arena.display_name(), capacity = size, "attached arena");
        Ok(arena)
    }

    fn from_map(name: Option<ShmName>, map: MmapRaw, created: bool) -> Self {
        // Mappings are page aligned and never null.
        let base = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        // Safety: the mapping lives in `Inner` next to the segment.
        let seg = unsafe { Segment::new(base, map.len()) };

        Arena {
            inner: Arc::new(Inner {
                name,
                seg,
                created,
                map,
            }),
        }
    }

    /// The name including its leading slash, `None` for anonymous arenas.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_ref().map(ShmName::as_str)
    }

    fn display_name(&self) -> &str {
        self.name().unwrap_or("<anonymous>")
    }

    /// Whether this handle formatted the arena, rather than attaching to an existing one.
    pub fn created(&self) -> bool {
        self.inner.created
    }

    pub fn capacity(&self) -> usize {
        self.inner.seg.len()
    }

    /// Free bytes in the arena.
    ///
    /// Advisory: read without the arena lock, so other processes may change it at any time.
    pub fn free_bytes(&self) -> usize {
        self.inner
            .seg
            .header()
            .free_bytes
            .load(core::sync::atomic::Ordering::Relaxed) as usize
    }

    /// Lock the arena for allocation.
    pub fn heap(&self) -> Result<Heap<'_>> {
        Heap::lock(&self.inner.seg).map_err(ArenaError::Lock)
    }

    /// Resolve an offset to a pointer into this process's mapping.
    ///
    /// Panics if a `T` at `offset` would not fit the arena or be misaligned. Reading or writing
    /// through the pointer is subject to whatever lock guards the object.
    pub fn at<T>(&self, offset: Offset) -> NonNull<T> {
        self.inner.seg.at(offset)
    }

    /// Resolve a byte range, with the same checks as [`Arena::at`].
    pub fn bytes(&self, offset: Offset, len: usize) -> NonNull<u8> {
        let ptr = self.inner.seg.bytes(offset, len);
        // The segment base is not null and the range is in bounds.
        NonNull::new(ptr).unwrap_or(NonNull::dangling())
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name())
            .field("capacity", &self.capacity())
            .field("created", &self.created())
            .finish()
    }
}

fn attach_error(name: &ShmName, err: ShmError) -> ArenaError {
    ArenaError::Attach {
        name: name.to_string(),
        source: err.into(),
    }
}
