//! A fixed-size heap in a named shared memory object.
//!
//! An [`Arena`] maps a POSIX shared memory object into every process that attaches to it by
//! name. The first process creates and formats the region, all others wait until it is published
//! and then use it concurrently. Inside the arena, objects are allocated from a free list and
//! refer to each other by [`Offset`], as each process maps the region at its own address.
//!
//! Objects can be registered under a name with [`Arena::find_or_construct`], which gives every
//! process a handle to the same object. Such objects synchronize through the process-shared
//! primitives in [`sync`], which survive the death of a process holding them.
//!
//! ## Not a database
//!
//! Nothing is persisted beyond the lifetime of the shared memory object, which ends with a reboot
//! or [`Arena::remove`]. A process dying in the middle of an update leaves the update partially
//! applied; locks are recovered, the data is not rolled back.
mod arena;
mod error;
mod heap;
mod registry;
mod segment;
mod string;
pub mod sync;

pub use arena::{Arena, ArenaOptions};
pub use error::{ArenaError, Result};
pub use heap::{Allocation, Heap};
pub use registry::{ArenaObject, Named};
pub use segment::MIN_CAPACITY;
pub use string::ArenaString;

/// Position of a value relative to the start of the arena. `0` is never a valid value.
pub type Offset = u64;
