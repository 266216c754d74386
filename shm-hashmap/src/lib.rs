//! A string key-value map shared between processes.
//!
//! The map lives in a named shared memory [`Arena`]: every process that opens the same arena and
//! map name operates on the same entries. Reads share a lock with other readers in any process,
//! mutations hold it exclusively.
//!
//! ```no_run
//! use shm_hashmap::{Store, StoreOptions};
//!
//! let store = Store::create_or_attach("/inventory", "items", &StoreOptions::default())?;
//! store.insert("apples", 12)?;
//! store.append("apples", "+3")?;
//! assert_eq!(store.find("apples")?.as_deref(), Some("12+3"));
//! # Ok::<_, shm_hashmap::Error>(())
//! ```
//!
//! The arena has a fixed capacity. Operations that do not fit fail with an error for which
//! [`Error::is_out_of_memory`] holds, and leave the stored entries as they were.
mod error;
mod hash;
mod map;
mod store;

pub use error::{Error, Result};
pub use hash::KeyFold;
pub use map::{Entries, MapOptions, ShmMap, Upsert};
pub use store::{Store, StoreOptions};

pub use shm_arena::{Arena, ArenaError, ArenaOptions};
