use std::io;

use shm_fd::NameError;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, ArenaError>;

/// Everything that can go wrong while attaching to or allocating from an arena.
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("invalid shared memory name `{name}`")]
    InvalidName {
        name: String,
        #[source]
        source: NameError,
    },

    #[error("capacity of {requested} bytes is below the minimum of {minimum} bytes")]
    CapacityTooSmall { requested: usize, minimum: usize },

    /// The OS refused to create or open the object (permissions, resource limits).
    #[error("failed to create or attach `{name}`")]
    Attach {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("`{name}` already exists with {found} bytes, requested {expected} bytes")]
    IncompatibleSize {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("`{name}` does not contain an arena of a compatible layout")]
    Incompatible { name: String },

    /// The creating process did not finish formatting the arena in time.
    #[error("`{name}` was not initialized within the attach timeout")]
    NotReady { name: String },

    #[error("failed to remove `{name}`")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to map the arena")]
    Map(#[source] io::Error),

    #[error("arena exhausted: requested {requested} bytes with {free} bytes free")]
    OutOfMemory { requested: usize, free: usize },

    #[error("named object `{name}` exists with a different type")]
    TypeMismatch { name: String },

    #[error("shared lock failed")]
    Lock(#[source] io::Error),

    #[error("arena bookkeeping is corrupt: {0}")]
    Corrupt(&'static str),
}

impl ArenaError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ArenaError::OutOfMemory { .. })
    }
}
