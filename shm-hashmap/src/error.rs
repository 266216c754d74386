use std::io;

use shm_arena::ArenaError;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Arena(#[from] ArenaError),

    /// The map was destroyed through this or another handle.
    #[error("the map was destroyed")]
    Destroyed,

    #[error("failed to write entries")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the arena ran out of space. Entries stored before are unaffected.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::Arena(err) if err.is_out_of_memory())
    }
}
