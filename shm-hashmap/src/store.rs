use core::fmt::Display;
use std::io;

use shm_arena::{Arena, ArenaOptions};

use crate::map::{MapOptions, ShmMap, Upsert};
use crate::Result;

/// Everything needed to create the arena and the map, if they do not exist.
#[derive(Clone, Debug, Default)]
pub struct StoreOptions {
    pub arena: ArenaOptions,
    pub map: MapOptions,
}

impl StoreOptions {
    /// Defaults with the given arena size and initial buckets of the map.
    pub fn new(capacity: usize, buckets: usize) -> Self {
        StoreOptions {
            arena: ArenaOptions::with_capacity(capacity),
            map: MapOptions {
                buckets,
                ..MapOptions::default()
            },
        }
    }
}

/// A process's handle to one map in one arena, working with plain strings.
///
/// Keys and values are anything that can be displayed; values are returned as owned copies.
pub struct Store {
    map: ShmMap,
    map_name: String,
}

impl Store {
    /// Attach to the map `map_name` in the arena `arena_name`, creating either as needed.
    ///
    /// An existing map keeps the options it was constructed with.
    pub fn create_or_attach(arena_name: &str, map_name: &str, options: &StoreOptions) -> Result<Self> {
        let arena = Arena::open_or_create(arena_name, &options.arena)?;
        Self::with_arena(&arena, map_name, &options.map)
    }

    /// Attach to the map `map_name` in an arena that is already mapped.
    pub fn with_arena(arena: &Arena, map_name: &str, options: &MapOptions) -> Result<Self> {
        let map = ShmMap::find_or_construct(arena, map_name, options)?;
        Ok(Store {
            map,
            map_name: map_name.to_owned(),
        })
    }

    pub fn insert(&self, key: impl Display, value: impl Display) -> Result<Upsert> {
        let (key, value) = (key.to_string(), value.to_string());
        self.map.upsert(key.as_bytes(), value.as_bytes())
    }

    pub fn append(&self, key: impl Display, suffix: impl Display) -> Result<()> {
        let (key, suffix) = (key.to_string(), suffix.to_string());
        self.map.append(key.as_bytes(), suffix.as_bytes())
    }

    /// The value of `key`. Invalid UTF-8, only written by other clients of the map, is replaced.
    pub fn find(&self, key: impl Display) -> Result<Option<String>> {
        let value = self.map.find(key.to_string().as_bytes())?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn remove(&self, key: impl Display) -> Result<bool> {
        self.map.remove(key.to_string().as_bytes())
    }

    /// Copies of all entries, taken under one shared lock.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .map
            .entries()?
            .map(|(key, value)| {
                (
                    String::from_utf8_lossy(&key).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect())
    }

    /// Write all entries as `key value` lines. Returns the number of entries written.
    ///
    /// The entries are copied first, the shared lock is not held while writing.
    pub fn dump(&self, mut out: impl io::Write) -> Result<usize> {
        let entries = self.entries()?;
        for (key, value) in &entries {
            writeln!(out, "{key} {value}")?;
        }

        out.flush()?;
        Ok(entries.len())
    }

    /// Destroy the map in the arena, for every process. The arena stays.
    ///
    /// Returns false if it was already destroyed. Afterwards reads through any handle find
    /// nothing and mutations fail; [`Store::create_or_attach`] constructs a new, empty map.
    pub fn destroy(&self) -> Result<bool> {
        self.map.destroy()
    }

    /// Number of entries.
    pub fn size(&self) -> Result<usize> {
        self.map.len()
    }

    /// Free bytes left in the arena. Advisory, other processes allocate concurrently.
    pub fn free_memory(&self) -> usize {
        self.map.arena().free_bytes()
    }

    pub fn bucket_count(&self) -> Result<usize> {
        self.map.bucket_count()
    }

    pub fn map(&self) -> &ShmMap {
        &self.map
    }

    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    pub fn arena(&self) -> &Arena {
        self.map.arena()
    }
}

impl core::fmt::Debug for Store {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Store")
            .field("arena", self.arena())
            .field("map_name", &self.map_name)
            .finish()
    }
}
