//! The hash map as stored in the arena.
//!
//! A bucket array of node offsets with chained nodes. Keys and values are [`ArenaString`]s owned
//! by their node. The whole map is guarded by one process-shared [`RwLock`] next to it; the arena
//! lock is only taken, nested inside the map lock, to allocate or release.
use core::cell::UnsafeCell;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use shm_arena::sync::{ReadGuard, RwLock, WriteGuard};
use shm_arena::{Arena, ArenaError, ArenaObject, ArenaString, Heap, Named, Offset};

use crate::hash::{fnv1a, KeyFold};
use crate::{Error, Result};

const SLOT: usize = core::mem::size_of::<Offset>();

/// Parameters of a newly constructed map. Ignored when attaching to an existing one.
#[derive(Clone, Debug)]
pub struct MapOptions {
    /// Initial number of buckets. The map doubles them once it holds more entries than buckets.
    pub buckets: usize,
    pub fold: KeyFold,
}

impl Default for MapOptions {
    fn default() -> Self {
        MapOptions {
            buckets: 3000,
            fold: KeyFold::Exact,
        }
    }
}

/// What an upsert did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// A handle to a string map in an arena.
pub struct ShmMap {
    root: Named<MapRoot>,
}

#[repr(C)]
struct MapRoot {
    lock: RwLock,
    state: UnsafeCell<MapState>,
    /// Number of entries, only modified under the exclusive lock.
    len: AtomicU64,
    destroyed: AtomicU32,
}

#[repr(C)]
struct MapState {
    buckets: Offset,
    bucket_count: u64,
    /// Written once on construction.
    fold: u32,
    _reserved: u32,
}

#[repr(C)]
struct Node {
    next: Offset,
    hash: u64,
    key: ArenaString,
    value: ArenaString,
}

// Safety: `state` and all nodes are only accessed under `lock`.
unsafe impl Sync for MapRoot {}

unsafe impl ArenaObject for MapRoot {
    const TAG: u64 = fnv1a(b"shm-hashmap::MapRoot/1");

    fn retire(&self, arena: &Arena) -> shm_arena::Result<()> {
        let _guard = self.lock.write().map_err(ArenaError::Lock)?;
        self.destroyed.store(1, Ordering::Release);

        // Safety: we hold the exclusive lock.
        let state = unsafe { &mut *self.state.get() };
        let mut heap = arena.heap()?;

        for index in 0..state.bucket_count {
            let mut cur = unsafe { *slot(arena, state.buckets, index) };
            while cur != 0 {
                let node = arena.at::<Node>(cur).as_ptr();
                unsafe {
                    let next = (*node).next;
                    (*node).key.release(&mut heap)?;
                    (*node).value.release(&mut heap)?;
                    heap.deallocate(cur)?;
                    cur = next;
                }
            }
        }

        if state.buckets != 0 {
            heap.deallocate(state.buckets)?;
        }

        state.buckets = 0;
        state.bucket_count = 0;
        self.len.store(0, Ordering::Release);
        Ok(())
    }
}

impl ShmMap {
    /// Attach to the map called `name` in `arena`, constructing it with `options` if it does not
    /// exist yet.
    pub fn find_or_construct(arena: &Arena, name: &str, options: &MapOptions) -> Result<Self> {
        let buckets = options.buckets.max(1);
        let fold = options.fold;

        let root = arena.find_or_construct::<MapRoot, _>(name, |heap, root| {
            let root = root.as_ptr();
            // Safety: fresh, zeroed storage only we can see.
            unsafe { RwLock::init(addr_of_mut!((*root).lock)) }.map_err(ArenaError::Lock)?;

            let table = heap.allocate_zeroed(buckets.saturating_mul(SLOT))?;
            unsafe {
                addr_of_mut!((*root).state).write(UnsafeCell::new(MapState {
                    buckets: table.offset,
                    bucket_count: buckets as u64,
                    fold: fold.to_raw(),
                    _reserved: 0,
                }));
            }

            tracing::debug!(map = name, buckets, ?fold, "constructed string map");
            Ok(())
        })?;

        Ok(ShmMap { root })
    }

    pub fn arena(&self) -> &Arena {
        self.root.arena()
    }

    /// The key comparison chosen by whoever constructed the map.
    pub fn fold(&self) -> KeyFold {
        // Safety: never written after construction, which happened before we attached.
        KeyFold::from_raw(unsafe { (*self.root.state.get()).fold })
    }

    /// A copy of the value stored under `key`.
    ///
    /// A destroyed map contains nothing.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _guard = self.read()?;
        if self.is_destroyed() {
            return Ok(None);
        }

        // Safety: we hold the shared lock.
        unsafe {
            let arena = self.arena();
            Ok(self
                .lookup(key)
                .map(|(_, node)| (*node).value.as_bytes(arena).to_vec()))
        }
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// Fails if the arena cannot hold the new entry, in which case the map is unchanged.
    pub fn upsert(&self, key: &[u8], value: &[u8]) -> Result<Upsert> {
        let _guard = self.write()?;
        self.check_live()?;

        // Safety: we hold the exclusive lock.
        unsafe {
            if let Some((_, node)) = self.lookup(key) {
                (*node).value.assign(self.arena(), value)?;
                return Ok(Upsert::Replaced);
            }

            self.insert(key, value)?;
        }

        Ok(Upsert::Inserted)
    }

    /// Append `suffix` to the value under `key`, treating a missing key as an empty value.
    ///
    /// Reading and writing the value happen in one critical section, concurrent appends do not
    /// lose each other's suffix.
    pub fn append(&self, key: &[u8], suffix: &[u8]) -> Result<()> {
        let _guard = self.write()?;
        self.check_live()?;

        // Safety: we hold the exclusive lock.
        unsafe {
            match self.lookup(key) {
                Some((_, node)) => (*node).value.push_bytes(self.arena(), suffix)?,
                None => self.insert(key, suffix)?,
            }
        }

        Ok(())
    }

    /// Remove the entry of `key`. Returns whether it existed.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let _guard = self.write()?;
        self.check_live()?;

        // Safety: we hold the exclusive lock.
        unsafe {
            let Some((link, node)) = self.lookup(key) else {
                return Ok(false);
            };

            let offset = *link;
            let mut heap = self.arena().heap()?;
            *link = (*node).next;
            (*node).key.release(&mut heap)?;
            (*node).value.release(&mut heap)?;
            heap.deallocate(offset)?;
        }

        self.root.len.fetch_sub(1, Ordering::Release);
        Ok(true)
    }

    /// Iterate over copies of all entries, in no particular order.
    ///
    /// The iterator holds the shared lock until dropped. Mutating the map from the same thread
    /// meanwhile deadlocks.
    pub fn entries(&self) -> Result<Entries<'_>> {
        let guard = self.read()?;
        // Safety: we hold the shared lock, a destroyed map has no buckets.
        let (table, count) = unsafe {
            let state = &*self.root.state.get();
            (state.buckets, state.bucket_count)
        };

        Ok(Entries {
            map: self,
            _guard: guard,
            table,
            count,
            bucket: 0,
            next: 0,
        })
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        let _guard = self.read()?;
        Ok(self.root.len.load(Ordering::Acquire) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Current number of buckets, zero once destroyed.
    pub fn bucket_count(&self) -> Result<usize> {
        let _guard = self.read()?;
        Ok(unsafe { (*self.root.state.get()).bucket_count } as usize)
    }

    /// Destroy the map for all processes, releasing its entries.
    ///
    /// Returns false if it was already destroyed. Handles attached to it, this one included,
    /// then observe an empty map and fail all mutations with [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<bool> {
        Ok(self.root.destroy()?)
    }

    pub fn is_destroyed(&self) -> bool {
        self.root.destroyed.load(Ordering::Acquire) != 0
    }

    fn read(&self) -> Result<ReadGuard<'_>> {
        self.root
            .lock
            .read()
            .map_err(|err| ArenaError::Lock(err).into())
    }

    fn write(&self) -> Result<WriteGuard<'_>> {
        self.root
            .lock
            .write()
            .map_err(|err| ArenaError::Lock(err).into())
    }

    fn check_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }

        Ok(())
    }

    /// Find the node of `key` and the link pointing to it.
    ///
    /// # Safety
    ///
    /// The caller holds the lock and the map is not destroyed.
    unsafe fn lookup(&self, key: &[u8]) -> Option<(*mut Offset, *mut Node)> {
        let arena = self.arena();
        let fold = self.fold();
        let hash = fold.hash(key);
        let state = &*self.root.state.get();

        let mut link = slot(arena, state.buckets, hash % state.bucket_count);
        while *link != 0 {
            let node = arena.at::<Node>(*link).as_ptr();
            if (*node).hash == hash && fold.eq((*node).key.as_bytes(arena), key) {
                return Some((link, node));
            }

            link = addr_of_mut!((*node).next);
        }

        None
    }

    /// Insert an entry whose key is known to be absent.
    ///
    /// # Safety
    ///
    /// The caller holds the exclusive lock and the map is not destroyed.
    unsafe fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let arena = self.arena();
        let hash = self.fold().hash(key);
        let state = &mut *self.root.state.get();
        let mut heap = arena.heap()?;

        // Everything is allocated before anything is linked.
        let mut key = ArenaString::new_in(&mut heap, key)?;
        let mut value = match ArenaString::new_in(&mut heap, value) {
            Ok(value) => value,
            Err(err) => {
                key.release(&mut heap)?;
                return Err(err.into());
            }
        };

        let node = match heap.allocate(core::mem::size_of::<Node>()) {
            Ok(node) => node.offset,
            Err(err) => {
                key.release(&mut heap)?;
                value.release(&mut heap)?;
                return Err(err.into());
            }
        };

        let head = slot(arena, state.buckets, hash % state.bucket_count);
        arena.at::<Node>(node).as_ptr().write(Node {
            next: *head,
            hash,
            key,
            value,
        });
        *head = node;

        let len = self.root.len.fetch_add(1, Ordering::Release) + 1;
        if len > state.bucket_count {
            grow(arena, &mut heap, state)?;
        }

        Ok(())
    }
}

/// Double the bucket array. Skipped when the arena cannot fit a bigger one, chains just get
/// longer then.
///
/// # Safety
///
/// The caller holds the exclusive lock of the map owning `state`.
unsafe fn grow(arena: &Arena, heap: &mut Heap<'_>, state: &mut MapState) -> Result<()> {
    let count = state.bucket_count * 2;
    let table = match heap.allocate_zeroed(count as usize * SLOT) {
        Ok(table) => table.offset,
        Err(err) => {
            tracing::debug!(error = %err, buckets = state.bucket_count, "not growing the bucket array");
            return Ok(());
        }
    };

    for index in 0..state.bucket_count {
        let mut cur = *slot(arena, state.buckets, index);
        while cur != 0 {
            let node = arena.at::<Node>(cur).as_ptr();
            let next = (*node).next;
            let head = slot(arena, table, (*node).hash % count);
            (*node).next = *head;
            *head = cur;
            cur = next;
        }
    }

    let old = core::mem::replace(&mut state.buckets, table);
    state.bucket_count = count;
    heap.deallocate(old)?;

    tracing::debug!(buckets = count, "grew the bucket array");
    Ok(())
}

fn slot(arena: &Arena, table: Offset, index: u64) -> *mut Offset {
    arena.at::<Offset>(table + index * SLOT as u64).as_ptr()
}

/// Copies of the entries of a map, see [`ShmMap::entries`].
pub struct Entries<'lt> {
    map: &'lt ShmMap,
    _guard: ReadGuard<'lt>,
    table: Offset,
    count: u64,
    bucket: u64,
    next: Offset,
}

impl Iterator for Entries<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let arena = self.map.arena();

        while self.next == 0 {
            if self.bucket >= self.count {
                return None;
            }

            // Safety: we hold the shared lock.
            self.next = unsafe { *slot(arena, self.table, self.bucket) };
            self.bucket += 1;
        }

        let node = arena.at::<Node>(self.next).as_ptr();
        // Safety: we hold the shared lock.
        unsafe {
            self.next = (*node).next;
            Some((
                (*node).key.as_bytes(arena).to_vec(),
                (*node).value.as_bytes(arena).to_vec(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(capacity: usize, options: &MapOptions) -> ShmMap {
        let arena = Arena::anonymous(capacity).unwrap();
        ShmMap::find_or_construct(&arena, "map", options).unwrap()
    }

    #[test]
    fn upsert_find_remove() {
        let map = map(1 << 16, &MapOptions::default());

        assert_eq!(map.upsert(b"k", b"v1").unwrap(), Upsert::Inserted);
        assert_eq!(map.upsert(b"k", b"v2").unwrap(), Upsert::Replaced);
        assert_eq!(map.find(b"k").unwrap().as_deref(), Some(&b"v2"[..]));
        assert_eq!(map.find(b"missing").unwrap(), None);
        assert_eq!(map.len().unwrap(), 1);

        assert!(map.remove(b"k").unwrap());
        assert!(!map.remove(b"k").unwrap());
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn grows_past_load_factor() {
        let map = map(1 << 16, &MapOptions { buckets: 2, ..MapOptions::default() });

        for i in 0..20 {
            map.upsert(format!("key{i}").as_bytes(), b"x").unwrap();
        }

        assert_eq!(map.bucket_count().unwrap(), 32);
        for i in 0..20 {
            assert!(map.find(format!("key{i}").as_bytes()).unwrap().is_some());
        }
        assert_eq!(map.entries().unwrap().count(), 20);
    }

    #[test]
    fn remove_returns_space() {
        let map = map(1 << 16, &MapOptions::default());
        let before = map.arena().free_bytes();

        map.upsert(b"some key", b"some value").unwrap();
        map.append(b"some key", b" and more").unwrap();
        assert!(map.arena().free_bytes() < before);

        map.remove(b"some key").unwrap();
        assert_eq!(map.arena().free_bytes(), before);
    }

    #[test]
    fn case_insensitive_keys() {
        let map = map(
            1 << 16,
            &MapOptions {
                fold: KeyFold::AsciiCaseInsensitive,
                ..MapOptions::default()
            },
        );

        map.upsert(b"Color", b"red").unwrap();
        assert_eq!(map.upsert(b"COLOR", b"blue").unwrap(), Upsert::Replaced);
        assert_eq!(map.find(b"color").unwrap().as_deref(), Some(&b"blue"[..]));
        assert_eq!(map.len().unwrap(), 1);
    }

    #[test]
    fn destroyed_map_is_empty_and_frozen() {
        let map = map(1 << 16, &MapOptions::default());
        map.upsert(b"k", b"v").unwrap();

        assert!(map.destroy().unwrap());
        assert!(!map.destroy().unwrap());
        assert_eq!(map.find(b"k").unwrap(), None);
        assert_eq!(map.len().unwrap(), 0);
        assert_eq!(map.entries().unwrap().count(), 0);
        assert!(matches!(map.upsert(b"k", b"v"), Err(Error::Destroyed)));
        assert!(matches!(map.append(b"k", b"v"), Err(Error::Destroyed)));
        assert!(matches!(map.remove(b"k"), Err(Error::Destroyed)));
    }
}
