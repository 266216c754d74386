//! Named objects: at most one object per name and arena.
//!
//! The directory is a singly linked list of entries in the heap, each holding the name, a type
//! tag and the offset of the object. Lookups and construction happen under the arena lock, which
//! makes `find_or_construct` a compare-and-allocate: of several racing processes exactly one
//! constructs, every other one attaches to its object.
//!
//! Entries count the handles attached to them. Destroying an object removes its name right away,
//! so the name can be reused, but its storage is only released once the last handle detached.
//! A process that dies with handles open leaks their counts, and with it the storage of an object
//! destroyed later.
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::heap::{Heap, ALIGN};
use crate::{Arena, ArenaError, Offset, Result};

/// A type that can be placed in the arena as a named object.
///
/// # Safety
///
/// The type must be `#[repr(C)]`, contain no pointers or references (only [`Offset`]s), be valid
/// when all bytes are zero, and synchronize all interior mutation with primitives that work
/// across processes. Its alignment must not exceed 16.
pub unsafe trait ArenaObject: Sync {
    /// Identifies the type and layout, checked when attaching by name.
    const TAG: u64;

    /// Release everything the object owns in the arena.
    ///
    /// Called once, when the object is destroyed. The object's own storage is released later,
    /// after the last handle detached, so concurrent users must observe a consistent, empty
    /// object afterwards.
    fn retire(&self, arena: &Arena) -> Result<()>;
}

/// A handle to a named object, keeping its storage alive.
pub struct Named<T: ArenaObject> {
    arena: Arena,
    entry: Offset,
    object: NonNull<T>,
    _marker: PhantomData<T>,
}

// Safety: `T: ArenaObject` synchronizes across processes, so also across threads.
unsafe impl<T: ArenaObject> Send for Named<T> {}
unsafe impl<T: ArenaObject> Sync for Named<T> {}

#[repr(C)]
struct DirEntry {
    next: Offset,
    object: Offset,
    tag: u64,
    refs: u64,
    retired: u64,
    name_len: u64,
}

const ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();

impl Arena {
    /// Attach to the object called `name`, or construct it.
    ///
    /// `init` runs only when no object of that name exists, under the arena lock, on zeroed
    /// storage. Whatever it allocates must be released again if it fails.
    pub fn find_or_construct<T, F>(&self, name: &str, init: F) -> Result<Named<T>>
    where
        T: ArenaObject,
        F: FnOnce(&mut Heap<'_>, NonNull<T>) -> Result<()>,
    {
        assert!(
            core::mem::align_of::<T>() <= ALIGN,
            "named objects are at most 16 byte aligned"
        );

        let mut heap = self.heap()?;
        if let Some((_, entry)) = lookup(&heap, name.as_bytes()) {
            return self.attach_entry::<T>(&mut heap, entry, name);
        }

        let entry = heap.allocate(ENTRY_SIZE + name.len())?.offset;
        let object = match heap.allocate_zeroed(core::mem::size_of::<T>()) {
            Ok(object) => object.offset,
            Err(err) => {
                heap.deallocate(entry)?;
                return Err(err);
            }
        };

        let ptr = heap.at::<T>(object);
        if let Err(err) = init(&mut heap, ptr) {
            heap.deallocate(object)?;
            heap.deallocate(entry)?;
            return Err(err);
        }

        let state = heap.state();
        // Safety: we hold the gate, both allocations are ours.
        unsafe {
            heap.at::<DirEntry>(entry).as_ptr().write(DirEntry {
                next: (*state).directory,
                object,
                tag: T::TAG,
                refs: 1,
                retired: 0,
                name_len: name.len() as u64,
            });

            let bytes = heap.segment().bytes(entry + ENTRY_SIZE as u64, name.len());
            core::ptr::copy_nonoverlapping(name.as_ptr(), bytes, name.len());

            (*state).directory = entry;
            (*state).objects += 1;
        }

        tracing::info!(arena = self.name(), object = name, "constructed named object");
        Ok(Named {
            arena: self.clone(),
            entry,
            object: ptr,
            _marker: PhantomData,
        })
    }

    /// Attach to the object called `name`, if it exists.
    pub fn find<T: ArenaObject>(&self, name: &str) -> Result<Option<Named<T>>> {
        let mut heap = self.heap()?;
        match lookup(&heap, name.as_bytes()) {
            Some((_, entry)) => self.attach_entry(&mut heap, entry, name).map(Some),
            None => Ok(None),
        }
    }

    /// Destroy the object called `name`. Returns whether it existed.
    ///
    /// The arena itself is unaffected; the name is free for a new object immediately.
    pub fn destroy_object<T: ArenaObject>(&self, name: &str) -> Result<bool> {
        // The temporary handle keeps the storage alive while retiring.
        let Some(named) = self.find::<T>(name)? else {
            return Ok(false);
        };

        named.destroy()
    }

    /// Names of all live objects, in no particular order.
    pub fn object_names(&self) -> Result<Vec<String>> {
        let heap = self.heap()?;
        let mut names = vec![];
        let mut cur = unsafe { (*heap.state()).directory };

        while cur != 0 {
            let entry = heap.at::<DirEntry>(cur).as_ptr();
            // Safety: directory entries are only modified under the gate, which we hold.
            unsafe {
                names.push(String::from_utf8_lossy(entry_name(&heap, cur)).into_owned());
                cur = (*entry).next;
            }
        }

        Ok(names)
    }

    fn attach_entry<T: ArenaObject>(
        &self,
        heap: &mut Heap<'_>,
        entry: Offset,
        name: &str,
    ) -> Result<Named<T>> {
        let ptr = heap.at::<DirEntry>(entry).as_ptr();

        // Safety: we hold the gate.
        unsafe {
            if (*ptr).tag != T::TAG {
                return Err(ArenaError::TypeMismatch {
                    name: name.to_owned(),
                });
            }

            (*ptr).refs += 1;
            Ok(Named {
                arena: self.clone(),
                entry,
                object: heap.at::<T>((*ptr).object),
                _marker: PhantomData,
            })
        }
    }
}

impl<T: ArenaObject> Named<T> {
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Destroy this object, unless someone else already did. Returns whether it was destroyed
    /// by this call.
    pub fn destroy(&self) -> Result<bool> {
        {
            let heap = self.arena.heap()?;
            let ptr = heap.at::<DirEntry>(self.entry).as_ptr();

            // Safety: we hold the gate.
            unsafe {
                if (*ptr).retired != 0 {
                    return Ok(false);
                }

                unlink(&heap, self.entry)?;
                (*ptr).retired = 1;
                (*heap.state()).objects -= 1;
            }
        }

        // Retiring takes the object's own lock, which must never be requested under the arena
        // lock.
        T::retire(self, &self.arena)?;
        tracing::info!(arena = self.arena.name(), "destroyed named object");
        Ok(true)
    }

    /// Whether the object was destroyed through any handle.
    pub fn is_destroyed(&self) -> Result<bool> {
        let heap = self.arena.heap()?;
        let ptr = heap.at::<DirEntry>(self.entry).as_ptr();
        Ok(unsafe { (*ptr).retired != 0 })
    }

    fn detach(&mut self) -> Result<()> {
        let mut heap = self.arena.heap()?;
        let ptr = heap.at::<DirEntry>(self.entry).as_ptr();

        // Safety: we hold the gate.
        let (refs, retired, object) = unsafe {
            (*ptr).refs = (*ptr).refs.saturating_sub(1);
            ((*ptr).refs, (*ptr).retired != 0, (*ptr).object)
        };

        if refs == 0 && retired {
            heap.deallocate(object)?;
            heap.deallocate(self.entry)?;
        }

        Ok(())
    }
}

impl<T: ArenaObject> core::ops::Deref for Named<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the storage lives until the last handle, this one included, detached.
        unsafe { self.object.as_ref() }
    }
}

impl<T: ArenaObject> Drop for Named<T> {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            tracing::error!(error = %err, "failed to detach from named object");
        }
    }
}

/// Find a live entry by name. Returns its predecessor (or 0) and itself.
fn lookup(heap: &Heap<'_>, name: &[u8]) -> Option<(Offset, Offset)> {
    let mut prev = 0;
    let mut cur = unsafe { (*heap.state()).directory };

    while cur != 0 {
        // Safety: directory entries are only modified under the gate, which the heap holds.
        unsafe {
            if entry_name(heap, cur) == name {
                return Some((prev, cur));
            }

            prev = cur;
            cur = (*heap.at::<DirEntry>(cur).as_ptr()).next;
        }
    }

    None
}

/// Remove an entry from the directory.
///
/// # Safety
///
/// The heap holds the gate, `entry` is a directory entry.
unsafe fn unlink(heap: &Heap<'_>, entry: Offset) -> Result<()> {
    let state = heap.state();
    let next = (*heap.at::<DirEntry>(entry).as_ptr()).next;

    if (*state).directory == entry {
        (*state).directory = next;
        return Ok(());
    }

    let mut cur = (*state).directory;
    while cur != 0 {
        let ptr = heap.at::<DirEntry>(cur).as_ptr();
        if (*ptr).next == entry {
            (*ptr).next = next;
            return Ok(());
        }

        cur = (*ptr).next;
    }

    Err(ArenaError::Corrupt("live named object missing from the directory"))
}

/// # Safety
///
/// The heap holds the gate, `entry` is a directory entry.
unsafe fn entry_name<'h>(heap: &'h Heap<'_>, entry: Offset) -> &'h [u8] {
    let len = (*heap.at::<DirEntry>(entry).as_ptr()).name_len as usize;
    let bytes = heap.segment().bytes(entry + ENTRY_SIZE as u64, len);
    core::slice::from_raw_parts(bytes, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    #[repr(C)]
    struct Counter {
        value: AtomicU64,
        payload: AtomicU64,
    }

    unsafe impl ArenaObject for Counter {
        const TAG: u64 = u64::from_le_bytes(*b"counter1");

        fn retire(&self, arena: &Arena) -> Result<()> {
            let payload = self.payload.swap(0, Ordering::AcqRel);
            if payload != 0 {
                arena.heap()?.deallocate(payload)?;
            }
            Ok(())
        }
    }

    #[repr(C)]
    struct Other {
        value: AtomicU64,
    }

    unsafe impl ArenaObject for Other {
        const TAG: u64 = u64::from_le_bytes(*b"other--1");

        fn retire(&self, _: &Arena) -> Result<()> {
            Ok(())
        }
    }

    fn counter(arena: &Arena, name: &str, start: u64) -> Named<Counter> {
        arena
            .find_or_construct::<Counter, _>(name, |heap, ptr| {
                let payload = heap.allocate(128)?;
                unsafe {
                    (*ptr.as_ptr()).value.store(start, Ordering::Relaxed);
                    (*ptr.as_ptr()).payload.store(payload.offset, Ordering::Relaxed);
                }
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn construct_once() {
        let arena = Arena::anonymous(1 << 16).unwrap();
        let first = counter(&arena, "counter", 7);
        let second = counter(&arena, "counter", 99);

        assert_eq!(second.value.load(Ordering::Relaxed), 7);
        first.value.store(8, Ordering::Relaxed);
        assert_eq!(second.value.load(Ordering::Relaxed), 8);
        assert_eq!(arena.object_names().unwrap(), ["counter"]);
    }

    #[test]
    fn type_is_checked() {
        let arena = Arena::anonymous(1 << 16).unwrap();
        let _counter = counter(&arena, "thing", 0);

        let err = arena.find::<Other>("thing").map(|_| ()).unwrap_err();
        assert!(matches!(err, ArenaError::TypeMismatch { .. }));
    }

    #[test]
    fn destroy_keeps_storage_until_detached() {
        let arena = Arena::anonymous(1 << 16).unwrap();
        let before = arena.free_bytes();

        let handle = counter(&arena, "counter", 1);
        let during = arena.free_bytes();
        assert!(during < before);

        assert!(arena.destroy_object::<Counter>("counter").unwrap());
        assert!(!arena.destroy_object::<Counter>("counter").unwrap());
        assert!(handle.is_destroyed().unwrap());
        assert!(!handle.destroy().unwrap());
        assert!(arena.find::<Counter>("counter").unwrap().is_none());
        assert!(arena.object_names().unwrap().is_empty());

        // The payload went with `retire`, the object itself is still attached.
        assert!(arena.free_bytes() < before);
        drop(handle);
        assert_eq!(arena.free_bytes(), before);
    }

    #[test]
    fn name_is_reusable_after_destroy() {
        let arena = Arena::anonymous(1 << 16).unwrap();
        let old = counter(&arena, "counter", 1);
        assert!(old.destroy().unwrap());

        let new = counter(&arena, "counter", 2);
        assert_eq!(new.value.load(Ordering::Relaxed), 2);
        assert_eq!(old.value.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failed_construction_leaves_nothing() {
        let arena = Arena::anonymous(1 << 16).unwrap();
        let before = arena.free_bytes();

        let err = arena
            .find_or_construct::<Counter, _>("huge", |heap, _| {
                heap.allocate(1 << 20)?;
                Ok(())
            })
            .map(|_| ())
            .unwrap_err();

        assert!(err.is_out_of_memory());
        assert_eq!(arena.free_bytes(), before);
        assert!(arena.find::<Counter>("huge").unwrap().is_none());
    }
}
