//! Layout of the mapped region.
//!
//! ```text
//! 0          HEADER_SIZE                                          capacity
//! ┌──────────┬──────────────────────────────────────────────────────┐
//! │ header   │ heap: [block hdr | payload] [block hdr | payload] .. │
//! └──────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! All references between objects are [`Offset`]s from the start of the region, never pointers,
//! as every process maps the region at its own address. Offset `0` is the header itself and is
//! used as the null offset.
use core::cell::UnsafeCell;
use core::ptr::{addr_of_mut, NonNull};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::io;

use crate::heap::{BlockHeader, ALIGN};
use crate::sync::RobustMutex;
use crate::Offset;

pub(crate) const MAGIC: [u8; 8] = *b"SHMARENA";
pub(crate) const VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: usize = 256;

const STATE_READY: u32 = 1;

/// Smallest capacity accepted, a header and a handful of blocks.
pub const MIN_CAPACITY: usize = HEADER_SIZE + 1024;

const _: () = assert!(core::mem::size_of::<ArenaHeader>() <= HEADER_SIZE);

#[repr(C)]
pub(crate) struct ArenaHeader {
    magic: UnsafeCell<[u8; 8]>,
    version: AtomicU32,
    /// Written last by the creator, with release ordering.
    state: AtomicU32,
    capacity: AtomicU64,
    /// Sum of all free block sizes, readable without the lock.
    pub(crate) free_bytes: AtomicU64,
    /// Guards `heap`: the free list and the object directory.
    pub(crate) gate: RobustMutex,
    pub(crate) heap: UnsafeCell<HeapState>,
}

#[repr(C)]
pub(crate) struct HeapState {
    /// First free block, ordered by address.
    pub(crate) free_head: Offset,
    pub(crate) start: Offset,
    pub(crate) end: Offset,
    /// First entry of the named object directory.
    pub(crate) directory: Offset,
    pub(crate) objects: u64,
}

/// A view of the mapped bytes. Does not own the mapping.
#[derive(Clone, Copy)]
pub(crate) struct Segment {
    base: NonNull<u8>,
    len: usize,
}

// Safety: a segment is a plain address range, synchronization is up to its users.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// # Safety
    ///
    /// `base` is aligned to at least `ALIGN`, valid for reads and writes of `len` bytes for as
    /// long as the segment or anything derived from it is used, and `len >= HEADER_SIZE`.
    pub(crate) unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        debug_assert!(len >= HEADER_SIZE);
        debug_assert_eq!(base.as_ptr() as usize % ALIGN, 0);
        Segment { base, len }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn header(&self) -> &ArenaHeader {
        // Safety: the header fits, see `new`, and consists of atomics and cells.
        unsafe { &*(self.base.as_ptr() as *const ArenaHeader) }
    }

    /// Resolve an offset to a pointer to a `T`.
    ///
    /// Panics if the value would not be in bounds or misaligned, which only happens on corrupt
    /// bookkeeping.
    pub(crate) fn at<T>(&self, offset: Offset) -> NonNull<T> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.checked_add(core::mem::size_of::<T>());
        assert!(
            matches!(end, Some(end) if end <= self.len) && start % core::mem::align_of::<T>() == 0,
            "offset {offset:#x} out of bounds of the arena"
        );

        // Safety: in bounds of the allocation, checked above.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start).cast()) }
    }

    /// Resolve a byte range.
    pub(crate) fn bytes(&self, offset: Offset, len: usize) -> *mut u8 {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.len),
            "range {offset:#x}+{len} out of bounds of the arena"
        );

        // Safety: in bounds of the allocation, checked above.
        unsafe { self.base.as_ptr().add(start) }
    }

    /// Write a fresh header and a heap consisting of one free block.
    ///
    /// # Safety
    ///
    /// No other thread or process may access the segment until `publish` is called.
    pub(crate) unsafe fn format(&self) -> io::Result<()> {
        let header = self.base.as_ptr() as *mut ArenaHeader;

        RobustMutex::init(addr_of_mut!((*header).gate))?;

        let start = HEADER_SIZE as Offset;
        let end = (self.len - self.len % ALIGN) as Offset;

        let block = self.at::<BlockHeader>(start).as_ptr();
        block.write(BlockHeader {
            size: end - start,
            link: 0,
        });

        (*header).heap.get().write(HeapState {
            free_head: start,
            start,
            end,
            directory: 0,
            objects: 0,
        });

        (*header).free_bytes.store(end - start, Ordering::Relaxed);
        (*header).capacity.store(self.len as u64, Ordering::Relaxed);
        (*header).version.store(VERSION, Ordering::Relaxed);
        (*header).magic.get().write(MAGIC);

        Ok(())
    }

    /// Mark the segment as ready for other processes.
    pub(crate) fn publish(&self) {
        self.header().state.store(STATE_READY, Ordering::Release);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.header().state.load(Ordering::Acquire) == STATE_READY
    }

    /// Check a published header against this build's layout.
    pub(crate) fn is_compatible(&self) -> bool {
        let header = self.header();
        // Safety: only read after `is_ready`, the creator does not write it again.
        let magic = unsafe { *header.magic.get() };

        magic == MAGIC
            && header.version.load(Ordering::Relaxed) == VERSION
            && header.capacity.load(Ordering::Relaxed) == self.len as u64
    }
}

#[cfg(test)]
pub(crate) fn leaked_segment(len: usize) -> Segment {
    #[derive(Clone, Copy)]
    #[repr(C, align(16))]
    struct Chunk([u8; 16]);

    let words = vec![Chunk([0; 16]); len / 16].into_boxed_slice();
    let raw = Box::leak(words);
    let base = NonNull::new(raw.as_mut_ptr() as *mut u8).unwrap();

    unsafe {
        let segment = Segment::new(base, len - len % 16);
        segment.format().unwrap();
        segment.publish();
        segment
    }
}

#[test]
fn formatted_segment_is_compatible() {
    let segment = leaked_segment(4096);
    assert!(segment.is_ready());
    assert!(segment.is_compatible());
    assert_eq!(
        segment.header().free_bytes.load(Ordering::Relaxed),
        (4096 - HEADER_SIZE) as u64
    );
}
