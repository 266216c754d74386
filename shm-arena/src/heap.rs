//! The free-space allocator of the arena.
//!
//! A first-fit allocator over an address ordered free list, splitting blocks on allocation and
//! coalescing neighbours on release. Every block, free or used, starts with a [`BlockHeader`].
//! The header of a used block carries the `USED` mark in place of the free list link, which
//! catches double frees and stray offsets.
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use std::io;

use crate::segment::{HeapState, Segment};
use crate::sync::MutexGuard;
use crate::{ArenaError, Offset, Result};

pub(crate) const ALIGN: usize = 16;

const HDR: u64 = core::mem::size_of::<BlockHeader>() as u64;
const MIN_BLOCK: u64 = 2 * HDR;
const USED: u64 = u64::from_le_bytes(*b"usedblok");

#[repr(C)]
pub(crate) struct BlockHeader {
    /// Size of the whole block, header included. A multiple of `ALIGN`.
    pub(crate) size: u64,
    /// Next free block for free blocks, `USED` otherwise.
    pub(crate) link: u64,
}

/// A fresh allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Offset of the first payload byte, aligned to 16.
    pub offset: Offset,
    /// Usable bytes, at least the requested amount.
    pub capacity: usize,
}

/// Exclusive access to the heap, holding the arena lock.
///
/// The arena lock guards allocation and the object directory only. Data inside allocations is
/// guarded by whatever lock its owner uses.
pub struct Heap<'lt> {
    seg: Segment,
    _gate: MutexGuard<'lt>,
}

impl<'lt> Heap<'lt> {
    pub(crate) fn lock(seg: &'lt Segment) -> io::Result<Self> {
        let gate = seg.header().gate.lock()?;
        Ok(Heap { seg: *seg, _gate: gate })
    }

    pub fn allocate(&mut self, size: usize) -> Result<Allocation> {
        let seg = self.seg;
        let Some(need) = block_size(size) else {
            return Err(self.out_of_memory(size));
        };

        // Safety: we hold the gate.
        let state = unsafe { &mut *self.state() };
        let mut prev: Offset = 0;
        let mut cur = state.free_head;

        while cur != 0 {
            let block = seg.at::<BlockHeader>(cur).as_ptr();
            // Safety: `cur` is on the free list, hence the start of a block.
            let (size_here, next) = unsafe { ((*block).size, (*block).link) };

            if size_here >= need {
                let replacement = if size_here - need >= MIN_BLOCK {
                    let rest = cur + need;
                    unsafe {
                        seg.at::<BlockHeader>(rest).as_ptr().write(BlockHeader {
                            size: size_here - need,
                            link: next,
                        });
                        (*block).size = need;
                    }
                    rest
                } else {
                    next
                };

                self.relink(state, prev, replacement);

                let taken = unsafe {
                    (*block).link = USED;
                    (*block).size
                };

                seg.header().free_bytes.fetch_sub(taken, Ordering::Relaxed);
                return Ok(Allocation {
                    offset: cur + HDR,
                    capacity: (taken - HDR) as usize,
                });
            }

            prev = cur;
            cur = next;
        }

        let err = self.out_of_memory(size);
        tracing::debug!(requested = size, free = self.free_bytes(), "arena allocation failed");
        Err(err)
    }

    /// Allocate and zero the whole payload.
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<Allocation> {
        let allocation = self.allocate(size)?;
        let bytes = self.seg.bytes(allocation.offset, allocation.capacity);
        // Safety: the payload is ours.
        unsafe { core::ptr::write_bytes(bytes, 0, allocation.capacity) };
        Ok(allocation)
    }

    /// Return an allocation to the free list.
    pub fn deallocate(&mut self, offset: Offset) -> Result<()> {
        let seg = self.seg;
        // Safety: we hold the gate.
        let state = unsafe { &mut *self.state() };

        if offset < state.start + HDR || offset >= state.end || offset % ALIGN as u64 != 0 {
            return Err(ArenaError::Corrupt("release of an offset outside the heap"));
        }

        let at = offset - HDR;
        let block = seg.at::<BlockHeader>(at).as_ptr();

        unsafe {
            if (*block).link != USED {
                return Err(ArenaError::Corrupt("release of a block that is not allocated"));
            }

            let released = (*block).size;

            let mut prev: Offset = 0;
            let mut next = state.free_head;
            while next != 0 && next < at {
                prev = next;
                next = (*seg.at::<BlockHeader>(next).as_ptr()).link;
            }

            (*block).link = next;
            if next != 0 && at + (*block).size == next {
                let following = seg.at::<BlockHeader>(next).as_ptr();
                (*block).size += (*following).size;
                (*block).link = (*following).link;
            }

            if prev == 0 {
                state.free_head = at;
            } else {
                let preceding = seg.at::<BlockHeader>(prev).as_ptr();
                if prev + (*preceding).size == at {
                    (*preceding).size += (*block).size;
                    (*preceding).link = (*block).link;
                } else {
                    (*preceding).link = at;
                }
            }

            seg.header().free_bytes.fetch_add(released, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Bytes on the free list, block headers included.
    pub fn free_bytes(&self) -> usize {
        self.seg.header().free_bytes.load(Ordering::Relaxed) as usize
    }

    /// Resolve an offset inside the arena, see [`crate::Arena::at`].
    pub fn at<T>(&self, offset: Offset) -> NonNull<T> {
        self.seg.at(offset)
    }

    pub(crate) fn segment(&self) -> Segment {
        self.seg
    }

    pub(crate) fn state(&self) -> *mut HeapState {
        self.seg.header().heap.get()
    }

    fn relink(&self, state: &mut HeapState, prev: Offset, to: Offset) {
        if prev == 0 {
            state.free_head = to;
        } else {
            // Safety: `prev` is a free block, we hold the gate.
            unsafe { (*self.seg.at::<BlockHeader>(prev).as_ptr()).link = to };
        }
    }

    fn out_of_memory(&self, requested: usize) -> ArenaError {
        ArenaError::OutOfMemory {
            requested,
            free: self.free_bytes(),
        }
    }

    #[cfg(test)]
    fn free_blocks(&self) -> Vec<(Offset, u64)> {
        let mut blocks = vec![];
        let mut cur = unsafe { (*self.state()).free_head };
        while cur != 0 {
            let block = self.seg.at::<BlockHeader>(cur).as_ptr();
            unsafe {
                blocks.push((cur, (*block).size));
                cur = (*block).link;
            }
        }
        blocks
    }
}

fn block_size(payload: usize) -> Option<u64> {
    let mask = ALIGN as u64 - 1;
    let total = u64::try_from(payload).ok()?.checked_add(HDR + mask)? & !mask;
    Some(total.max(MIN_BLOCK))
}
