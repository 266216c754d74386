use crate::heap::Heap;
use crate::{Arena, Offset, Result};

/// A byte string stored in the arena.
///
/// The descriptor itself lives wherever its owner put it, usually inside another arena object.
/// It carries no lock: all access goes through the owner's lock, all allocation through the
/// arena lock.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaString {
    offset: Offset,
    len: u64,
    cap: u64,
}

impl ArenaString {
    /// The empty string, which owns no allocation.
    pub const EMPTY: ArenaString = ArenaString {
        offset: 0,
        len: 0,
        cap: 0,
    };

    /// Copy `bytes` into a fresh allocation.
    pub fn new_in(heap: &mut Heap<'_>, bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::EMPTY);
        }

        let allocation = heap.allocate(bytes.len())?;
        let dst = heap.segment().bytes(allocation.offset, bytes.len());
        // Safety: the allocation is ours and large enough.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };

        Ok(ArenaString {
            offset: allocation.offset,
            len: bytes.len() as u64,
            cap: allocation.capacity as u64,
        })
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bytes of the string.
    ///
    /// # Safety
    ///
    /// The string belongs to `arena` and the caller holds the owner's lock for as long as the
    /// slice is used.
    pub unsafe fn as_bytes<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }

        let ptr = arena.bytes(self.offset, self.len());
        core::slice::from_raw_parts(ptr.as_ptr(), self.len())
    }

    /// Replace the contents.
    ///
    /// Reuses the allocation when the new value fits. Otherwise the new value is allocated before
    /// the old one is released, so on failure the string is unchanged.
    ///
    /// # Safety
    ///
    /// The string belongs to `arena` and the caller holds the owner's lock exclusively.
    pub unsafe fn assign(&mut self, arena: &Arena, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 <= self.cap {
            if !bytes.is_empty() {
                let dst = arena.bytes(self.offset, bytes.len());
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
            }

            self.len = bytes.len() as u64;
            return Ok(());
        }

        let mut heap = arena.heap()?;
        let fresh = Self::new_in(&mut heap, bytes)?;
        if let Err(err) = self.release(&mut heap) {
            heap.deallocate(fresh.offset)?;
            return Err(err);
        }

        *self = fresh;
        Ok(())
    }

    /// Append to the contents, growing the allocation if needed.
    ///
    /// On failure the string is unchanged.
    ///
    /// # Safety
    ///
    /// The string belongs to `arena` and the caller holds the owner's lock exclusively.
    pub unsafe fn push_bytes(&mut self, arena: &Arena, suffix: &[u8]) -> Result<()> {
        if suffix.is_empty() {
            return Ok(());
        }

        let len = self.len();
        let total = len + suffix.len();

        if total as u64 <= self.cap {
            let dst = arena.bytes(self.offset + self.len, suffix.len());
            core::ptr::copy_nonoverlapping(suffix.as_ptr(), dst.as_ptr(), suffix.len());
            self.len = total as u64;
            return Ok(());
        }

        let mut heap = arena.heap()?;
        let allocation = heap.allocate(total)?;
        let dst = heap.segment().bytes(allocation.offset, total);
        if len > 0 {
            let src = heap.segment().bytes(self.offset, len);
            core::ptr::copy_nonoverlapping(src, dst, len);
        }
        core::ptr::copy_nonoverlapping(suffix.as_ptr(), dst.add(len), suffix.len());

        if let Err(err) = self.release(&mut heap) {
            heap.deallocate(allocation.offset)?;
            return Err(err);
        }

        *self = ArenaString {
            offset: allocation.offset,
            len: total as u64,
            cap: allocation.capacity as u64,
        };
        Ok(())
    }

    /// Give the allocation back and become empty.
    pub fn release(&mut self, heap: &mut Heap<'_>) -> Result<()> {
        if self.offset != 0 {
            heap.deallocate(self.offset)?;
        }

        *self = Self::EMPTY;
        Ok(())
    }
}
