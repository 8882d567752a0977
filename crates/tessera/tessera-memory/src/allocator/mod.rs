//! The allocator contract.
//!
//! An allocator carves blocks out of a backend's data region and hands them
//! out as [`OffsetPointer`]s. Converting an offset to an address is pure
//! arithmetic against this process's mapping of the backend, so the same
//! offset names the same bytes in every process.

mod stack;

pub use stack::StackAllocator;

use crate::backend::MemoryBackend;
use crate::error::{MemoryError, Result};
use crate::pointer::{AllocatorId, OffsetPointer, Pointer};
use std::mem::{align_of, size_of};
use std::ptr;

/// Alignment used by [`Allocator::allocate`].
pub const DEFAULT_ALIGN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorType {
    Stack,
}

pub trait Allocator: Send + Sync {
    fn id(&self) -> AllocatorId;

    fn kind(&self) -> AllocatorType;

    /// The backend whose data region this allocator manages.
    fn backend(&self) -> &dyn MemoryBackend;

    /// Reserve `size` bytes aligned to `align` (a power of two).
    ///
    /// Fails with [`crate::MemoryError::OutOfMemory`] when the region is exhausted.
    fn aligned_allocate(&self, size: usize, align: usize) -> Result<OffsetPointer>;

    /// Release a block. Freeing the null offset is a no-op.
    fn free(&self, p: OffsetPointer);

    /// Offset of the custom header reserved at creation (null if none).
    fn custom_header(&self) -> OffsetPointer;

    /// Bytes currently handed out, block headers included.
    fn allocated_bytes(&self) -> usize;

    fn allocate(&self, size: usize) -> Result<OffsetPointer> {
        self.aligned_allocate(size, DEFAULT_ALIGN)
    }

    /// Base address of the data region in this process.
    #[inline]
    fn base(&self) -> *mut u8 {
        self.backend().data_ptr()
    }

    /// True when `p` lies inside the data region.
    fn contains(&self, p: OffsetPointer) -> bool {
        !p.is_null() && (p.get() as usize) < self.backend().data_size()
    }
}

impl dyn Allocator + '_ {
    /// Translate an offset into an address in this process. Null maps to null.
    #[inline]
    pub fn convert<T>(&self, p: OffsetPointer) -> *mut T {
        if p.is_null() {
            return ptr::null_mut();
        }
        self.base().wrapping_add(p.get() as usize) as *mut T
    }

    /// Inverse of [`convert`](Self::convert). Null maps to null.
    #[inline]
    pub fn to_offset<T>(&self, p: *const T) -> OffsetPointer {
        if p.is_null() {
            return OffsetPointer::NULL;
        }
        OffsetPointer::new((p as usize - self.base() as usize) as u64)
    }

    /// Fully qualified pointer for an offset owned by this allocator.
    #[inline]
    pub fn full_pointer(&self, p: OffsetPointer) -> Pointer {
        Pointer::new(self.id(), p)
    }

    /// Allocate room for a `T` and construct `value` there.
    pub fn new_obj<T>(&self, value: T) -> Result<OffsetPointer> {
        let p = self.aligned_allocate(size_of::<T>().max(1), align_of::<T>().max(DEFAULT_ALIGN))?;
        // SAFETY: the block is fresh, large and aligned enough for T.
        unsafe { ptr::write(self.convert::<T>(p), value) };
        Ok(p)
    }

    /// Allocate uninitialized room for `count` values of `T`.
    pub fn new_array<T>(&self, count: usize) -> Result<OffsetPointer> {
        let align = align_of::<T>().max(DEFAULT_ALIGN);
        match size_of::<T>().checked_mul(count) {
            Some(bytes) => self.aligned_allocate(bytes.max(1), align),
            None => Err(MemoryError::OutOfMemory {
                requested: usize::MAX,
                available: self.backend().data_size(),
            }),
        }
    }

    /// Drop the `T` at `p` in place and free its block.
    ///
    /// # Safety
    /// `p` must have come from [`new_obj`](Self::new_obj) on this allocator
    /// with the same `T`, and must not be used afterwards.
    pub unsafe fn del_obj<T>(&self, p: OffsetPointer) {
        if p.is_null() {
            return;
        }
        // SAFETY: guaranteed by the caller.
        unsafe { ptr::drop_in_place(self.convert::<T>(p)) };
        self.free(p);
    }
}
