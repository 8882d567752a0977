//! Allocator-aware lifecycle shared by every shared-memory container.
//!
//! A container handle is process-local: it holds the allocator it was built
//! with and the offset of its header inside that allocator's region. All
//! container state lives behind the header, so any process that maps the
//! region can rebuild a handle from the offset alone.
//!
//! # Ownership
//!
//! The handle returned by a constructor owns the shared state and destroys it
//! on drop. A handle rebuilt from an offset with
//! [`ShmContainer::shm_deserialize`] is a [`ShmRef`] around a non-owning
//! handle, which never destroys on drop, even if it is moved or overwritten.
//! Ownership moves between handles with [`ShmContainer::shm_transfer`].
//! An explicit [`ShmContainer::shm_destroy`] releases the state through any
//! handle.

use crate::shm_layout::ContainerHeader;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tessera_memory::{Allocator, AllocatorId, MemoryError, OffsetPointer, Result};

pub trait ShmContainer: Sized {
    /// Tag stored in [`ContainerHeader::magic`].
    const MAGIC: u32;
    /// Size of one element, stored in [`ContainerHeader::elem_size`].
    const ELEM_SIZE: usize;

    fn allocator(&self) -> &Arc<dyn Allocator>;

    /// Offset of the container header; null for a null container.
    fn header_offset(&self) -> OffsetPointer;

    /// Build a handle around an existing header (or a null handle when
    /// `header` is null).
    ///
    /// # Safety
    /// A non-null `header` must point at a live container of this exact type
    /// inside `alloc`'s region. The returned handle owns that state.
    unsafe fn from_raw_parts(alloc: Arc<dyn Allocator>, header: OffsetPointer) -> Self;

    /// Forget the shared state without releasing it.
    fn set_null(&mut self);

    /// Whether dropping this handle destroys the shared state.
    fn is_owner(&self) -> bool;

    fn set_owner(&mut self, owner: bool);

    /// Release the shared state. Only called on non-null handles.
    fn shm_destroy_main(&mut self);

    fn allocator_id(&self) -> AllocatorId {
        self.allocator().id()
    }

    fn is_null(&self) -> bool {
        self.header_offset().is_null()
    }

    /// Release the shared state. Idempotent.
    fn shm_destroy(&mut self) {
        if self.is_null() {
            return;
        }
        self.shm_destroy_main();
        self.set_null();
    }

    /// Move the state to a new owning handle in O(1), leaving `self` null.
    fn shm_transfer(&mut self) -> Self {
        // SAFETY: the header (or null) belongs to this handle's allocator.
        let moved = unsafe { Self::from_raw_parts(self.allocator().clone(), self.header_offset()) };
        self.set_null();
        moved
    }

    /// Give up ownership and return the header offset, e.g. to publish it.
    fn into_raw(mut self) -> OffsetPointer {
        let off = self.header_offset();
        self.set_null();
        off
    }

    fn null_in(alloc: &Arc<dyn Allocator>) -> Self {
        // SAFETY: a null header owns nothing.
        unsafe { Self::from_raw_parts(alloc.clone(), OffsetPointer::NULL) }
    }

    /// Rebuild a non-owning handle for the container whose header is at
    /// `header` inside `alloc`.
    ///
    /// Fails with [`MemoryError::InvalidHeader`] if the offset is outside the
    /// region or the header does not describe this container type, element
    /// size and allocator.
    fn shm_deserialize(alloc: &Arc<dyn Allocator>, header: OffsetPointer) -> Result<ShmRef<Self>> {
        let end = header.get().checked_add(size_of::<ContainerHeader>() as u64);
        let in_bounds = alloc.contains(header)
            && end.is_some_and(|end| end <= alloc.backend().data_size() as u64)
            && header.get() % align_of::<ContainerHeader>() as u64 == 0;
        if !in_bounds {
            return Err(MemoryError::InvalidHeader("container offset outside allocator"));
        }
        // SAFETY: bounds and alignment checked above.
        let h = unsafe { alloc.convert::<ContainerHeader>(header).read() };
        h.validate(Self::MAGIC, Self::ELEM_SIZE, alloc.id())
            .map_err(MemoryError::InvalidHeader)?;
        // SAFETY: header validated; the ShmRef never destroys it.
        Ok(ShmRef::new(unsafe { Self::from_raw_parts(alloc.clone(), header) }))
    }
}

/// Containers that can deep-copy themselves into another allocator.
pub trait ShmCopy: ShmContainer {
    /// Fresh storage under `alloc` holding a deep copy of `self`.
    fn shm_strong_copy(&self, alloc: &Arc<dyn Allocator>) -> Result<Self>;

    /// Move `self` into `alloc`.
    ///
    /// Within one allocator this is [`shm_transfer`](ShmContainer::shm_transfer).
    /// Across allocators the contents are copied and the source destroyed.
    /// Either way `self` is left null.
    fn shm_move_into(&mut self, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        if self.is_null() {
            return Ok(Self::null_in(alloc));
        }
        if self.allocator_id() == alloc.id() {
            return Ok(self.shm_transfer());
        }
        let copy = self.shm_strong_copy(alloc)?;
        self.shm_destroy();
        Ok(copy)
    }

    /// Replace the contents of `self` with `other`, keeping `self`'s allocator.
    fn shm_assign(&mut self, other: &mut Self) -> Result<()> {
        let alloc = self.allocator().clone();
        let moved = other.shm_move_into(&alloc)?;
        self.shm_destroy();
        *self = moved;
        Ok(())
    }
}

/// Handle on a container owned elsewhere.
///
/// Dereferences to a non-owning container handle. Dropping it, or a handle
/// moved out of it, leaves the shared state intact. Call
/// [`ShmContainer::shm_transfer`] through it to take ownership.
pub struct ShmRef<C: ShmContainer> {
    inner: C,
}

impl<C: ShmContainer> ShmRef<C> {
    pub(crate) fn new(mut inner: C) -> Self {
        inner.set_owner(false);
        Self { inner }
    }

    pub fn offset(&self) -> OffsetPointer {
        self.inner.header_offset()
    }
}

impl<C: ShmContainer> Deref for ShmRef<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

impl<C: ShmContainer> DerefMut for ShmRef<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.inner
    }
}
