//! Growable array whose elements live in shared memory.
//!
//! `ShmVec` is not synchronized. It is meant to be filled by one party and
//! then handed to others (by offset, or inside a queue) for reading.

use crate::container::{ShmContainer, ShmCopy};
use crate::shm_layout::{ContainerHeader, VEC_MAGIC};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;
use std::slice;
use std::sync::Arc;
use tessera_memory::{Allocator, MemoryError, OffsetPointer, Result};

const MIN_CAPACITY: u64 = 4;

#[repr(C)]
struct VecHeader {
    base: ContainerHeader,
    len: u64,
    cap: u64,
    data: OffsetPointer,
}

pub struct ShmVec<T> {
    alloc: Arc<dyn Allocator>,
    header: OffsetPointer,
    owner: bool,
    _pd: PhantomData<T>,
}

unsafe impl<T: Send> Send for ShmVec<T> {}
unsafe impl<T: Sync> Sync for ShmVec<T> {}

impl<T> ShmVec<T> {
    pub fn new_in(alloc: &Arc<dyn Allocator>) -> Result<Self> {
        Self::with_capacity_in(alloc, 0)
    }

    pub fn with_capacity_in(alloc: &Arc<dyn Allocator>, capacity: usize) -> Result<Self> {
        let header = alloc.new_obj(VecHeader {
            base: ContainerHeader::init_shm_container(&**alloc, VEC_MAGIC, size_of::<T>()),
            len: 0,
            cap: 0,
            data: OffsetPointer::NULL,
        })?;
        let mut v = Self {
            alloc: alloc.clone(),
            header,
            owner: true,
            _pd: PhantomData,
        };
        if capacity > 0 {
            v.grow_to(capacity as u64)?;
        }
        Ok(v)
    }

    fn header(&self) -> &VecHeader {
        assert!(!self.header.is_null(), "use of a null ShmVec");
        // SAFETY: a non-null header is a live VecHeader in our allocator.
        unsafe { &*self.alloc.convert::<VecHeader>(self.header) }
    }

    fn header_mut(&mut self) -> &mut VecHeader {
        assert!(!self.header.is_null(), "use of a null ShmVec");
        // SAFETY: as above; `&mut self` makes this handle the only accessor.
        unsafe { &mut *self.alloc.convert::<VecHeader>(self.header) }
    }

    fn data(&self) -> *mut T {
        self.alloc.convert::<T>(self.header().data)
    }

    fn grow_to(&mut self, cap: u64) -> Result<()> {
        let (len, old) = (self.header().len, self.header().data);
        let data = self.alloc.new_array::<T>(cap as usize)?;
        if !old.is_null() {
            // SAFETY: both blocks hold at least `len` elements and are disjoint.
            unsafe {
                ptr::copy_nonoverlapping(
                    self.alloc.convert::<T>(old),
                    self.alloc.convert::<T>(data),
                    len as usize,
                );
            }
            self.alloc.free(old);
        }
        let h = self.header_mut();
        h.data = data;
        h.cap = cap;
        Ok(())
    }

    pub fn len(&self) -> usize {
        if self.is_null() {
            return 0;
        }
        self.header().len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        if self.is_null() {
            return 0;
        }
        self.header().cap as usize
    }

    /// Make room for at least `additional` more elements.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let h = self.header();
        let Some(needed) = h.len.checked_add(additional as u64) else {
            return Err(MemoryError::OutOfMemory {
                requested: usize::MAX,
                available: self.alloc.backend().data_size(),
            });
        };
        if needed <= h.cap {
            return Ok(());
        }
        self.grow_to(needed.max(h.cap.saturating_mul(2)).max(MIN_CAPACITY))
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        self.reserve(1)?;
        let len = self.header().len;
        // SAFETY: reserve guarantees capacity for index `len`.
        unsafe { self.data().add(len as usize).write(value) };
        self.header_mut().len = len + 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        let len = self.header().len;
        if len == 0 {
            return None;
        }
        self.header_mut().len = len - 1;
        // SAFETY: the element at len - 1 was initialized and is now outside the length.
        Some(unsafe { self.data().add(len as usize - 1).read() })
    }

    /// Drop every element, keeping the capacity.
    pub fn clear(&mut self) {
        let len = self.header().len as usize;
        if len == 0 {
            return;
        }
        self.header_mut().len = 0;
        // SAFETY: the first `len` elements were initialized.
        unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.data(), len)) };
    }

    pub fn as_slice(&self) -> &[T] {
        if self.is_null() || self.header().data.is_null() {
            return &[];
        }
        // SAFETY: `len` initialized elements start at `data`.
        unsafe { slice::from_raw_parts(self.data(), self.header().len as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.is_null() || self.header().data.is_null() {
            return &mut [];
        }
        let len = self.header().len as usize;
        // SAFETY: as above, and `&mut self` gives exclusive access.
        unsafe { slice::from_raw_parts_mut(self.data(), len) }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn extend_from_slice(&mut self, items: &[T]) -> Result<()>
    where
        T: Clone,
    {
        self.reserve(items.len())?;
        for item in items {
            self.push(item.clone())?;
        }
        Ok(())
    }

    pub fn from_slice_in(alloc: &Arc<dyn Allocator>, items: &[T]) -> Result<Self>
    where
        T: Clone,
    {
        let mut v = Self::with_capacity_in(alloc, items.len())?;
        v.extend_from_slice(items)?;
        Ok(v)
    }
}

impl<T> ShmContainer for ShmVec<T> {
    const MAGIC: u32 = VEC_MAGIC;
    const ELEM_SIZE: usize = size_of::<T>();

    fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.alloc
    }

    fn header_offset(&self) -> OffsetPointer {
        self.header
    }

    unsafe fn from_raw_parts(alloc: Arc<dyn Allocator>, header: OffsetPointer) -> Self {
        Self {
            alloc,
            header,
            owner: true,
            _pd: PhantomData,
        }
    }

    fn set_null(&mut self) {
        self.header = OffsetPointer::NULL;
    }

    fn is_owner(&self) -> bool {
        self.owner
    }

    fn set_owner(&mut self, owner: bool) {
        self.owner = owner;
    }

    fn shm_destroy_main(&mut self) {
        self.clear();
        let data = self.header().data;
        self.alloc.free(data);
        self.alloc.free(self.header);
    }
}

impl<T: Clone> ShmCopy for ShmVec<T> {
    fn shm_strong_copy(&self, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        if self.is_null() {
            return Ok(Self::null_in(alloc));
        }
        Self::from_slice_in(alloc, self.as_slice())
    }
}

impl<T> Drop for ShmVec<T> {
    fn drop(&mut self) {
        if self.owner {
            self.shm_destroy();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ShmVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a, T> IntoIterator for &'a ShmVec<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::heap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn push_grows_and_keeps_contents() {
        let alloc = heap(1, 1 << 16);
        let mut v = ShmVec::<u64>::new_in(&alloc).unwrap();
        assert!(v.is_empty());
        assert_eq!(v.capacity(), 0);
        for i in 0..100 {
            v.push(i * 3).unwrap();
        }
        assert_eq!(v.len(), 100);
        assert!(v.capacity() >= 100);
        assert_eq!(v.get(33), Some(&99));
        assert_eq!(v.iter().sum::<u64>(), 3 * (0..100).sum::<u64>());
        v.as_mut_slice()[0] = 7;
        assert_eq!(v.pop(), Some(297));
        assert_eq!(v.as_slice()[0], 7);
        v.clear();
        assert!(v.is_empty());
        assert_eq!(v.pop(), None);
    }

    #[test]
    fn destroy_releases_all_blocks() {
        let alloc = heap(1, 1 << 16);
        let before = alloc.allocated_bytes();
        let mut v = ShmVec::from_slice_in(&alloc, &["a".to_string(), "b".to_string()]).unwrap();
        v.push("c".to_string()).unwrap();
        v.shm_destroy();
        assert!(v.is_null());
        assert_eq!(v.len(), 0);
        assert!(v.as_slice().is_empty());
        assert_eq!(alloc.allocated_bytes(), before);
    }

    #[test]
    fn out_of_memory_is_reported() {
        let alloc = heap(1, 4096);
        let mut v = ShmVec::<u8>::new_in(&alloc).unwrap();
        assert!(v.reserve(1 << 20).is_err());
        assert!(v.push(1).is_ok());
    }

    struct Counted {
        value: u32,
        clones: Arc<AtomicUsize>,
    }

    impl Clone for Counted {
        fn clone(&self) -> Self {
            self.clones.fetch_add(1, Ordering::Relaxed);
            Self {
                value: self.value,
                clones: self.clones.clone(),
            }
        }
    }

    fn counted(alloc: &Arc<dyn Allocator>, n: u32, clones: &Arc<AtomicUsize>) -> ShmVec<Counted> {
        let mut v = ShmVec::new_in(alloc).unwrap();
        for value in 0..n {
            v.push(Counted {
                value,
                clones: clones.clone(),
            })
            .unwrap();
        }
        v
    }

    #[test]
    fn move_within_an_allocator_is_a_handle_transfer() {
        let alloc = heap(1, 1 << 16);
        let clones = Arc::new(AtomicUsize::new(0));
        let mut src = counted(&alloc, 10, &clones);
        let header = src.header_offset();

        let dst = src.shm_move_into(&alloc).unwrap();
        assert_eq!(clones.load(Ordering::Relaxed), 0);
        assert!(src.is_null());
        assert_eq!(dst.header_offset(), header);
        assert_eq!(dst.len(), 10);
    }

    #[test]
    fn move_across_allocators_copies_then_destroys_the_source() {
        let a = heap(1, 1 << 16);
        let b = heap(2, 1 << 16);
        let before = a.allocated_bytes();
        let clones = Arc::new(AtomicUsize::new(0));
        let mut src = counted(&a, 10, &clones);

        let dst = src.shm_move_into(&b).unwrap();
        assert_eq!(clones.load(Ordering::Relaxed), 10);
        assert!(src.is_null());
        assert_eq!(a.allocated_bytes(), before);
        assert_eq!(dst.allocator_id(), b.id());
        let values: Vec<u32> = dst.iter().map(|c| c.value).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn assign_replaces_contents_in_place() {
        let a = heap(1, 1 << 16);
        let b = heap(2, 1 << 16);
        let mut target = ShmVec::from_slice_in(&a, &[1u32, 2, 3]).unwrap();
        let mut other = ShmVec::from_slice_in(&b, &[9u32]).unwrap();
        target.shm_assign(&mut other).unwrap();
        assert!(other.is_null());
        assert_eq!(target.allocator_id(), a.id());
        assert_eq!(target.as_slice(), &[9]);
    }

    #[test]
    fn view_sees_owner_writes() {
        let alloc = heap(1, 1 << 16);
        let mut v = ShmVec::from_slice_in(&alloc, &[1u16, 2]).unwrap();
        let view = ShmVec::<u16>::shm_deserialize(&alloc, v.header_offset()).unwrap();
        v.push(3).unwrap();
        assert_eq!(view.as_slice(), &[1, 2, 3]);
        drop(view);
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn handles_taken_out_of_a_view_never_destroy() {
        let alloc = heap(1, 1 << 16);
        let v = ShmVec::from_slice_in(&alloc, &[7u32, 8, 9]).unwrap();
        let owned_bytes = alloc.allocated_bytes();

        let mut view = ShmVec::<u32>::shm_deserialize(&alloc, v.header_offset()).unwrap();
        let taken = std::mem::replace(&mut *view, ShmVec::new_in(&alloc).unwrap());
        drop(taken);
        assert_eq!(v.as_slice(), &[7, 8, 9]);

        *view = ShmVec::from_slice_in(&alloc, &[1]).unwrap();
        drop(view);
        assert_eq!(v.as_slice(), &[7, 8, 9]);
        assert_eq!(alloc.allocated_bytes(), owned_bytes);
    }

    #[test]
    fn impossible_capacities_report_out_of_memory() {
        let alloc = heap(1, 1 << 16);
        let before = alloc.allocated_bytes();
        let err = ShmVec::<u64>::with_capacity_in(&alloc, usize::MAX / 4).err();
        assert!(matches!(err, Some(MemoryError::OutOfMemory { .. })));
        assert_eq!(alloc.allocated_bytes(), before);

        let mut v = ShmVec::from_slice_in(&alloc, &[1u64, 2]).unwrap();
        assert!(matches!(v.reserve(usize::MAX), Err(MemoryError::OutOfMemory { .. })));
        assert!(matches!(v.reserve(usize::MAX / 2), Err(MemoryError::OutOfMemory { .. })));
        assert_eq!(v.as_slice(), &[1, 2]);
    }
}
