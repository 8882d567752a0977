//! Single-producer, single-consumer queue over shared memory.
//!
//! Each counter has exactly one writer: the producer advances `tail` after
//! writing a slot, the consumer advances `head` after reading one. No
//! operation ever waits: a full queue hands the value back and an empty
//! queue returns a null token.
//!
//! Both ends take `&mut self`, so the producer and consumer each hold their
//! own handle (see [`ShmContainer::shm_deserialize`]).

use crate::container::{ShmContainer, ShmCopy};
use crate::ring::{PaddedCounter, Slot, alloc_slots, slot_index};
use crate::shm_layout::{ContainerHeader, SPSC_MAGIC};
use crate::token::QueueToken;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tessera_memory::{Allocator, OffsetPointer, Result};
use tracing::debug;

#[repr(C)]
struct SpscHeader {
    base: ContainerHeader,
    depth: u64,
    slots: OffsetPointer,
    head: PaddedCounter,
    tail: PaddedCounter,
}

pub struct SpscQueue<T> {
    alloc: Arc<dyn Allocator>,
    header: OffsetPointer,
    owner: bool,
    _pd: PhantomData<T>,
}

// SAFETY: mutation goes through `&mut self`; counters are atomics.
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// # Panics
    /// Panics if `depth` is zero.
    pub fn new_in(alloc: &Arc<dyn Allocator>, depth: usize) -> Result<Self> {
        assert!(depth > 0, "queue depth must be non-zero");
        let header = alloc.new_obj(SpscHeader {
            base: ContainerHeader::init_shm_container(&**alloc, SPSC_MAGIC, size_of::<T>()),
            depth: depth as u64,
            slots: OffsetPointer::NULL,
            head: PaddedCounter::new(0),
            tail: PaddedCounter::new(0),
        })?;
        let slots = match alloc_slots::<T>(&**alloc, depth as u64) {
            Ok(slots) => slots,
            Err(e) => {
                alloc.free(header);
                return Err(e);
            }
        };
        // SAFETY: not shared yet.
        unsafe { (*alloc.convert::<SpscHeader>(header)).slots = slots };
        debug!(alloc = %alloc.id(), offset = header.get(), depth, "created spsc queue");
        Ok(Self {
            alloc: alloc.clone(),
            header,
            owner: true,
            _pd: PhantomData,
        })
    }

    #[inline(always)]
    fn header(&self) -> &SpscHeader {
        assert!(!self.header.is_null(), "use of a null SpscQueue");
        // SAFETY: a non-null header is a live SpscHeader in our allocator.
        unsafe { &*self.alloc.convert::<SpscHeader>(self.header) }
    }

    #[inline(always)]
    fn slot(&self, counter: u64) -> *mut std::mem::MaybeUninit<T> {
        let h = self.header();
        let slots = self.alloc.convert::<Slot<T>>(h.slots);
        // SAFETY: slot_index is always below depth.
        unsafe { (*slots.add(slot_index(counter, h.depth))).get() }
    }

    /// Append `value`, or hand it back if the queue is full.
    pub fn emplace(&mut self, value: T) -> std::result::Result<QueueToken, T> {
        let h = self.header();
        let tail = h.tail.0.load(Ordering::Relaxed);
        let head = h.head.0.load(Ordering::Acquire);
        if tail - head >= h.depth {
            return Err(value);
        }
        // SAFETY: slots in [tail, head + depth) belong to the producer.
        unsafe { (*self.slot(tail)).write(value) };
        h.tail.0.store(tail + 1, Ordering::Release);
        Ok(QueueToken::new(tail))
    }

    fn take(&mut self) -> Option<(u64, T)> {
        let h = self.header();
        let head = h.head.0.load(Ordering::Relaxed);
        if head >= h.tail.0.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: slots in [head, tail) hold published values.
        let value = unsafe { (*self.slot(head)).assume_init_read() };
        h.head.0.store(head + 1, Ordering::Release);
        Some((head, value))
    }

    /// Move the oldest value into `out`; null token when empty.
    pub fn pop_into(&mut self, out: &mut T) -> QueueToken {
        match self.take() {
            Some((counter, value)) => {
                *out = value;
                QueueToken::new(counter)
            }
            None => QueueToken::NULL,
        }
    }

    pub fn try_pop(&mut self) -> Option<T> {
        self.take().map(|(_, value)| value)
    }

    pub fn peek(&mut self, offset: u64) -> (QueueToken, Option<&T>) {
        let h = self.header();
        let Some(counter) = h.head.0.load(Ordering::Relaxed).checked_add(offset) else {
            return (QueueToken::NULL, None);
        };
        if counter >= h.tail.0.load(Ordering::Acquire) {
            return (QueueToken::NULL, None);
        }
        // SAFETY: published and not yet consumed.
        let value = unsafe { (*self.slot(counter)).assume_init_ref() };
        (QueueToken::new(counter), Some(value))
    }

    pub fn size(&self) -> u64 {
        let h = self.header();
        let head = h.head.0.load(Ordering::Acquire);
        h.tail.0.load(Ordering::Acquire).saturating_sub(head)
    }

    pub fn depth(&self) -> u64 {
        self.header().depth
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T> ShmContainer for SpscQueue<T> {
    const MAGIC: u32 = SPSC_MAGIC;
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
        let h = self.header();
        let (head, tail, slots) = (
            h.head.0.load(Ordering::Acquire),
            h.tail.0.load(Ordering::Acquire),
            h.slots,
        );
        for counter in head..tail {
            // SAFETY: live range.
            unsafe { (*self.slot(counter)).assume_init_drop() };
        }
        self.alloc.free(slots);
        self.alloc.free(self.header);
        debug!(alloc = %self.alloc.id(), offset = self.header.get(), "destroyed spsc queue");
    }
}

impl<T: Clone> ShmCopy for SpscQueue<T> {
    fn shm_strong_copy(&self, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        if self.is_null() {
            return Ok(Self::null_in(alloc));
        }
        let copy = Self::new_in(alloc, self.depth() as usize)?;
        let h = self.header();
        let (head, tail) = (h.head.0.load(Ordering::Acquire), h.tail.0.load(Ordering::Acquire));
        for counter in head..tail {
            // SAFETY: live range of the source; the copy is not shared yet.
            unsafe {
                let value = (*self.slot(counter)).assume_init_ref().clone();
                (*copy.slot(counter)).write(value);
            }
        }
        let ch = copy.header();
        ch.head.0.store(head, Ordering::Release);
        ch.tail.0.store(tail, Ordering::Release);
        Ok(copy)
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        if self.owner {
            self.shm_destroy();
        }
    }
}
