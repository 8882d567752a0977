//! Multi-producer, single-consumer queue over shared memory.
//!
//! The queue is a fixed array of `depth` slots, each a `(flag, value)`
//! [`Pair`](crate::Pair). Producers reserve a slot by advancing `tail`, write
//! the value, then set the slot flag. The consumer only reads a slot once its
//! flag is set, which covers the window between a producer's reservation and
//! its write.
//!
//! # Protocol
//!
//! **Producer:**
//! 1. CAS `tail` to `tail + 1`, allowed only while `tail - head < depth`
//! 2. Write the value into slot `tail % depth`
//! 3. Set the slot flag (`Release`)
//!
//! **Consumer:**
//! 1. If `head == tail`, the queue is empty
//! 2. If the flag of slot `head % depth` is clear, the producer that
//!    reserved it is still writing: report nothing and retry later
//! 3. Move the value out, clear the flag, store `head + 1` (`Release`)
//!
//! Because the reservation fails whenever the ring is full, the occupied
//! count `tail - head` never exceeds `depth`.
//!
//! # Handles
//! Producers share a handle (`emplace` takes `&self`). Consuming takes
//! `&mut self`; a consumer thread or process normally holds its own handle
//! obtained with [`ShmContainer::shm_deserialize`]. Only one consumer may
//! be active at a time.

use crate::container::{ShmContainer, ShmCopy};
use crate::ring::{FlaggedSlot, PaddedCounter, SLOT_READY, alloc_flagged_slots, slot_index};
use crate::shm_layout::{ContainerHeader, MPSC_MAGIC};
use crate::thread::{OsThreadModel, ThreadModel};
use crate::token::QueueToken;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tessera_memory::{Allocator, OffsetPointer, Result};
use tracing::debug;

/// Depth used by [`MpscQueue::new`].
pub const DEFAULT_DEPTH: usize = 1024;

#[repr(C)]
struct MpscHeader {
    base: ContainerHeader,
    depth: u64,
    slots: OffsetPointer,
    head: PaddedCounter,
    tail: PaddedCounter,
}

pub struct MpscQueue<T> {
    alloc: Arc<dyn Allocator>,
    header: OffsetPointer,
    owner: bool,
    _pd: PhantomData<T>,
}

// SAFETY: all shared state is reached through atomics; values cross threads
// by move only.
unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    pub fn new(alloc: &Arc<dyn Allocator>) -> Result<Self> {
        Self::new_in(alloc, DEFAULT_DEPTH)
    }

    /// Allocate a queue with room for `depth` values from `alloc`.
    ///
    /// # Panics
    /// Panics if `depth` is zero.
    pub fn new_in(alloc: &Arc<dyn Allocator>, depth: usize) -> Result<Self> {
        assert!(depth > 0, "queue depth must be non-zero");
        let header = alloc.new_obj(MpscHeader {
            base: ContainerHeader::init_shm_container(&**alloc, MPSC_MAGIC, size_of::<T>()),
            depth: depth as u64,
            slots: OffsetPointer::NULL,
            head: PaddedCounter::new(0),
            tail: PaddedCounter::new(0),
        })?;
        let slots = match alloc_flagged_slots::<T>(&**alloc, depth as u64) {
            Ok(slots) => slots,
            Err(e) => {
                alloc.free(header);
                return Err(e);
            }
        };
        // SAFETY: the header was just constructed and is not shared yet.
        unsafe { (*alloc.convert::<MpscHeader>(header)).slots = slots };
        debug!(alloc = %alloc.id(), offset = header.get(), depth, "created mpsc queue");
        Ok(Self {
            alloc: alloc.clone(),
            header,
            owner: true,
            _pd: PhantomData,
        })
    }

    #[inline(always)]
    fn header(&self) -> &MpscHeader {
        assert!(!self.header.is_null(), "use of a null MpscQueue");
        // SAFETY: a non-null header is a live MpscHeader in our allocator.
        unsafe { &*self.alloc.convert::<MpscHeader>(self.header) }
    }

    #[inline(always)]
    fn slot(&self, counter: u64) -> &FlaggedSlot<T> {
        let h = self.header();
        let slots = self.alloc.convert::<FlaggedSlot<T>>(h.slots);
        // SAFETY: slot_index is always below depth.
        unsafe { &*slots.add(slot_index(counter, h.depth)) }
    }

    /// Claim the next tail counter, or `None` while the ring is full.
    fn reserve(&self) -> Option<u64> {
        let h = self.header();
        let mut tail = h.tail.0.load(Ordering::Acquire);
        loop {
            let head = h.head.0.load(Ordering::Acquire);
            if tail < head {
                // Our tail is older than the head we just saw.
                tail = h.tail.0.load(Ordering::Acquire);
                continue;
            }
            if tail - head >= h.depth {
                return None;
            }
            match h.tail.0.compare_exchange_weak(
                tail,
                tail + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(tail),
                Err(actual) => tail = actual,
            }
        }
    }

    fn publish(&self, counter: u64, value: T) -> QueueToken {
        let slot = self.slot(counter);
        // SAFETY: the reservation gives this producer exclusive use of the
        // slot until the flag is set.
        unsafe { (*slot.second.get()).write(value) };
        slot.first.set_bits(SLOT_READY);
        QueueToken::new(counter)
    }

    /// Append `value`, waiting for the consumer while the ring is full.
    pub fn emplace(&self, value: T) -> QueueToken {
        self.emplace_with(value, &OsThreadModel)
    }

    /// Like [`emplace`](Self::emplace), waiting through `thread`.
    pub fn emplace_with<Y: ThreadModel + ?Sized>(&self, value: T, thread: &Y) -> QueueToken {
        loop {
            if let Some(counter) = self.reserve() {
                return self.publish(counter, value);
            }
            thread.yield_now();
        }
    }

    /// Append `value` if a slot is free, otherwise hand it back.
    pub fn try_emplace(&self, value: T) -> std::result::Result<QueueToken, T> {
        match self.reserve() {
            Some(counter) => Ok(self.publish(counter, value)),
            None => Err(value),
        }
    }

    /// Append `value`, giving up and handing it back once `timeout` passes.
    pub fn emplace_timeout(&self, value: T, timeout: Duration) -> std::result::Result<QueueToken, T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(counter) = self.reserve() {
                return Ok(self.publish(counter, value));
            }
            if Instant::now() >= deadline {
                return Err(value);
            }
            OsThreadModel.yield_now();
        }
    }

    fn take(&mut self) -> Option<(u64, T)> {
        let h = self.header();
        let head = h.head.0.load(Ordering::Relaxed);
        let tail = h.tail.0.load(Ordering::Acquire);
        if head >= tail {
            return None;
        }
        let slot = self.slot(head);
        if !slot.first.any(SLOT_READY) {
            return None;
        }
        // SAFETY: the flag says the value is initialized; clearing the flag
        // below hands the slot back uninitialized.
        let value = unsafe { (*slot.second.get()).assume_init_read() };
        slot.first.unset_bits(SLOT_READY);
        h.head.0.store(head + 1, Ordering::Release);
        Some((head, value))
    }

    /// Move the oldest value into `out`.
    ///
    /// Returns a null token, leaving `out` untouched, when the queue is empty
    /// or the oldest slot is reserved but not yet written.
    pub fn pop_into(&mut self, out: &mut T) -> QueueToken {
        match self.take() {
            Some((counter, value)) => {
                *out = value;
                QueueToken::new(counter)
            }
            None => QueueToken::NULL,
        }
    }

    /// Remove and drop the oldest value.
    pub fn pop(&mut self) -> QueueToken {
        match self.take() {
            Some((counter, _)) => QueueToken::new(counter),
            None => QueueToken::NULL,
        }
    }

    pub fn try_pop(&mut self) -> Option<T> {
        self.take().map(|(_, value)| value)
    }

    /// Look at the value `offset` places behind the head without removing it.
    pub fn peek(&mut self, offset: u64) -> (QueueToken, Option<&T>) {
        let h = self.header();
        let Some(counter) = h.head.0.load(Ordering::Relaxed).checked_add(offset) else {
            return (QueueToken::NULL, None);
        };
        if counter >= h.tail.0.load(Ordering::Acquire) {
            return (QueueToken::NULL, None);
        }
        let slot = self.slot(counter);
        if !slot.first.any(SLOT_READY) {
            return (QueueToken::NULL, None);
        }
        // SAFETY: published values stay put until this consumer pops them.
        let value = unsafe { (*slot.second.get()).assume_init_ref() };
        (QueueToken::new(counter), Some(value))
    }

    /// Number of reserved slots, published or not.
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

impl<T> ShmContainer for MpscQueue<T> {
    const MAGIC: u32 = MPSC_MAGIC;
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
            let slot = self.slot(counter);
            if slot.first.any(SLOT_READY) {
                // SAFETY: flagged slots hold initialized values.
                unsafe { (*slot.second.get()).assume_init_drop() };
                slot.first.clear();
            }
        }
        self.alloc.free(slots);
        self.alloc.free(self.header);
        debug!(alloc = %self.alloc.id(), offset = self.header.get(), "destroyed mpsc queue");
    }
}

impl<T: Clone> ShmCopy for MpscQueue<T> {
    /// Copies the counters and clones every published value.
    fn shm_strong_copy(&self, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        if self.is_null() {
            return Ok(Self::null_in(alloc));
        }
        let copy = Self::new_in(alloc, self.depth() as usize)?;
        let h = self.header();
        let (head, tail) = (h.head.0.load(Ordering::Acquire), h.tail.0.load(Ordering::Acquire));
        for counter in head..tail {
            let src = self.slot(counter);
            if src.first.any(SLOT_READY) {
                // SAFETY: flagged; the copy is not shared yet.
                let value = unsafe { (*src.second.get()).assume_init_ref() }.clone();
                let dst = copy.slot(counter);
                unsafe { (*dst.second.get()).write(value) };
                dst.first.set_bits(SLOT_READY);
            }
        }
        let ch = copy.header();
        ch.head.0.store(head, Ordering::Release);
        ch.tail.0.store(tail, Ordering::Release);
        Ok(copy)
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        if self.owner {
            self.shm_destroy();
        }
    }
}
