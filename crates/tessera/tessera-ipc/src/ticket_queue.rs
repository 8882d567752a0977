//! Multi-producer, multi-consumer queue: an [`SpscQueue`] behind a
//! [`ShmMutex`].
//!
//! Every operation takes the lock, runs the single-producer/single-consumer
//! operation, and releases it. The inner queue never waits, so a full queue
//! hands the value back instead of holding the lock while blocked. The lock
//! lives in shared memory and serializes other processes as well.

use crate::container::{ShmContainer, ShmCopy, ShmRef};
use crate::mpsc_queue::DEFAULT_DEPTH;
use crate::mutex::ShmMutex;
use crate::shm_layout::{ContainerHeader, TICKET_MAGIC};
use crate::spsc_queue::SpscQueue;
use crate::token::QueueToken;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;
use tessera_memory::{Allocator, OffsetPointer, Result};
use tracing::debug;

#[repr(C)]
struct TicketHeader {
    base: ContainerHeader,
    lock: ShmMutex,
    queue: OffsetPointer,
}

pub struct TicketQueue<T> {
    alloc: Arc<dyn Allocator>,
    header: OffsetPointer,
    owner: bool,
    _pd: PhantomData<T>,
}

// SAFETY: the inner queue is only touched with the shared lock held.
unsafe impl<T: Send> Send for TicketQueue<T> {}
unsafe impl<T: Send> Sync for TicketQueue<T> {}

impl<T> TicketQueue<T> {
    /// Queue of [`DEFAULT_DEPTH`] values.
    pub fn new(alloc: &Arc<dyn Allocator>) -> Result<Self> {
        Self::new_in(alloc, DEFAULT_DEPTH)
    }

    /// # Panics
    /// Panics if `depth` is zero.
    pub fn new_in(alloc: &Arc<dyn Allocator>, depth: usize) -> Result<Self> {
        let queue = SpscQueue::<T>::new_in(alloc, depth)?;
        let header = alloc.new_obj(TicketHeader {
            base: ContainerHeader::init_shm_container(&**alloc, TICKET_MAGIC, size_of::<T>()),
            lock: ShmMutex::new(),
            queue: queue.header_offset(),
        })?;
        queue.into_raw();
        debug!(alloc = %alloc.id(), offset = header.get(), depth, "created ticket queue");
        Ok(Self {
            alloc: alloc.clone(),
            header,
            owner: true,
            _pd: PhantomData,
        })
    }

    fn header(&self) -> &TicketHeader {
        assert!(!self.header.is_null(), "use of a null TicketQueue");
        // SAFETY: a non-null header is a live TicketHeader in our allocator.
        unsafe { &*self.alloc.convert::<TicketHeader>(self.header) }
    }

    /// The inner queue. Callers must hold the lock.
    fn inner(&self) -> ShmRef<SpscQueue<T>> {
        // SAFETY: the header always names a live SpscQueue<T>.
        ShmRef::new(unsafe { SpscQueue::from_raw_parts(self.alloc.clone(), self.header().queue) })
    }

    /// Append `value`, or hand it back if the queue is full.
    pub fn emplace(&self, value: T) -> std::result::Result<QueueToken, T> {
        let _guard = self.header().lock.lock();
        self.inner().emplace(value)
    }

    /// Move the oldest value into `out`; null token when empty.
    pub fn pop_into(&self, out: &mut T) -> QueueToken {
        let _guard = self.header().lock.lock();
        self.inner().pop_into(out)
    }

    pub fn try_pop(&self) -> Option<T> {
        let _guard = self.header().lock.lock();
        self.inner().try_pop()
    }

    pub fn size(&self) -> u64 {
        let _guard = self.header().lock.lock();
        self.inner().size()
    }

    pub fn depth(&self) -> u64 {
        self.inner().depth()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T> ShmContainer for TicketQueue<T> {
    const MAGIC: u32 = TICKET_MAGIC;
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
        // SAFETY: this handle owns the inner queue; dropping it destroys it.
        drop(unsafe { SpscQueue::<T>::from_raw_parts(self.alloc.clone(), self.header().queue) });
        self.alloc.free(self.header);
        debug!(alloc = %self.alloc.id(), offset = self.header.get(), "destroyed ticket queue");
    }
}

impl<T: Clone> ShmCopy for TicketQueue<T> {
    fn shm_strong_copy(&self, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        if self.is_null() {
            return Ok(Self::null_in(alloc));
        }
        let queue = {
            let _guard = self.header().lock.lock();
            self.inner().shm_strong_copy(alloc)?
        };
        let header = alloc.new_obj(TicketHeader {
            base: ContainerHeader::init_shm_container(&**alloc, TICKET_MAGIC, size_of::<T>()),
            lock: ShmMutex::new(),
            queue: queue.header_offset(),
        })?;
        queue.into_raw();
        debug!(alloc = %alloc.id(), offset = header.get(), "copied ticket queue");
        Ok(Self {
            alloc: alloc.clone(),
            header,
            owner: true,
            _pd: PhantomData,
        })
    }
}

impl<T> Drop for TicketQueue<T> {
    fn drop(&mut self) {
        if self.owner {
            self.shm_destroy();
        }
    }
}
