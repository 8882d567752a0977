//! Record bus wiring shared by the producer and consumer binaries.
//!
//! The producer owns a POSIX shared-memory backend formatted with a stack
//! allocator. The allocator's custom header holds a [`BusRoot`], through
//! which the consumer finds the record queue and the two sides signal
//! completion to each other.

use crate::record::Record;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tessera_config::TesseraConfig;
use tessera_ipc::{MpscQueue, QueueToken, ShmContainer, ShmRef};
use tessera_memory::{
    Allocator, AllocatorId, MemoryBackendId, MemoryBackendType, MemoryError, MemoryManager,
    OffsetPointer, Result,
};
use tracing::{debug, info};

/// Root data published in the allocator's custom header.
#[repr(C)]
pub struct BusRoot {
    /// Header offset of the record queue; 0 until published, since the
    /// allocator's own header occupies offset 0.
    queue: AtomicU64,
    producer_done: AtomicU32,
    drained: AtomicU32,
}

impl BusRoot {
    pub fn queue_offset(&self) -> Option<OffsetPointer> {
        match self.queue.load(Ordering::Acquire) {
            0 => None,
            off => Some(OffsetPointer::new(off)),
        }
    }

    pub fn mark_producer_done(&self) {
        self.producer_done.store(1, Ordering::Release);
    }

    pub fn is_producer_done(&self) -> bool {
        self.producer_done.load(Ordering::Acquire) != 0
    }

    pub fn mark_drained(&self) {
        self.drained.store(1, Ordering::Release);
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire) != 0
    }
}

fn allocator_id(cfg: &TesseraConfig) -> AllocatorId {
    AllocatorId::new(cfg.allocator_major, cfg.allocator_minor)
}

fn root_of(alloc: &Arc<dyn Allocator>) -> &BusRoot {
    // SAFETY: bus allocators are created with a BusRoot-sized custom header,
    // zeroed at creation, and the mapping outlives the allocator handle.
    unsafe { &*alloc.convert::<BusRoot>(alloc.custom_header()) }
}

/// Creating side of the bus. Dropping it destroys the queue and unlinks the
/// shared-memory object.
pub struct ProducerBus {
    // Field order is drop order: the queue must go before its allocator.
    queue: MpscQueue<Record>,
    alloc: Arc<dyn Allocator>,
    _mm: MemoryManager,
}

impl ProducerBus {
    pub fn create(cfg: &TesseraConfig) -> Result<Self> {
        let mm = MemoryManager::with_root_size(cfg.root_heap_size)?;
        let backend = mm.create_backend(
            MemoryBackendType::PosixShmMmap,
            MemoryBackendId::get(cfg.allocator_major),
            cfg.backend_size,
            &cfg.shm_url,
        )?;
        let alloc = mm.create_stack_allocator(backend, allocator_id(cfg), size_of::<BusRoot>())?;
        let queue = MpscQueue::<Record>::new_in(&alloc, cfg.queue_depth)?;
        root_of(&alloc)
            .queue
            .store(queue.header_offset().get(), Ordering::Release);
        info!(
            url = %cfg.shm_url,
            alloc = %alloc.id(),
            queue = %queue.header_offset(),
            depth = cfg.queue_depth,
            "record bus created"
        );
        Ok(Self {
            queue,
            alloc,
            _mm: mm,
        })
    }

    pub fn root(&self) -> &BusRoot {
        root_of(&self.alloc)
    }

    pub fn queue(&self) -> &MpscQueue<Record> {
        &self.queue
    }

    /// Enqueue `record`, waiting while the queue is full.
    pub fn publish(&self, record: Record) -> QueueToken {
        self.queue.emplace(record)
    }

    /// Wait until the consumer reports it has drained the queue.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.root().is_drained() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

/// Attaching side of the bus.
pub struct ConsumerBus {
    queue: ShmRef<MpscQueue<Record>>,
    alloc: Arc<dyn Allocator>,
    _mm: MemoryManager,
}

impl ConsumerBus {
    /// Attach to a bus whose producer has already published its queue.
    pub fn attach(cfg: &TesseraConfig) -> Result<Self> {
        let mm = MemoryManager::with_root_size(cfg.root_heap_size)?;
        let backend = mm.attach_backend(MemoryBackendType::PosixShmMmap, &cfg.shm_url)?;
        let alloc = mm.attach_stack_allocator(backend)?;
        if alloc.id() != allocator_id(cfg) {
            return Err(MemoryError::InvalidHeader("allocator id differs from configuration"));
        }
        let off = root_of(&alloc)
            .queue_offset()
            .ok_or(MemoryError::InvalidHeader("record queue not published yet"))?;
        let queue = MpscQueue::<Record>::shm_deserialize(&alloc, off)?;
        debug!(url = %cfg.shm_url, queue = %off, "attached record bus");
        Ok(Self {
            queue,
            alloc,
            _mm: mm,
        })
    }

    /// [`attach`](Self::attach), retrying until `timeout` while the producer
    /// is still setting the bus up.
    pub fn attach_with_retry(cfg: &TesseraConfig, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::attach(cfg) {
                Ok(bus) => return Ok(bus),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(e) => {
                    debug!(error = %e, "bus not ready, retrying");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    pub fn root(&self) -> &BusRoot {
        root_of(&self.alloc)
    }

    pub fn try_recv(&mut self) -> Option<Record> {
        self.queue.try_pop()
    }

    pub fn queue(&self) -> &MpscQueue<Record> {
        &self.queue
    }
}
