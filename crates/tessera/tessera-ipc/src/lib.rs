mod bitfield;
mod container;
mod mpsc_queue;
mod mutex;
mod pair;
mod ring;
mod serialize;
mod shm_layout;
mod spsc_queue;
mod thread;
mod ticket_queue;
mod token;
mod vector;

pub use bitfield::AtomicBitfield32;
pub use container::{ShmContainer, ShmCopy, ShmRef};
pub use mpsc_queue::{DEFAULT_DEPTH, MpscQueue};
pub use mutex::{ShmMutex, ShmMutexGuard};
pub use pair::Pair;
pub use serialize::{
    ShmDeserialize, ShmDeserializeArgs, ShmDeserializer, ShmSerialize, ShmSerializeArgs,
    ShmSerializer,
};
pub use shm_layout::ContainerHeader;
pub use spsc_queue::SpscQueue;
pub use thread::{OsThreadModel, SpinThreadModel, ThreadModel};
pub use ticket_queue::TicketQueue;
pub use token::QueueToken;
pub use vector::ShmVec;

#[cfg(test)]
mod test_util {
    use std::sync::Arc;
    use tessera_memory::{Allocator, AllocatorId, ArrayBackend, MemoryBackendId, StackAllocator};

    /// In-process allocator with id `major.0` over `size` bytes.
    pub(crate) fn heap(major: u32, size: usize) -> Arc<dyn Allocator> {
        let backend = ArrayBackend::shm_init(MemoryBackendId::get(major), size).expect("backend");
        Arc::new(
            StackAllocator::create(Box::new(backend), AllocatorId::new(major, 0), 0).expect("allocator"),
        )
    }
}
