//! Fixtures shared by the criterion benches.

use std::sync::Arc;
use tessera_memory::{
    Allocator, AllocatorId, MemoryBackendId, MemoryBackendType, MemoryManager, Result,
};

/// Unique shared-memory name for one bench run.
pub fn temp_shm_url(label: &str) -> String {
    let pid = std::process::id();
    format!("/tessera_bench_{label}_{pid}")
}

/// A manager plus one registered allocator over a fresh backend.
pub struct BenchHeap {
    pub alloc: Arc<dyn Allocator>,
    pub mm: MemoryManager,
}

impl BenchHeap {
    /// Stack allocator over a process-local buffer.
    pub fn in_process(size: usize) -> Result<Self> {
        Self::build(MemoryBackendType::ArrayBackend, size, "")
    }

    /// Stack allocator over a POSIX shared-memory object, unlinked on drop.
    pub fn shared(label: &str, size: usize) -> Result<Self> {
        Self::build(MemoryBackendType::PosixShmMmap, size, &temp_shm_url(label))
    }

    fn build(kind: MemoryBackendType, size: usize, url: &str) -> Result<Self> {
        let mm = MemoryManager::with_root_size(1 << 16)?;
        let backend = mm.create_backend(kind, MemoryBackendId::get(1), size, url)?;
        let alloc = mm.create_stack_allocator(backend, AllocatorId::new(1, 0), 0)?;
        Ok(Self { alloc, mm })
    }
}

/// Payload of the queue benches: three words, like a small tick record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Sample {
    pub seq: u64,
    pub ts_ns: u64,
    pub value: i64,
}

impl Sample {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            ts_ns: seq * 10,
            value: seq as i64,
        }
    }
}
