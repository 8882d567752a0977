use super::{ArrayBackend, MemoryBackend, MemoryBackendId, MemoryBackendType, PosixMmap, PosixShmMmap};
use crate::error::Result;

/// Creates or attaches backends by [`MemoryBackendType`].
pub struct MemoryBackendFactory;

impl MemoryBackendFactory {
    /// Create a new backend. `url` is ignored by process-local kinds.
    pub fn create(
        kind: MemoryBackendType,
        id: MemoryBackendId,
        size: usize,
        url: &str,
    ) -> Result<Box<dyn MemoryBackend>> {
        Ok(match kind {
            MemoryBackendType::PosixShmMmap => Box::new(PosixShmMmap::shm_init(id, size, url)?),
            MemoryBackendType::PosixMmap => Box::new(PosixMmap::shm_init(id, size)?),
            MemoryBackendType::ArrayBackend => Box::new(ArrayBackend::shm_init(id, size)?),
        })
    }

    /// Attach to an existing backend by URL.
    pub fn attach(kind: MemoryBackendType, url: &str) -> Result<Box<dyn MemoryBackend>> {
        Ok(match kind {
            MemoryBackendType::PosixShmMmap => Box::new(PosixShmMmap::shm_deserialize(url)?),
            MemoryBackendType::PosixMmap => Box::new(PosixMmap::shm_deserialize(url)?),
            MemoryBackendType::ArrayBackend => Box::new(ArrayBackend::shm_deserialize(url)?),
        })
    }
}
