mod allocator;
mod backend;
mod error;
mod manager;
mod pointer;

pub use allocator::{Allocator, AllocatorType, DEFAULT_ALIGN, StackAllocator};
pub use backend::{
    ArrayBackend, BackendFlags, MemoryBackend, MemoryBackendFactory, MemoryBackendHeader,
    MemoryBackendId, MemoryBackendType, PosixMmap, PosixShmMmap,
};
pub use error::{MemoryError, Result};
pub use manager::MemoryManager;
pub use pointer::{AllocatorId, OffsetPointer, Pointer};
