use crate::pointer::AllocatorId;
use std::io;

/// Errors raised by backends, allocators and the shared-memory serializer.
///
/// "Nothing available" conditions on containers (an empty queue, a slot not
/// yet published) are not errors; they are reported as null queue tokens.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("failed to create memory backend '{url}'")]
    BackendCreateFailed {
        url: String,
        #[source]
        source: io::Error,
    },

    #[error("memory backend '{url}' not found")]
    BackendNotFound {
        url: String,
        #[source]
        source: io::Error,
    },

    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("argument is not shared-memory compatible: {0}")]
    ArgsNotShmCompatible(String),

    #[error("allocator {0} is not registered")]
    UnknownAllocator(AllocatorId),

    #[error("invalid shared-memory header: {0}")]
    InvalidHeader(&'static str),
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
