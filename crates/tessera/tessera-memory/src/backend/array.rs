//! Backend over a heap buffer owned by this process.

use super::{BackendFlags, MemoryBackend, MemoryBackendHeader, MemoryBackendId, MemoryBackendType};
use crate::error::{MemoryError, Result};
use std::io;
use std::ptr;

/// Cache-line sized chunk; gives the buffer 64-byte alignment.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct Chunk([u8; 64]);

const CHUNK: usize = std::mem::size_of::<Chunk>();

pub struct ArrayBackend {
    buf: Option<Box<[Chunk]>>,
    header: MemoryBackendHeader,
    data: *mut u8,
    data_size: usize,
    flags: BackendFlags,
}

// SAFETY: `data` points into the owned boxed buffer.
unsafe impl Send for ArrayBackend {}
unsafe impl Sync for ArrayBackend {}

impl ArrayBackend {
    pub fn shm_init(id: MemoryBackendId, size: usize) -> Result<Self> {
        let chunks = size.div_ceil(CHUNK).max(1);
        let mut buf = vec![Chunk([0; CHUNK]); chunks].into_boxed_slice();
        let data = buf.as_mut_ptr() as *mut u8;
        let mut flags = BackendFlags::default();
        flags.set(BackendFlags::INITIALIZED | BackendFlags::OWNED);
        Ok(Self {
            buf: Some(buf),
            header: MemoryBackendHeader::new(MemoryBackendType::ArrayBackend, id, size),
            data,
            data_size: size,
            flags,
        })
    }

    /// The buffer lives on this process's heap; nothing else can attach.
    pub fn shm_deserialize(url: &str) -> Result<Self> {
        Err(MemoryError::BackendNotFound {
            url: url.to_string(),
            source: io::Error::new(io::ErrorKind::Unsupported, "array backends are process-local"),
        })
    }
}

impl MemoryBackend for ArrayBackend {
    fn header(&self) -> MemoryBackendHeader {
        self.header
    }

    fn data_ptr(&self) -> *mut u8 {
        self.data
    }

    fn data_size(&self) -> usize {
        self.data_size
    }

    fn flags(&self) -> BackendFlags {
        self.flags
    }

    fn detach(&mut self) {
        if !self.is_initialized() {
            return;
        }
        self.buf = None;
        self.data = ptr::null_mut();
        self.flags.unset(BackendFlags::INITIALIZED);
    }

    fn destroy(&mut self) {
        self.detach();
        self.flags.unset(BackendFlags::OWNED);
    }
}
