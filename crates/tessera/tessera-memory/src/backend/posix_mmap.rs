//! Anonymous, process-private mapping. Useful for allocators whose data never
//! leaves the process but should still be addressed through offsets.

use super::{BackendFlags, MemoryBackend, MemoryBackendHeader, MemoryBackendId, MemoryBackendType};
use crate::error::{MemoryError, Result};
use std::io;
use std::ptr;
use tessera_mmap::{MappedRegion, page_size};
use tracing::error;

pub struct PosixMmap {
    region: Option<MappedRegion>,
    header: *mut MemoryBackendHeader,
    data: *mut u8,
    data_size: usize,
    flags: BackendFlags,
}

// SAFETY: pointers reference the owned anonymous mapping.
unsafe impl Send for PosixMmap {}
unsafe impl Sync for PosixMmap {}

impl PosixMmap {
    pub fn shm_init(id: MemoryBackendId, size: usize) -> Result<Self> {
        let page = page_size();
        let mut region = MappedRegion::anonymous(size + page).map_err(|source| {
            error!(size, error = %source, "anonymous mmap failed");
            MemoryError::BackendCreateFailed {
                url: "<anonymous>".to_string(),
                source,
            }
        })?;
        let base = region.as_mut_ptr();
        let header = base as *mut MemoryBackendHeader;
        // SAFETY: the mapping spans at least one page plus `size`.
        let data = unsafe {
            ptr::write(header, MemoryBackendHeader::new(MemoryBackendType::PosixMmap, id, size));
            base.add(page)
        };
        let mut flags = BackendFlags::default();
        flags.set(BackendFlags::INITIALIZED | BackendFlags::OWNED);
        Ok(Self {
            region: Some(region),
            header,
            data,
            data_size: size,
            flags,
        })
    }

    /// Anonymous mappings have no name, so there is nothing to attach to.
    pub fn shm_deserialize(url: &str) -> Result<Self> {
        Err(MemoryError::BackendNotFound {
            url: url.to_string(),
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "anonymous mappings cannot be attached",
            ),
        })
    }
}

impl MemoryBackend for PosixMmap {
    fn header(&self) -> MemoryBackendHeader {
        if self.header.is_null() {
            return MemoryBackendHeader::new(MemoryBackendType::PosixMmap, MemoryBackendId::ROOT, 0);
        }
        // SAFETY: non-null while the region is mapped.
        unsafe { ptr::read(self.header) }
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
        self.region = None;
        self.header = ptr::null_mut();
        self.data = ptr::null_mut();
        self.flags.unset(BackendFlags::INITIALIZED);
    }

    fn destroy(&mut self) {
        self.detach();
        self.flags.unset(BackendFlags::OWNED);
    }
}
