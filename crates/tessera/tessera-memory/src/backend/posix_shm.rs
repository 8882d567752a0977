//! POSIX shared-memory backend (`shm_open` + `mmap`).
//!
//! The OS object holds one header page followed by the data region. The
//! creating process owns the object and unlinks it on destroy; processes that
//! attach by URL only ever unmap.

use super::{BackendFlags, MemoryBackend, MemoryBackendHeader, MemoryBackendId, MemoryBackendType};
use crate::error::{MemoryError, Result};
use std::io;
use std::ptr;
use tessera_mmap::{MappedRegion, ShmObject, page_size};
use tracing::{debug, error, warn};

pub struct PosixShmMmap {
    url: String,
    object: Option<ShmObject>,
    header_map: Option<MappedRegion>,
    data_map: Option<MappedRegion>,
    header: *mut MemoryBackendHeader,
    data: *mut u8,
    data_size: usize,
    flags: BackendFlags,
}

// SAFETY: the raw pointers point into mappings owned by this struct; the
// mapped bytes are shared memory accessed through atomics and offsets.
unsafe impl Send for PosixShmMmap {}
unsafe impl Sync for PosixShmMmap {}

fn create_failed(url: &str, op: &'static str, source: io::Error) -> MemoryError {
    error!(url, op, error = %source, "posix shm backend creation failed");
    MemoryError::BackendCreateFailed {
        url: url.to_string(),
        source,
    }
}

fn not_found(url: &str, op: &'static str, source: io::Error) -> MemoryError {
    error!(url, op, error = %source, "posix shm backend attach failed");
    MemoryError::BackendNotFound {
        url: url.to_string(),
        source,
    }
}

impl PosixShmMmap {
    /// Create a fresh region of `size` data bytes at `url`, replacing any stale one.
    pub fn shm_init(id: MemoryBackendId, size: usize, url: &str) -> Result<Self> {
        if size == 0 {
            return Err(create_failed(
                url,
                "reserve",
                io::Error::new(io::ErrorKind::InvalidInput, "backend size must be non-zero"),
            ));
        }
        let page = page_size();
        let total = size.checked_add(page).ok_or_else(|| {
            create_failed(
                url,
                "reserve",
                io::Error::new(io::ErrorKind::InvalidInput, "backend size overflows"),
            )
        })?;
        let object =
            ShmObject::create(url, total as u64).map_err(|e| create_failed(url, "shm_open", e))?;
        let mut header_map = object.map(0, page).map_err(|e| create_failed(url, "mmap", e))?;
        let mut data_map = object
            .map(page as u64, size)
            .map_err(|e| create_failed(url, "mmap", e))?;

        let header = header_map.as_mut_ptr() as *mut MemoryBackendHeader;
        // SAFETY: the header page is at least one page long and freshly created.
        unsafe {
            ptr::write(
                header,
                MemoryBackendHeader::new(MemoryBackendType::PosixShmMmap, id, size),
            );
        }
        let data = data_map.as_mut_ptr();

        let mut flags = BackendFlags::default();
        flags.set(BackendFlags::INITIALIZED | BackendFlags::OWNED);
        debug!(url, %id, size, "created posix shm backend");

        Ok(Self {
            url: url.to_string(),
            object: Some(object),
            header_map: Some(header_map),
            data_map: Some(data_map),
            header,
            data,
            data_size: size,
            flags,
        })
    }

    /// Attach to an existing region created by another handle or process.
    pub fn shm_deserialize(url: &str) -> Result<Self> {
        let page = page_size();
        let object = ShmObject::open(url).map_err(|e| not_found(url, "shm_open", e))?;
        let mut header_map = object.map(0, page).map_err(|e| not_found(url, "mmap", e))?;
        let header = header_map.as_mut_ptr() as *mut MemoryBackendHeader;
        // SAFETY: the header page is mapped; the creator wrote it before
        // publishing the name.
        let persisted = unsafe { ptr::read(header) };

        if persisted.kind() != Some(MemoryBackendType::PosixShmMmap) {
            return Err(not_found(
                url,
                "validate",
                io::Error::new(io::ErrorKind::InvalidData, "not a posix shm backend"),
            ));
        }
        let data_size = persisted.data_size as usize;
        if data_size == 0 {
            return Err(not_found(
                url,
                "validate",
                io::Error::new(io::ErrorKind::InvalidData, "backend header not written yet"),
            ));
        }
        let object_len = object.len().map_err(|e| not_found(url, "fstat", e))?;
        if object_len < (page + data_size) as u64 {
            return Err(not_found(
                url,
                "validate",
                io::Error::new(io::ErrorKind::InvalidData, "object smaller than its header claims"),
            ));
        }

        let mut data_map = object
            .map(page as u64, data_size)
            .map_err(|e| not_found(url, "mmap", e))?;
        let data = data_map.as_mut_ptr();

        let mut flags = BackendFlags::default();
        flags.set(BackendFlags::INITIALIZED);
        debug!(url, id = %persisted.id, data_size, "attached posix shm backend");

        Ok(Self {
            url: url.to_string(),
            object: Some(object),
            header_map: Some(header_map),
            data_map: Some(data_map),
            header,
            data,
            data_size,
            flags,
        })
    }

    /// Make this handle responsible for removing the OS object.
    pub fn own(&mut self) {
        self.flags.set(BackendFlags::OWNED);
    }

    /// Hand responsibility for removing the OS object to another process.
    pub fn disown(&mut self) {
        self.flags.unset(BackendFlags::OWNED);
    }
}

impl MemoryBackend for PosixShmMmap {
    fn header(&self) -> MemoryBackendHeader {
        if self.header.is_null() {
            return MemoryBackendHeader::new(
                MemoryBackendType::PosixShmMmap,
                MemoryBackendId::ROOT,
                0,
            );
        }
        // SAFETY: header is non-null only while the header page is mapped.
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

    fn url(&self) -> Option<&str> {
        Some(&self.url)
    }

    fn detach(&mut self) {
        if !self.is_initialized() {
            return;
        }
        self.data_map = None;
        self.header_map = None;
        self.object = None;
        self.header = ptr::null_mut();
        self.data = ptr::null_mut();
        self.flags.unset(BackendFlags::INITIALIZED);
        debug!(url = %self.url, "detached posix shm backend");
    }

    fn destroy(&mut self) {
        if !self.is_initialized() {
            return;
        }
        let owned = self.is_owned();
        self.detach();
        if owned {
            if let Err(e) = ShmObject::unlink(&self.url) {
                warn!(url = %self.url, error = %e, "shm_unlink failed");
            }
            self.flags.unset(BackendFlags::OWNED);
            debug!(url = %self.url, "destroyed posix shm backend");
        }
    }
}

impl Drop for PosixShmMmap {
    fn drop(&mut self) {
        if self.is_owned() {
            self.destroy();
        } else {
            self.detach();
        }
    }
}
