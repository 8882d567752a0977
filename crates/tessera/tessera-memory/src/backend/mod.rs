//! Memory backends: contiguous byte regions with a small persisted header.
//!
//! ```text
//! ┌──────────────────────────────┐  offset 0
//! │ MemoryBackendHeader          │  kind (u32) | id (u32) | data_size (u64)
//! │ (rest of the header page)    │
//! ├──────────────────────────────┤  offset page_size
//! │ data region (data_size B)    │  ← every OffsetPointer is relative to here
//! └──────────────────────────────┘
//! ```
//!
//! A backend is `INITIALIZED` while this process has the region mapped and
//! `OWNED` when this process is the one responsible for destroying the
//! underlying OS object. Many processes may attach to a region; exactly one
//! of them owns it.

mod array;
mod factory;
mod posix_mmap;
mod posix_shm;

pub use array::ArrayBackend;
pub use factory::MemoryBackendFactory;
pub use posix_mmap::PosixMmap;
pub use posix_shm::PosixShmMmap;

use std::fmt;

/// Kind of backend, persisted in the header as a `u32`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryBackendType {
    PosixShmMmap = 0,
    PosixMmap = 1,
    ArrayBackend = 2,
}

impl MemoryBackendType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::PosixShmMmap),
            1 => Some(Self::PosixMmap),
            2 => Some(Self::ArrayBackend),
            _ => None,
        }
    }
}

/// Identifier of a backend region.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryBackendId(pub u32);

impl MemoryBackendId {
    /// Id of the root backend backing a manager's default allocator.
    pub const ROOT: MemoryBackendId = MemoryBackendId(0);

    /// User backends are numbered from 1 so they never collide with the root.
    pub const fn get(id: u32) -> Self {
        Self(id + 1)
    }
}

impl fmt::Display for MemoryBackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend#{}", self.0)
    }
}

/// Header stored at byte 0 of every backend region.
///
/// `kind` is kept as a raw `u32`: the header may have been written by another
/// process and is validated through [`MemoryBackendHeader::kind`].
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBackendHeader {
    pub kind: u32,
    pub id: MemoryBackendId,
    pub data_size: u64,
}

impl MemoryBackendHeader {
    pub fn new(kind: MemoryBackendType, id: MemoryBackendId, data_size: usize) -> Self {
        Self {
            kind: kind as u32,
            id,
            data_size: data_size as u64,
        }
    }

    pub fn kind(&self) -> Option<MemoryBackendType> {
        MemoryBackendType::from_raw(self.kind)
    }
}

/// Lifecycle flags of a backend handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendFlags(u32);

impl BackendFlags {
    pub const INITIALIZED: u32 = 0x1;
    pub const OWNED: u32 = 0x2;

    #[inline]
    pub fn set(&mut self, bits: u32) {
        self.0 |= bits;
    }

    #[inline]
    pub fn unset(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    #[inline]
    pub fn any(&self, bits: u32) -> bool {
        self.0 & bits != 0
    }
}

/// A contiguous mapped byte region addressed by offsets.
pub trait MemoryBackend: Send + Sync {
    /// Copy of the persisted header.
    fn header(&self) -> MemoryBackendHeader;

    /// Base of the data region in this process, null once detached.
    fn data_ptr(&self) -> *mut u8;

    /// Size of the data region in bytes.
    fn data_size(&self) -> usize;

    fn flags(&self) -> BackendFlags;

    /// Name other processes use to attach, if the backend is shareable.
    fn url(&self) -> Option<&str> {
        None
    }

    /// Unmap the region from this process. Idempotent.
    fn detach(&mut self);

    /// Detach and, when owned, remove the underlying OS object. Idempotent.
    fn destroy(&mut self);

    fn kind(&self) -> Option<MemoryBackendType> {
        self.header().kind()
    }

    fn id(&self) -> MemoryBackendId {
        self.header().id
    }

    fn is_initialized(&self) -> bool {
        self.flags().any(BackendFlags::INITIALIZED)
    }

    fn is_owned(&self) -> bool {
        self.flags().any(BackendFlags::OWNED)
    }
}
