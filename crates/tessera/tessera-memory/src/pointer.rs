//! Relocatable addressing primitives.
//!
//! Shared memory is mapped at a different virtual address in every process,
//! so nothing stored inside it may hold a raw pointer. Instead, locations are
//! expressed as an [`OffsetPointer`] (bytes from the start of a backend's data
//! region) and, where the owning allocator is not implied, a [`Pointer`]
//! which also names the [`AllocatorId`].

use std::fmt;

/// Identifies an allocator instance within a process's registry.
///
/// `major` is typically a node or program id, `minor` distinguishes
/// allocators created by the same program. The id is persisted inside the
/// allocator's shared header, so every process attaching to the region
/// resolves it to the same logical allocator.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorId {
    pub major: u32,
    pub minor: u32,
}

impl AllocatorId {
    /// Sentinel meaning "no allocator".
    pub const NULL: AllocatorId = AllocatorId {
        major: u32::MAX,
        minor: u32::MAX,
    };

    /// Id reserved for the process-local root allocator of a [`crate::MemoryManager`].
    pub const ROOT: AllocatorId = AllocatorId { major: 0, minor: 0 };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Byte offset from the base of the owning backend's data region.
///
/// The null sentinel is `u64::MAX` so that offset 0 stays a valid location.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OffsetPointer(u64);

impl OffsetPointer {
    pub const NULL: OffsetPointer = OffsetPointer(u64::MAX);

    #[inline]
    pub const fn new(off: u64) -> Self {
        Self(off)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    /// Offset `bytes` further into the same region. Null stays null.
    #[inline]
    pub const fn add(self, bytes: u64) -> Self {
        if self.is_null() {
            self
        } else {
            Self(self.0 + bytes)
        }
    }
}

impl Default for OffsetPointer {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for OffsetPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "+{:#x}", self.0)
        }
    }
}

/// Fully qualified shared-memory handle: allocator plus offset.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pointer {
    pub alloc_id: AllocatorId,
    pub off: OffsetPointer,
}

impl Pointer {
    pub const NULL: Pointer = Pointer {
        alloc_id: AllocatorId::NULL,
        off: OffsetPointer::NULL,
    };

    pub const fn new(alloc_id: AllocatorId, off: OffsetPointer) -> Self {
        Self { alloc_id, off }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.off.is_null()
    }
}

impl Default for Pointer {
    fn default() -> Self {
        Self::NULL
    }
}
