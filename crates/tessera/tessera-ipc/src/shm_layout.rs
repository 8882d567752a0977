//! Common prefix of every container header stored in shared memory.
//!
//! Containers keep their state in a `#[repr(C)]` header allocated from their
//! allocator. The header always starts with a [`ContainerHeader`], so a
//! process that is handed a bare offset can check that it really points at
//! the expected container before reconstructing a handle around it.
//!
//! ```text
//! ┌──────────┬───────────┬──────────────┬───────────────────────────┐
//! │  magic   │ elem_size │   alloc_id   │  container-specific state │
//! │  (4B)    │  (4B)     │  (8B)        │  ...                      │
//! └──────────┴───────────┴──────────────┴───────────────────────────┘
//! ```

use tessera_memory::{Allocator, AllocatorId};

/// ASCII "TVEC".
pub const VEC_MAGIC: u32 = 0x5456_4543;
/// ASCII "TMPS".
pub const MPSC_MAGIC: u32 = 0x544D_5053;
/// ASCII "TSPS".
pub const SPSC_MAGIC: u32 = 0x5453_5053;
/// ASCII "TTKT".
pub const TICKET_MAGIC: u32 = 0x5454_4B54;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Container type tag.
    pub magic: u32,
    /// `size_of` the element type, to catch handles built with the wrong `T`.
    pub elem_size: u32,
    /// Allocator that owns this header and all storage it points to.
    pub alloc_id: AllocatorId,
}

impl ContainerHeader {
    /// Record the owning allocator of a container being constructed.
    pub fn init_shm_container(alloc: &dyn Allocator, magic: u32, elem_size: usize) -> Self {
        Self {
            magic,
            elem_size: elem_size as u32,
            alloc_id: alloc.id(),
        }
    }

    /// Checks a header found in shared memory against what the caller expects.
    pub fn validate(
        &self,
        magic: u32,
        elem_size: usize,
        alloc_id: AllocatorId,
    ) -> Result<(), &'static str> {
        if self.magic != magic {
            return Err("container type mismatch");
        }
        if self.elem_size as usize != elem_size {
            return Err("element size mismatch");
        }
        if self.alloc_id != alloc_id {
            return Err("container belongs to another allocator");
        }
        Ok(())
    }
}
