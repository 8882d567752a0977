//! Bump allocator whose state lives in the backend itself.
//!
//! ```text
//! data offset 0
//! ┌────────────────────────┬──────────────────┬──────────────────────────────┐
//! │ StackAllocatorHeader   │ custom header    │ heap ──► cursor              │
//! │ magic | id | cursor .. │ (user root data) │ [blk|payload][blk|payload].. │
//! └────────────────────────┴──────────────────┴──────────────────────────────┘
//! ```
//!
//! Every block is preceded by a 16-byte [`BlockHeader`] recording where the
//! block starts and how many bytes it spans. Freeing the most recent block
//! rewinds the cursor; freeing anything else only updates the statistics.
//! Because the header is persisted in the region, a second process can
//! [`attach`](StackAllocator::attach) and keep allocating from the same heap.

use super::{Allocator, AllocatorType, DEFAULT_ALIGN};
use crate::backend::MemoryBackend;
use crate::error::{MemoryError, Result};
use crate::pointer::{AllocatorId, OffsetPointer};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// ASCII "TESSTACK".
pub const STACK_ALLOCATOR_MAGIC: u64 = 0x5445_5353_5441_434B;

const HEAP_ALIGN: u64 = 64;

#[repr(C, align(64))]
struct StackAllocatorHeader {
    /// Stored last, so an attacher that sees it sees every other field.
    magic: AtomicU64,
    alloc_id: AllocatorId,
    custom_header_off: u64,
    custom_header_size: u64,
    heap_begin: u64,
    heap_end: u64,
    /// Offset of the next free byte.
    cursor: AtomicU64,
    /// Bytes currently handed out, block headers included.
    allocated: AtomicU64,
}

#[repr(C)]
struct BlockHeader {
    start: u64,
    span: u64,
}

const BLOCK: u64 = size_of::<BlockHeader>() as u64;

#[inline(always)]
/// `None` when rounding up would pass `u64::MAX`.
fn align_up(v: u64, align: u64) -> Option<u64> {
    v.checked_add(align - 1).map(|v| v & !(align - 1))
}

pub struct StackAllocator {
    backend: Box<dyn MemoryBackend>,
    id: AllocatorId,
}

impl StackAllocator {
    /// Format `backend` as a fresh stack heap, reserving `custom_header_size`
    /// bytes for user root data.
    pub fn create(
        backend: Box<dyn MemoryBackend>,
        id: AllocatorId,
        custom_header_size: usize,
    ) -> Result<Self> {
        let data_size = backend.data_size() as u64;
        let custom_header_off = (size_of::<StackAllocatorHeader>() as u64).next_multiple_of(HEAP_ALIGN);
        let heap_begin = custom_header_off
            .checked_add(custom_header_size as u64)
            .and_then(|end| align_up(end, HEAP_ALIGN))
            .unwrap_or(u64::MAX);
        if heap_begin > data_size {
            return Err(MemoryError::OutOfMemory {
                requested: heap_begin as usize,
                available: data_size as usize,
            });
        }

        let base = backend.data_ptr();
        // SAFETY: the region is at least `heap_begin` bytes and 64-byte aligned
        // (page aligned for mappings, chunk aligned for arrays).
        unsafe {
            ptr::write(
                base as *mut StackAllocatorHeader,
                StackAllocatorHeader {
                    magic: AtomicU64::new(0),
                    alloc_id: id,
                    custom_header_off,
                    custom_header_size: custom_header_size as u64,
                    heap_begin,
                    heap_end: data_size,
                    cursor: AtomicU64::new(heap_begin),
                    allocated: AtomicU64::new(0),
                },
            );
            ptr::write_bytes(base.add(custom_header_off as usize), 0, custom_header_size);
            (*(base as *const StackAllocatorHeader))
                .magic
                .store(STACK_ALLOCATOR_MAGIC, Ordering::Release);
        }
        debug!(%id, heap_begin, heap_end = data_size, "created stack allocator");
        Ok(Self { backend, id })
    }

    /// Reopen an allocator previously created in `backend` (typically by another process).
    pub fn attach(backend: Box<dyn MemoryBackend>) -> Result<Self> {
        if backend.data_size() < size_of::<StackAllocatorHeader>() {
            return Err(MemoryError::InvalidHeader("region too small for a stack allocator"));
        }
        // SAFETY: the region holds at least a header's worth of bytes.
        let (magic, id) = unsafe {
            let h = &*(backend.data_ptr() as *const StackAllocatorHeader);
            (h.magic.load(Ordering::Acquire), h.alloc_id)
        };
        if magic != STACK_ALLOCATOR_MAGIC {
            return Err(MemoryError::InvalidHeader("bad stack allocator magic"));
        }
        debug!(%id, "attached stack allocator");
        Ok(Self { backend, id })
    }

    #[inline(always)]
    fn header(&self) -> &StackAllocatorHeader {
        // SAFETY: create/attach validated the header; the backend stays
        // mapped for the allocator's lifetime.
        unsafe { &*(self.backend.data_ptr() as *const StackAllocatorHeader) }
    }

    /// Bytes left between the cursor and the end of the heap.
    pub fn remaining(&self) -> usize {
        let h = self.header();
        h.heap_end.saturating_sub(h.cursor.load(Ordering::Acquire)) as usize
    }

    pub fn custom_header_size(&self) -> usize {
        self.header().custom_header_size as usize
    }
}

impl Allocator for StackAllocator {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn kind(&self) -> AllocatorType {
        AllocatorType::Stack
    }

    fn backend(&self) -> &dyn MemoryBackend {
        self.backend.as_ref()
    }

    fn aligned_allocate(&self, size: usize, align: usize) -> Result<OffsetPointer> {
        let h = self.header();
        let out_of_memory = |start: u64| MemoryError::OutOfMemory {
            requested: size,
            available: h.heap_end.saturating_sub(start) as usize,
        };
        let mut start = h.cursor.load(Ordering::Acquire);
        let Some(align) = align.max(DEFAULT_ALIGN).checked_next_power_of_two() else {
            return Err(out_of_memory(start));
        };
        let align = align as u64;
        loop {
            let payload = start.checked_add(BLOCK).and_then(|v| align_up(v, align));
            let end = payload.and_then(|p| p.checked_add(size as u64));
            let (Some(payload), Some(end)) = (payload, end) else {
                return Err(out_of_memory(start));
            };
            if end > h.heap_end {
                return Err(out_of_memory(start));
            }
            match h
                .cursor
                .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let span = end - start;
                    // SAFETY: [start, end) now belongs to this call; the block
                    // header sits in the padding right before the payload.
                    unsafe {
                        let blk = self.backend.data_ptr().add((payload - BLOCK) as usize)
                            as *mut BlockHeader;
                        ptr::write(blk, BlockHeader { start, span });
                    }
                    h.allocated.fetch_add(span, Ordering::Relaxed);
                    return Ok(OffsetPointer::new(payload));
                }
                Err(actual) => start = actual,
            }
        }
    }

    fn free(&self, p: OffsetPointer) {
        if p.is_null() {
            return;
        }
        let h = self.header();
        // SAFETY: p was returned by aligned_allocate, so a block header precedes it.
        let (start, span) = unsafe {
            let blk = &*(self.backend.data_ptr().add((p.get() - BLOCK) as usize)
                as *const BlockHeader);
            (blk.start, blk.span)
        };
        h.allocated.fetch_sub(span, Ordering::Relaxed);
        // Only the topmost block can be reclaimed.
        let _ = h.cursor.compare_exchange(
            start + span,
            start,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn custom_header(&self) -> OffsetPointer {
        let h = self.header();
        if h.custom_header_size == 0 {
            return OffsetPointer::NULL;
        }
        OffsetPointer::new(h.custom_header_off)
    }

    fn allocated_bytes(&self) -> usize {
        self.header().allocated.load(Ordering::Relaxed) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ArrayBackend, MemoryBackendId};

    fn stack(size: usize, custom: usize) -> StackAllocator {
        let backend = ArrayBackend::shm_init(MemoryBackendId::get(0), size).expect("backend");
        StackAllocator::create(Box::new(backend), AllocatorId::new(1, 0), custom).expect("alloc")
    }

    #[test]
    fn allocations_respect_alignment() {
        let a = stack(1 << 16, 0);
        for align in [16usize, 64, 256, 4096] {
            let p = a.aligned_allocate(24, align).expect("alloc");
            assert_eq!(p.get() % align as u64, 0, "align {align}");
            assert!(a.contains(p));
        }
    }

    #[test]
    fn allocations_do_not_overlap() {
        let a = stack(1 << 16, 0);
        let p1 = a.allocate(100).expect("p1");
        let p2 = a.allocate(100).expect("p2");
        assert!(p2.get() >= p1.get() + 100);
    }

    #[test]
    fn exhausting_the_heap_reports_out_of_memory() {
        let a = stack(4096, 0);
        let err = a.allocate(1 << 20).err().expect("must fail");
        match err {
            MemoryError::OutOfMemory { requested, available } => {
                assert_eq!(requested, 1 << 20);
                assert!(available < 4096);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Freeing the newest block rewinds the cursor so the space is reused.
    #[test]
    fn freeing_top_block_reclaims_space() {
        let a = stack(1 << 16, 0);
        let before = a.remaining();
        let p = a.allocate(512).expect("alloc");
        assert!(a.allocated_bytes() >= 512);
        a.free(p);
        assert_eq!(a.allocated_bytes(), 0);
        assert_eq!(a.remaining(), before);
        let again = a.allocate(512).expect("realloc");
        assert_eq!(again, p);
    }

    #[test]
    fn freeing_inner_block_only_updates_stats() {
        let a = stack(1 << 16, 0);
        let p1 = a.allocate(64).expect("p1");
        let _p2 = a.allocate(64).expect("p2");
        let remaining = a.remaining();
        a.free(p1);
        assert_eq!(a.remaining(), remaining);
        a.free(OffsetPointer::NULL);
    }

    #[test]
    fn impossible_sizes_report_out_of_memory() {
        let a = stack(1 << 16, 0);
        let dyn_a: &dyn Allocator = &a;
        let before = a.remaining();
        for result in [
            dyn_a.new_array::<u64>(usize::MAX / 4),
            a.allocate(usize::MAX),
            a.allocate(usize::MAX - 8),
            a.aligned_allocate(8, 1 << 63),
            a.aligned_allocate(8, usize::MAX),
        ] {
            assert!(matches!(result, Err(MemoryError::OutOfMemory { .. })), "{result:?}");
        }
        assert_eq!(a.remaining(), before);
        assert!(a.allocate(64).is_ok());
    }

    #[test]
    fn oversized_custom_header_is_rejected() {
        let backend = ArrayBackend::shm_init(MemoryBackendId::get(0), 1 << 12).expect("backend");
        assert!(StackAllocator::create(Box::new(backend), AllocatorId::new(1, 0), usize::MAX).is_err());
    }

    #[test]
    fn custom_header_precedes_heap_and_is_zeroed() {
        let a = stack(1 << 16, 128);
        let hdr = a.custom_header();
        assert!(!hdr.is_null());
        let p = a.allocate(8).expect("alloc");
        assert!(p.get() >= hdr.get() + 128);
        let dyn_a: &dyn Allocator = &a;
        let bytes = unsafe { std::slice::from_raw_parts(dyn_a.convert::<u8>(hdr), 128) };
        assert!(bytes.iter().all(|&b| b == 0));

        assert!(stack(1 << 12, 0).custom_header().is_null());
    }

    #[test]
    fn region_smaller_than_header_is_rejected() {
        let backend = ArrayBackend::shm_init(MemoryBackendId::get(0), 32).expect("backend");
        assert!(StackAllocator::create(Box::new(backend), AllocatorId::new(1, 0), 0).is_err());
    }

    #[test]
    fn objects_are_constructed_and_dropped_in_place() {
        let a = stack(1 << 16, 0);
        let dyn_a: &dyn Allocator = &a;
        let p = dyn_a.new_obj(String::from("in shared memory")).expect("new_obj");
        let s = unsafe { &*dyn_a.convert::<String>(p) };
        assert_eq!(s, "in shared memory");
        assert_eq!(dyn_a.to_offset(s as *const String), p);
        unsafe { dyn_a.del_obj::<String>(p) };
        assert_eq!(a.allocated_bytes(), 0);
    }
}
