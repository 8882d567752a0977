//! Packing call arguments into one shared-memory buffer.
//!
//! A serialized buffer is allocated from the sender's allocator and handed
//! to the receiver as a [`Pointer`]:
//!
//! ```text
//! ┌──────────────┬──────────────┬───────┬───────┬─────┐
//! │  alloc_id    │  payload len │ arg 0 │ arg 1 │ ... │
//! │  (8B)        │  (8B)        │       │       │     │
//! └──────────────┴──────────────┴───────┴───────┴─────┘
//! ```
//!
//! Plain values are stored by their native-endian bytes. Containers are
//! stored as the offset of their header and come back as a [`ShmRef`], so
//! the receiver reads the sender's data in place. Which types may appear as
//! arguments is decided at compile time by [`ShmSerialize`] and
//! [`ShmDeserialize`]; runtime checks reject null containers, containers from
//! another allocator, and reads past the payload.

use crate::container::{ShmContainer, ShmRef};
use crate::mpsc_queue::MpscQueue;
use crate::spsc_queue::SpscQueue;
use crate::ticket_queue::TicketQueue;
use crate::vector::ShmVec;
use std::mem::size_of;
use std::slice;
use std::sync::Arc;
use tessera_memory::{
    Allocator, AllocatorId, MemoryError, MemoryManager, OffsetPointer, Pointer, Result,
};

const ID_SIZE: usize = size_of::<AllocatorId>();
const PREFIX_SIZE: usize = ID_SIZE + size_of::<u64>();

fn incompatible(msg: impl Into<String>) -> MemoryError {
    MemoryError::ArgsNotShmCompatible(msg.into())
}

/// A value that can be written into a serialized buffer.
pub trait ShmSerialize {
    /// Bytes this value occupies in the buffer.
    const SHM_SIZE: usize;

    /// Write into `out`, which is exactly `SHM_SIZE` bytes long.
    fn shm_write(&self, alloc: &dyn Allocator, out: &mut [u8]) -> Result<()>;
}

/// A value that can be read back from a serialized buffer.
pub trait ShmDeserialize: Sized {
    const SHM_SIZE: usize;

    /// Read from `bytes`, which is exactly `SHM_SIZE` bytes long.
    fn shm_read(alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self>;
}

impl<T: ShmSerialize + ?Sized> ShmSerialize for &T {
    const SHM_SIZE: usize = T::SHM_SIZE;

    fn shm_write(&self, alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
        (**self).shm_write(alloc, out)
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| incompatible(format!("expected {N} bytes, got {}", bytes.len())))
}

macro_rules! impl_shm_pod {
    ($($t:ty),* $(,)?) => {$(
        impl ShmSerialize for $t {
            const SHM_SIZE: usize = size_of::<$t>();

            fn shm_write(&self, _alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
                out.copy_from_slice(&self.to_ne_bytes());
                Ok(())
            }
        }

        impl ShmDeserialize for $t {
            const SHM_SIZE: usize = size_of::<$t>();

            fn shm_read(_alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self> {
                Ok(<$t>::from_ne_bytes(fixed(bytes)?))
            }
        }
    )*};
}

impl_shm_pod!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl ShmSerialize for bool {
    const SHM_SIZE: usize = 1;

    fn shm_write(&self, _alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
        out[0] = *self as u8;
        Ok(())
    }
}

impl ShmDeserialize for bool {
    const SHM_SIZE: usize = 1;

    fn shm_read(_alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self> {
        match fixed::<1>(bytes)? {
            [0] => Ok(false),
            [1] => Ok(true),
            [b] => Err(incompatible(format!("invalid bool byte {b}"))),
        }
    }
}

impl<const N: usize> ShmSerialize for [u8; N] {
    const SHM_SIZE: usize = N;

    fn shm_write(&self, _alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> ShmDeserialize for [u8; N] {
    const SHM_SIZE: usize = N;

    fn shm_read(_alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self> {
        fixed(bytes)
    }
}

impl ShmSerialize for AllocatorId {
    const SHM_SIZE: usize = ID_SIZE;

    fn shm_write(&self, _alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
        out[..4].copy_from_slice(&self.major.to_ne_bytes());
        out[4..].copy_from_slice(&self.minor.to_ne_bytes());
        Ok(())
    }
}

impl ShmDeserialize for AllocatorId {
    const SHM_SIZE: usize = ID_SIZE;

    fn shm_read(_alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self> {
        let b: [u8; 8] = fixed(bytes)?;
        Ok(AllocatorId::new(
            u32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
            u32::from_ne_bytes([b[4], b[5], b[6], b[7]]),
        ))
    }
}

impl ShmSerialize for OffsetPointer {
    const SHM_SIZE: usize = 8;

    fn shm_write(&self, alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
        self.get().shm_write(alloc, out)
    }
}

impl ShmDeserialize for OffsetPointer {
    const SHM_SIZE: usize = 8;

    fn shm_read(alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self> {
        Ok(OffsetPointer::new(u64::shm_read(alloc, bytes)?))
    }
}

impl ShmSerialize for Pointer {
    const SHM_SIZE: usize = 16;

    fn shm_write(&self, alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
        self.alloc_id.shm_write(alloc, &mut out[..ID_SIZE])?;
        self.off.shm_write(alloc, &mut out[ID_SIZE..])
    }
}

impl ShmDeserialize for Pointer {
    const SHM_SIZE: usize = 16;

    fn shm_read(alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 16] = fixed(bytes)?;
        Ok(Pointer::new(
            AllocatorId::shm_read(alloc, &bytes[..ID_SIZE])?,
            OffsetPointer::shm_read(alloc, &bytes[ID_SIZE..])?,
        ))
    }
}

/// Containers are archived as the offset of their header.
fn write_container<C: ShmContainer>(c: &C, alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
    if c.is_null() {
        return Err(incompatible("null container"));
    }
    if c.allocator_id() != alloc.id() {
        return Err(incompatible(format!(
            "container belongs to allocator {}, buffer to {}",
            c.allocator_id(),
            alloc.id()
        )));
    }
    c.header_offset().shm_write(alloc, out)
}

macro_rules! impl_shm_container {
    ($($c:ident),* $(,)?) => {$(
        impl<T> ShmSerialize for $c<T> {
            const SHM_SIZE: usize = size_of::<OffsetPointer>();

            fn shm_write(&self, alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
                write_container(self, alloc, out)
            }
        }
    )*};
}

impl_shm_container!(MpscQueue, SpscQueue, TicketQueue, ShmVec);

impl<C: ShmContainer + ShmSerialize> ShmSerialize for ShmRef<C> {
    const SHM_SIZE: usize = C::SHM_SIZE;

    fn shm_write(&self, alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
        (**self).shm_write(alloc, out)
    }
}

impl<C: ShmContainer> ShmDeserialize for ShmRef<C> {
    const SHM_SIZE: usize = size_of::<OffsetPointer>();

    fn shm_read(alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self> {
        let off = OffsetPointer::shm_read(alloc, bytes)?;
        C::shm_deserialize(alloc, off).map_err(|e| incompatible(e.to_string()))
    }
}

/// A tuple of [`ShmSerialize`] arguments.
pub trait ShmSerializeArgs {
    const SHM_BUF_SIZE: usize;

    fn shm_write_all(&self, alloc: &dyn Allocator, out: &mut [u8]) -> Result<()>;
}

/// A tuple of [`ShmDeserialize`] arguments.
pub trait ShmDeserializeArgs: Sized {
    const SHM_BUF_SIZE: usize;

    fn shm_read_all(alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self>;
}

macro_rules! impl_shm_args {
    ($($name:ident),+) => {
        impl<$($name: ShmSerialize),+> ShmSerializeArgs for ($($name,)+) {
            const SHM_BUF_SIZE: usize = 0 $(+ <$name as ShmSerialize>::SHM_SIZE)+;

            #[allow(non_snake_case, unused_assignments)]
            fn shm_write_all(&self, alloc: &dyn Allocator, out: &mut [u8]) -> Result<()> {
                let ($($name,)+) = self;
                let mut at = 0;
                $(
                    let size = <$name as ShmSerialize>::SHM_SIZE;
                    $name.shm_write(alloc, &mut out[at..at + size])?;
                    at += size;
                )+
                Ok(())
            }
        }

        impl<$($name: ShmDeserialize),+> ShmDeserializeArgs for ($($name,)+) {
            const SHM_BUF_SIZE: usize = 0 $(+ <$name as ShmDeserialize>::SHM_SIZE)+;

            #[allow(unused_assignments)]
            fn shm_read_all(alloc: &Arc<dyn Allocator>, bytes: &[u8]) -> Result<Self> {
                if bytes.len() < Self::SHM_BUF_SIZE {
                    return Err(incompatible("read past end of buffer"));
                }
                let mut at = 0;
                Ok(($({
                    let size = <$name as ShmDeserialize>::SHM_SIZE;
                    let value = <$name as ShmDeserialize>::shm_read(alloc, &bytes[at..at + size])?;
                    at += size;
                    value
                },)+))
            }
        }
    };
}

impl_shm_args!(A);
impl_shm_args!(A, B);
impl_shm_args!(A, B, C);
impl_shm_args!(A, B, C, D);
impl_shm_args!(A, B, C, D, E);
impl_shm_args!(A, B, C, D, E, F);
impl_shm_args!(A, B, C, D, E, F, G);
impl_shm_args!(A, B, C, D, E, F, G, H);

/// Writes argument tuples into freshly allocated buffers.
pub struct ShmSerializer;

impl ShmSerializer {
    /// Payload bytes needed for `args`, excluding the id/length prefix.
    pub fn shm_buf_size<A: ShmSerializeArgs>(_args: &A) -> usize {
        A::SHM_BUF_SIZE
    }

    /// Allocate a buffer from `alloc` and write `args` into it.
    pub fn shm_serialize<A: ShmSerializeArgs>(alloc: &dyn Allocator, args: &A) -> Result<Pointer> {
        let len = A::SHM_BUF_SIZE;
        let off = alloc.allocate(PREFIX_SIZE + len)?;
        // SAFETY: the block was just allocated with this size.
        let buf = unsafe { slice::from_raw_parts_mut(alloc.convert::<u8>(off), PREFIX_SIZE + len) };
        let written = alloc
            .id()
            .shm_write(alloc, &mut buf[..ID_SIZE])
            .and_then(|()| (len as u64).shm_write(alloc, &mut buf[ID_SIZE..PREFIX_SIZE]))
            .and_then(|()| args.shm_write_all(alloc, &mut buf[PREFIX_SIZE..]));
        if let Err(e) = written {
            alloc.free(off);
            return Err(e);
        }
        Ok(alloc.full_pointer(off))
    }

    /// Release a buffer returned by [`shm_serialize`](Self::shm_serialize).
    pub fn free(alloc: &dyn Allocator, ptr: Pointer) -> Result<()> {
        if ptr.alloc_id != alloc.id() {
            return Err(incompatible(format!(
                "buffer belongs to allocator {}, not {}",
                ptr.alloc_id,
                alloc.id()
            )));
        }
        alloc.free(ptr.off);
        Ok(())
    }
}

/// Reads arguments back out of a serialized buffer, in order.
pub struct ShmDeserializer {
    alloc: Arc<dyn Allocator>,
    payload: OffsetPointer,
    len: usize,
    cursor: usize,
}

impl ShmDeserializer {
    pub fn new(mm: &MemoryManager, ptr: Pointer) -> Result<Self> {
        if ptr.is_null() {
            return Err(incompatible("null buffer"));
        }
        let alloc = mm.resolve(ptr.alloc_id)?;
        let data_size = alloc.backend().data_size() as u64;
        let fits = |len: u64| ptr.off.get().checked_add(len).is_some_and(|end| end <= data_size);
        if !fits(PREFIX_SIZE as u64) {
            return Err(incompatible("buffer outside allocator"));
        }
        // SAFETY: the prefix lies inside the data region.
        let prefix = unsafe { slice::from_raw_parts(alloc.convert::<u8>(ptr.off), PREFIX_SIZE) };
        let stored = AllocatorId::shm_read(&alloc, &prefix[..ID_SIZE])?;
        if stored != ptr.alloc_id {
            return Err(incompatible(format!(
                "buffer written by allocator {stored}, pointer names {}",
                ptr.alloc_id
            )));
        }
        let len = u64::shm_read(&alloc, &prefix[ID_SIZE..])?;
        if !fits(PREFIX_SIZE as u64 + len) {
            return Err(incompatible("buffer outside allocator"));
        }
        Ok(Self {
            alloc,
            payload: ptr.off.add(PREFIX_SIZE as u64),
            len: len as usize,
            cursor: 0,
        })
    }

    pub fn alloc(&self) -> &Arc<dyn Allocator> {
        &self.alloc
    }

    /// Payload bytes not read yet.
    pub fn remaining(&self) -> usize {
        self.len - self.cursor
    }

    fn next_bytes(&mut self, size: usize) -> Result<&[u8]> {
        if size > self.remaining() {
            return Err(incompatible("read past end of buffer"));
        }
        let at = self.payload.add(self.cursor as u64);
        self.cursor += size;
        // SAFETY: [payload, payload + len) was bounds-checked in `new`.
        Ok(unsafe { slice::from_raw_parts(self.alloc.convert::<u8>(at), size) })
    }

    pub fn read<T: ShmDeserialize>(&mut self) -> Result<T> {
        let alloc = self.alloc.clone();
        let bytes = self.next_bytes(T::SHM_SIZE)?;
        T::shm_read(&alloc, bytes)
    }

    pub fn read_all<A: ShmDeserializeArgs>(&mut self) -> Result<A> {
        let alloc = self.alloc.clone();
        let bytes = self.next_bytes(A::SHM_BUF_SIZE)?;
        A::shm_read_all(&alloc, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_memory::{ArrayBackend, MemoryBackendId, StackAllocator};

    fn manager_with(id: AllocatorId) -> (MemoryManager, Arc<dyn Allocator>) {
        let mm = MemoryManager::with_root_size(1 << 16).unwrap();
        let backend = ArrayBackend::shm_init(MemoryBackendId::get(id.major), 1 << 16).unwrap();
        let alloc: Arc<dyn Allocator> = Arc::new(StackAllocator::create(Box::new(backend), id, 0).unwrap());
        mm.register(alloc.clone());
        (mm, alloc)
    }

    #[test]
    fn plain_values_round_trip() {
        let (mm, alloc) = manager_with(AllocatorId::new(4, 2));
        let args = (7u8, -3i64, 2.5f64, true, [1u8, 2, 3], AllocatorId::new(1, 9));
        assert_eq!(ShmSerializer::shm_buf_size(&args), 1 + 8 + 8 + 1 + 3 + 8);

        let ptr = ShmSerializer::shm_serialize(&*alloc, &args).unwrap();
        assert_eq!(ptr.alloc_id, alloc.id());

        let mut de = ShmDeserializer::new(&mm, ptr).unwrap();
        assert_eq!(de.read::<u8>().unwrap(), 7);
        let rest: (i64, f64, bool, [u8; 3], AllocatorId) = de.read_all().unwrap();
        assert_eq!(rest, (-3, 2.5, true, [1, 2, 3], AllocatorId::new(1, 9)));
        assert_eq!(de.remaining(), 0);
        assert!(de.read::<u8>().is_err());

        ShmSerializer::free(&*alloc, ptr).unwrap();
    }

    #[test]
    fn containers_travel_by_offset() {
        let (mm, alloc) = manager_with(AllocatorId::new(4, 2));
        let v = ShmVec::from_slice_in(&alloc, &[10u32, 20, 30]).unwrap();
        let q = MpscQueue::<u64>::new_in(&alloc, 4).unwrap();
        q.emplace(99);

        let ptr = ShmSerializer::shm_serialize(&*alloc, &(5u32, &v, &q)).unwrap();
        let mut de = ShmDeserializer::new(&mm, ptr).unwrap();
        let (n, v2, mut q2): (u32, ShmRef<ShmVec<u32>>, ShmRef<MpscQueue<u64>>) = de.read_all().unwrap();
        assert_eq!(n, 5);
        assert_eq!(v2.as_slice(), v.as_slice());
        assert_eq!(v2.header_offset(), v.header_offset());
        assert_eq!(q2.try_pop(), Some(99));
        drop((v2, q2));
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn foreign_and_null_containers_are_rejected() {
        let (_mm, alloc) = manager_with(AllocatorId::new(4, 2));
        let (_other_mm, other) = manager_with(AllocatorId::new(5, 0));
        let before = alloc.allocated_bytes();

        let foreign = ShmVec::from_slice_in(&other, &[1u8]).unwrap();
        let err = ShmSerializer::shm_serialize(&*alloc, &(1u32, &foreign)).unwrap_err();
        assert!(matches!(err, MemoryError::ArgsNotShmCompatible(_)));

        let mut null = ShmVec::<u8>::new_in(&alloc).unwrap();
        null.shm_destroy();
        let before_null = alloc.allocated_bytes();
        assert!(ShmSerializer::shm_serialize(&*alloc, &(&null,)).is_err());
        assert_eq!(alloc.allocated_bytes(), before_null);
        assert_eq!(before_null, before);
    }

    #[test]
    fn deserializer_checks_the_pointer() {
        let (mm, alloc) = manager_with(AllocatorId::new(4, 2));
        let ptr = ShmSerializer::shm_serialize(&*alloc, &(1u64,)).unwrap();

        let unknown = Pointer::new(AllocatorId::new(8, 8), ptr.off);
        assert!(matches!(
            ShmDeserializer::new(&mm, unknown),
            Err(MemoryError::UnknownAllocator(_))
        ));
        assert!(ShmDeserializer::new(&mm, Pointer::NULL).is_err());
        let outside = Pointer::new(alloc.id(), OffsetPointer::new(1 << 20));
        assert!(ShmDeserializer::new(&mm, outside).is_err());

        let mut de = ShmDeserializer::new(&mm, ptr).unwrap();
        assert!(de.read::<u128>().is_err());
        assert_eq!(de.read::<u64>().unwrap(), 1);
    }

    #[test]
    fn bad_bool_byte_is_rejected() {
        let (_mm, alloc) = manager_with(AllocatorId::new(4, 2));
        assert!(bool::shm_read(&alloc, &[2]).is_err());
        assert!(bool::shm_read(&alloc, &[1]).unwrap());
    }
}
