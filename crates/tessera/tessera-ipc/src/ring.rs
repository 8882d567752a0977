//! Slot storage and index arithmetic shared by the ring queues.
//!
//! Queues keep two monotonically increasing 64-bit counters, `head` and
//! `tail`. A counter maps to a slot by `counter % depth`; `tail - head` is
//! the number of occupied slots. With 64-bit counters wrap-around is not a
//! practical concern.
//!
//! ```text
//! depth = 4, head = 6, tail = 9
//!
//!   slot:   0     1     2     3
//!         ┌─────┬─────┬─────┬─────┐
//!         │  8  │     │  6  │  7  │   counters 6, 7, 8 occupied
//!         └─────┴─────┴─────┴─────┘
//!                       ▲ head % 4
//! ```

use crate::bitfield::AtomicBitfield32;
use crate::pair::Pair;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::AtomicU64;
use tessera_memory::{Allocator, OffsetPointer, Result};

/// Flag bit meaning "payload fully written".
pub(crate) const SLOT_READY: u32 = 1;

/// Queue slot whose payload is only valid while [`SLOT_READY`] is set.
pub(crate) type FlaggedSlot<T> = Pair<AtomicBitfield32, UnsafeCell<MaybeUninit<T>>>;

/// Plain slot for queues whose counters alone say which slots are live.
pub(crate) type Slot<T> = UnsafeCell<MaybeUninit<T>>;

/// Counter on its own cache line, so producers bumping `tail` don't
/// invalidate the consumer's `head`.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub(crate) struct PaddedCounter(pub AtomicU64);

impl PaddedCounter {
    pub(crate) const fn new(v: u64) -> Self {
        Self(AtomicU64::new(v))
    }
}

#[inline(always)]
pub(crate) fn slot_index(counter: u64, depth: u64) -> usize {
    (counter % depth) as usize
}

/// Allocate `depth` flagged slots with every flag cleared.
pub(crate) fn alloc_flagged_slots<T>(alloc: &dyn Allocator, depth: u64) -> Result<OffsetPointer> {
    let off = alloc.new_array::<FlaggedSlot<T>>(depth as usize)?;
    let base = alloc.convert::<FlaggedSlot<T>>(off);
    for i in 0..depth as usize {
        // SAFETY: `base` addresses `depth` freshly allocated slots. The
        // payload half may stay uninitialized.
        unsafe {
            Pair::emplace_piecewise(base.add(i), |flag| flag.write(AtomicBitfield32::new()), |_| {});
        }
    }
    Ok(off)
}

/// Allocate `depth` uninitialized slots.
pub(crate) fn alloc_slots<T>(alloc: &dyn Allocator, depth: u64) -> Result<OffsetPointer> {
    alloc.new_array::<Slot<T>>(depth as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn counters_wrap_onto_slots() {
        assert_eq!(slot_index(0, 4), 0);
        assert_eq!(slot_index(5, 4), 1);
        assert_eq!(slot_index(8, 4), 0);
        assert_eq!(slot_index(1001, 1000), 1);
    }

    #[test]
    fn padded_counter_fills_a_cache_line() {
        assert_eq!(size_of::<PaddedCounter>(), 64);
        assert_eq!(align_of::<PaddedCounter>(), 64);
    }
}
