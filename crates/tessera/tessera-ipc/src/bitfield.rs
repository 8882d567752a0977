use std::sync::atomic::{AtomicU32, Ordering};

/// Set of flag bits shared between processes.
///
/// Setting bits uses `Release` and testing them `Acquire`, so a writer that
/// fills a payload and then sets a bit makes that payload visible to any
/// reader that observes the bit.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct AtomicBitfield32(AtomicU32);

impl AtomicBitfield32 {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn set_bits(&self, mask: u32) {
        self.0.fetch_or(mask, Ordering::Release);
    }

    #[inline]
    pub fn unset_bits(&self, mask: u32) {
        self.0.fetch_and(!mask, Ordering::Release);
    }

    /// True if any bit of `mask` is set.
    #[inline]
    pub fn any(&self, mask: u32) -> bool {
        self.0.load(Ordering::Acquire) & mask != 0
    }

    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}
