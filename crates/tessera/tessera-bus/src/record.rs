// Record crosses processes by value through the queue, so it must be POD
// with a fixed layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Record {
    /// Producer-assigned sequence number, starting at 0.
    pub seq: u64,
    /// Wall-clock nanoseconds at publication.
    pub ts_ns: u64,
    pub value: i64,
}

impl Record {
    pub fn new(seq: u64, ts_ns: u64, value: i64) -> Self {
        Self { seq, ts_ns, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    /// Record must stay within one cache line and keep 8-byte alignment.
    #[test]
    fn record_layout() {
        assert_eq!(size_of::<Record>(), 24);
        assert_eq!(align_of::<Record>(), 8);
    }
}
