use std::fmt;

/// Result of a queue operation: the counter value of the slot touched.
///
/// [`QueueToken::NULL`] means nothing happened (queue empty, slot not yet
/// published, or queue full for non-blocking producers).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueToken(u64);

impl QueueToken {
    pub const NULL: QueueToken = QueueToken(u64::MAX);

    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn id(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for QueueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_distinct_from_zero() {
        assert!(QueueToken::NULL.is_null());
        assert!(!QueueToken::new(0).is_null());
        assert_eq!(QueueToken::new(5).id(), 5);
        assert_eq!(QueueToken::new(5).to_string(), "#5");
        assert_eq!(QueueToken::NULL.to_string(), "null");
    }
}
