//! Spin lock that can live inside shared memory.
//!
//! The lock state is a single `AtomicU32`, so the same lock is honored by
//! every process that maps the region. Contended lockers spin briefly, then
//! yield through a [`ThreadModel`].

use crate::thread::{OsThreadModel, ThreadModel};
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const SPINS_BEFORE_YIELD: u32 = 64;

#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmMutex {
    state: AtomicU32,
}

impl ShmMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn lock(&self) -> ShmMutexGuard<'_> {
        self.lock_with(&OsThreadModel)
    }

    pub fn lock_with<Y: ThreadModel + ?Sized>(&self, thread: &Y) -> ShmMutexGuard<'_> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // Wait on a plain load so contended lockers don't bounce the line.
            while self.state.load(Ordering::Relaxed) == LOCKED {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    std::hint::spin_loop();
                } else {
                    thread.yield_now();
                }
            }
        }
    }

    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }
}

/// Releases the lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ShmMutexGuard<'a> {
    lock: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_lock_fails_while_held() {
        let m = ShmMutex::new();
        let g = m.lock();
        assert!(m.is_locked());
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(!m.is_locked());
        assert!(m.try_lock().is_some());
    }

    struct Counter {
        lock: ShmMutex,
        value: UnsafeCell<u64>,
    }

    unsafe impl Sync for Counter {}

    #[test]
    fn serializes_threads() {
        let c = Arc::new(Counter {
            lock: ShmMutex::new(),
            value: UnsafeCell::new(0),
        });
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let _g = c.lock.lock();
                        unsafe { *c.value.get() += 1 };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { *c.value.get() }, 40_000);
    }
}
