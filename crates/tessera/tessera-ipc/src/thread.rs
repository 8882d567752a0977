/// How a blocked operation gives up the CPU while it waits.
pub trait ThreadModel: Send + Sync {
    fn yield_now(&self);
}

/// Yields to the OS scheduler.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsThreadModel;

impl ThreadModel for OsThreadModel {
    #[inline]
    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Busy-waits with a spin hint. Suited to pinned cores.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpinThreadModel;

impl ThreadModel for SpinThreadModel {
    #[inline]
    fn yield_now(&self) {
        std::hint::spin_loop();
    }
}
