//! Signals
use core::fmt;

use crate::{
    error::{expect_not_timeout, WaitError, WaitTimeoutError},
    semaphore::{SemCore, SemMode},
    KernelTraits, PortThreading,
};

/// A 32-bit set of binary semaphores, meant for one reader and any number of
/// writers. Raising a bit wakes up the waiting thread, which takes every bit
/// set at that point.
///
/// A [`Queue`](crate::Queue) can be bound to a bit of a signal so that a
/// single thread can wait on several queues at once.
pub struct Signal<Traits: PortThreading> {
    pub(crate) core: SemCore<Traits>,
}

impl<Traits: PortThreading> Signal<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            core: SemCore::new(SemMode::Signal, 0),
        }
    }
}

impl<Traits: KernelTraits> Signal<Traits> {
    /// Set the bits in `mask`. ISR-safe.
    pub fn raise(&'static self, mask: u32) {
        if mask != 0 {
            self.core.post(mask);
        }
    }

    /// Block until some bit is set, then clear and return all set bits.
    pub fn wait(&'static self) -> Result<u32, WaitError> {
        self.core.wait(None).map_err(expect_not_timeout)
    }

    /// [`wait`](Self::wait) with a timeout measured in ticks.
    pub fn wait_or_timeout(&'static self, ticks: u32) -> Result<u32, WaitTimeoutError> {
        self.core.wait(Some(ticks))
    }

    /// Clear and return all set bits without blocking. Returns `0` if none is
    /// set. ISR-safe.
    pub fn poll(&'static self) -> u32 {
        self.core.try_take().unwrap_or(0)
    }
}

impl<Traits: KernelTraits> fmt::Debug for Signal<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("self", &(self as *const _))
            .field("mask", &self.core.value())
            .finish_non_exhaustive()
    }
}
