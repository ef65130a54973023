//! User timers
use core::fmt;

use crate::{
    error::TimerError,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    timeout::{self, Timeout, TimeoutRef},
    KernelTraits, PortThreading,
};

/// A one-shot timer that calls a function after a given number of ticks.
///
/// The callback is called from the tick interrupt handler with CPU Lock
/// active, so it may only use ISR-safe operations (e.g.,
/// [`Semaphore::increment`], [`Signal::raise`], [`Queue::try_send`]). If it
/// returns `false`, the timer is re-armed to expire again at the next tick.
///
/// ```rust,ignore
/// static BLINK: Timer<SystemTraits> = Timer::new(|_| {
///     LED_SEM.increment();
///     true
/// });
///
/// BLINK.set(500, 0).unwrap();
/// ```
///
/// [`Semaphore::increment`]: crate::Semaphore::increment
/// [`Signal::raise`]: crate::Signal::raise
/// [`Queue::try_send`]: crate::Queue::try_send
pub struct Timer<Traits: PortThreading> {
    pub(crate) timeout: Timeout<Traits>,
    callback: fn(usize) -> bool,
    user_data: CpuLockCell<Traits, usize>,
    /// The interval given by the last `set`, used by `reset`.
    interval: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Timer<Traits> {
    pub const fn new(callback: fn(usize) -> bool) -> Self {
        Self {
            timeout: Timeout::new(),
            callback,
            user_data: CpuLockCell::new(0),
            interval: CpuLockCell::new(0),
        }
    }
}

impl<Traits: KernelTraits> Timer<Traits> {
    /// Arm the timer to expire `ticks` ticks from now, passing `user_data` to
    /// the callback. An armed timer is re-armed.
    pub fn set(&'static self, ticks: u32, user_data: usize) -> Result<(), TimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.set_inner(lock.borrow_mut(), ticks, user_data);
        Ok(())
    }

    /// Re-arm the timer with the interval and the parameter given by the last
    /// [`set`](Self::set).
    pub fn reset(&'static self) -> Result<(), TimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let ticks = *self.interval.read(&*lock);
        let user_data = *self.user_data.read(&*lock);
        self.set_inner(lock.borrow_mut(), ticks, user_data);
        Ok(())
    }

    /// Disarm the timer. Does nothing if the timer isn't armed.
    pub fn cancel(&'static self) -> Result<(), TimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        timeout::remove(lock.borrow_mut(), TimeoutRef::Timer(self));
        timeout::update_tick_interval(lock.borrow_mut());
        Ok(())
    }

    pub fn is_set(&'static self) -> Result<bool, TimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(self.timeout.is_linked(lock.borrow_mut()))
    }

    fn set_inner(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, ticks: u32, user_data: usize) {
        timeout::remove(lock.borrow_mut(), TimeoutRef::Timer(self));

        let at = timeout::now(lock.borrow_mut()) + u64::from(ticks);
        self.timeout.at.replace(&mut *lock, at);
        self.interval.replace(&mut *lock, ticks);
        self.user_data.replace(&mut *lock, user_data);

        timeout::insert(lock.borrow_mut(), TimeoutRef::Timer(self));
        timeout::update_tick_interval(lock);
    }

    /// Call the callback. Returns its result.
    pub(crate) fn fire(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let user_data = *self.user_data.read(&*lock);
        (self.callback)(user_data)
    }
}

impl<Traits: KernelTraits> fmt::Debug for Timer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("self", &(self as *const _))
            .field("callback", &(self.callback as *const ()))
            .field("at", &self.timeout.at)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
