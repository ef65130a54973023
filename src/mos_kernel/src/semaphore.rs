//! Semaphores and the ISR-to-scheduler handoff queue
//!
//! The value of a semaphore lives under IRQ Lock so that posting and polling
//! are possible from any interrupt handler. A post that can't take CPU Lock
//! (because it's made from an interrupt context, or CPU Lock is already
//! active) only deposits the value and links the semaphore into the *handoff
//! queue*. The scheduler drains the queue, delivering the deposited value to
//! the waiters, before every scheduling decision and in the tick handler.
use core::fmt;

use crate::{
    error::{expect_not_timeout, WaitError, WaitTimeoutError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut, IrqLockCell, IrqLockTokenRefMut},
    state::{expect_waitable_context, request_dispatch},
    thread::{self, ThreadCb, ThreadState},
    timeout,
    utils::intrusive_list::{Ident, ListAccessorCell, Static, StaticLink, StaticListHead},
    wait::{self, WaitObject},
    KernelTraits, PortThreading,
};

/// Get a `ListAccessorCell` used to access the handoff queue.
macro_rules! handoff_list_accessor {
    ($head:expr, $key:expr) => {{
        let accessor = ListAccessorCell::new($head, &Static, |sem| &sem.event_link, $key);

        // Safety: This linked list is structurally sound.
        #[allow(unused_unsafe)]
        unsafe {
            accessor.unchecked()
        }
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SemMode {
    /// The value is a count. A waiter takes one unit.
    Counting,
    /// The value is a bit mask. A waiter takes all set bits.
    Signal,
}

/// The common part of [`Semaphore`] and [`Signal`](crate::Signal).
pub(crate) struct SemCore<Traits: PortThreading> {
    value: IrqLockCell<Traits, u32>,
    mode: SemMode,
    pub(crate) waiters: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
    /// The link in the handoff queue.
    event_link: IrqLockCell<Traits, Option<StaticLink<SemCore<Traits>>>>,
}

impl<Traits: PortThreading> SemCore<Traits> {
    pub(crate) const fn new(mode: SemMode, initial: u32) -> Self {
        Self {
            value: IrqLockCell::new(initial),
            mode,
            waiters: CpuLockCell::new(StaticListHead::new()),
            event_link: IrqLockCell::new(None),
        }
    }
}

impl<Traits: KernelTraits> SemCore<Traits> {
    pub(crate) fn value(&self) -> u32 {
        let lock = klock::lock_irq::<Traits>();
        *self.value.read(&*lock)
    }

    /// Take from the value without blocking. Returns the amount taken (`1`
    /// or the whole mask).
    pub(crate) fn try_take(&self) -> Option<u32> {
        let mut lock = klock::lock_irq::<Traits>();
        let value = self.value.write(&mut *lock);
        match (self.mode, *value) {
            (_, 0) => None,
            (SemMode::Counting, _) => {
                *value -= 1;
                Some(1)
            }
            (SemMode::Signal, mask) => {
                *value = 0;
                Some(mask)
            }
        }
    }

    fn deposit(&self, mut lock: IrqLockTokenRefMut<'_, Traits>, x: u32) {
        let value = self.value.write(&mut *lock);
        *value = match self.mode {
            SemMode::Counting => value.saturating_add(x),
            SemMode::Signal => *value | x,
        };
    }

    /// Add `x` to the value (OR it in for a signal) and wake up waiters.
    /// ISR-safe.
    pub(crate) fn post(&'static self, x: u32) {
        if !Traits::is_interrupt_context() {
            if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
                {
                    let mut irq_lock = klock::lock_irq::<Traits>();
                    self.deposit(irq_lock.borrow_mut(), x);
                }
                self.transfer(lock.borrow_mut());
                thread::unlock_cpu_and_check_preemption(lock);
                return;
            }
        }

        // Waiters can't be touched from here. Leave it to the scheduler.
        {
            let mut irq_lock = klock::lock_irq::<Traits>();
            self.deposit(irq_lock.borrow_mut(), x);

            let mut accessor =
                handoff_list_accessor!(&Traits::state().handoff, irq_lock.borrow_mut());
            if !accessor.is_linked(Ident(self)) {
                // Safety: We just checked that `self` is unlinked
                unsafe { accessor.push_back(Ident(self)).unwrap_unchecked() };
            }
        }

        // An interrupt may have preempted a thread holding CPU Lock. The
        // pended dispatch runs once the lock is released and every handler has
        // returned. A thread context holding CPU Lock is inside the kernel,
        // which checks the handoff queue before releasing it.
        if Traits::is_interrupt_context() || !Traits::is_cpu_lock_active() {
            request_dispatch::<Traits>();
        }
    }

    /// Deliver the value to the waiters, most urgent first, for as long as
    /// there's something to take.
    fn transfer(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        while let Some(waiter) = wait::front_waiter(lock.borrow_mut(), &self.waiters) {
            let Some(payload) = self.try_take() else {
                break;
            };
            wait::complete_wait(lock.borrow_mut(), waiter, Ok(payload));
        }
    }

    /// Take from the value, blocking the calling thread until it becomes
    /// nonzero. `ticks` bounds the wait.
    pub(crate) fn wait(&'static self, ticks: Option<u32>) -> Result<u32, WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = expect_waitable_context::<Traits>()?;

        if let Some(payload) = self.try_take() {
            return Ok(payload);
        }

        let (st, at) = match ticks {
            Some(0) => return Err(WaitTimeoutError::Timeout),
            Some(ticks) => (
                ThreadState::WaitForSemOrTick,
                Some(timeout::now(lock.borrow_mut()) + u64::from(ticks)),
            ),
            None => (ThreadState::WaitForSem, None),
        };

        wait::wait_on(
            lock.borrow_mut(),
            thread,
            Some(WaitObject::Semaphore(self)),
            st,
            at,
        )
    }
}

/// Return `true` if there are deferred posts the scheduler hasn't seen.
pub(crate) fn has_pending_handoff<Traits: KernelTraits>() -> bool {
    let lock = klock::lock_irq::<Traits>();
    !Traits::state().handoff.read(&*lock).is_empty()
}

/// Deliver the deferred posts. Called by the scheduler and the tick handler.
pub(crate) fn drain_handoff_queue<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    loop {
        let sem = {
            let mut irq_lock = klock::lock_irq::<Traits>();
            let mut accessor =
                handoff_list_accessor!(&Traits::state().handoff, irq_lock.borrow_mut());
            let Ok(sem) = accessor.pop_front();
            sem
        };

        let Some(Ident(sem)) = sem else {
            break;
        };
        sem.transfer(lock.borrow_mut());
    }
}

/// A counting semaphore.
///
/// [`increment`](Self::increment), [`try_wait`](Self::try_wait), and
/// [`value`](Self::value) are ISR-safe.
pub struct Semaphore<Traits: PortThreading> {
    core: SemCore<Traits>,
}

impl<Traits: PortThreading> Semaphore<Traits> {
    pub const fn new(initial: u32) -> Self {
        Self {
            core: SemCore::new(SemMode::Counting, initial),
        }
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Increment the count, waking up the most urgent waiter if any.
    /// ISR-safe.
    pub fn increment(&'static self) {
        self.core.post(1);
    }

    /// Decrement the count, blocking until it's nonzero.
    pub fn wait(&'static self) -> Result<(), WaitError> {
        self.core
            .wait(None)
            .map(drop)
            .map_err(expect_not_timeout)
    }

    /// [`wait`](Self::wait) with a timeout measured in ticks. A zero timeout
    /// fails immediately unless the count is nonzero.
    pub fn wait_or_timeout(&'static self, ticks: u32) -> Result<(), WaitTimeoutError> {
        self.core.wait(Some(ticks)).map(drop)
    }

    /// Decrement the count if it's nonzero. ISR-safe.
    pub fn try_wait(&'static self) -> bool {
        self.core.try_take().is_some()
    }

    /// Get the current count. ISR-safe.
    pub fn value(&'static self) -> u32 {
        self.core.value()
    }
}

impl<Traits: KernelTraits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .field("value", &self.core.value)
            .finish_non_exhaustive()
    }
}
