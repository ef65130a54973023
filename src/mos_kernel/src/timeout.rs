//! The tick count and the timer queue
//!
//! The kernel keeps a 64-bit count of elapsed ticks. It's advanced lazily:
//! whenever the kernel needs the current time, it asks the port how many
//! whole ticks have elapsed since the last report ([`sync_ticks`]).
//!
//! Timed events (a thread's timed wait or a user [`Timer`]) are kept in a
//! single list sorted by absolute deadline, FIFO among equal deadlines. After
//! every change that could affect timing, [`update_tick_interval`] reprograms
//! the port's timer so that the next tick interrupt arrives exactly when
//! something needs to happen:
//!
//!  - next tick if the running thread shares its priority level with another
//!    runnable thread (round-robin needs a tick to rotate);
//!  - otherwise at the earliest deadline in the timer queue;
//!  - otherwise never if the idle context is running and tickless idle is
//!    enabled;
//!  - otherwise after `MAX_TICK_INTERVAL` ticks.
//!
//! Time spent idle with the timer stopped isn't counted. The port resumes
//! counting from the partial tick it stopped at.
use core::{fmt, num::NonZeroU32, ops, ptr};

use crate::{
    error::TimerError,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    semaphore,
    state::request_dispatch,
    thread::{self, ThreadCb},
    timer::Timer,
    utils::intrusive_list::{Link, ListAccessorCell, ListHead},
    wait, KernelTraits, PortThreading, System,
};

/// A timer queue entry, embedded in `ThreadCb` and `Timer`.
pub(crate) struct Timeout<Traits: PortThreading> {
    /// The absolute deadline in ticks.
    pub(crate) at: CpuLockCell<Traits, u64>,
    link: CpuLockCell<Traits, Option<Link<TimeoutRef<Traits>>>>,
}

impl<Traits: PortThreading> Timeout<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            at: CpuLockCell::new(0),
            link: CpuLockCell::new(None),
        }
    }

    pub(crate) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.link.read(&*lock).is_some()
    }
}

/// Identifies the owner of a [`Timeout`]. This is the element type of the
/// timer queue.
pub(crate) enum TimeoutRef<Traits: PortThreading> {
    /// A thread in a timed wait.
    Thread(&'static ThreadCb<Traits>),
    Timer(&'static Timer<Traits>),
}

impl<Traits: PortThreading> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for TimeoutRef<Traits> {}

impl<Traits: PortThreading> PartialEq for TimeoutRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Thread(x), Self::Thread(y)) => ptr::eq(*x, *y),
            (Self::Timer(x), Self::Timer(y)) => ptr::eq(*x, *y),
            _ => false,
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for TimeoutRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(x) => f.debug_tuple("Thread").field(&(*x as *const _)).finish(),
            Self::Timer(x) => f.debug_tuple("Timer").field(&(*x as *const _)).finish(),
        }
    }
}

impl<Traits: PortThreading> TimeoutRef<Traits> {
    fn timeout(self) -> &'static Timeout<Traits> {
        match self {
            Self::Thread(thread) => &thread.timeout,
            Self::Timer(timer) => &timer.timeout,
        }
    }
}

/// A virtual container of [`Timeout`]s indexed by [`TimeoutRef`].
pub(crate) struct TimeoutPool;

impl<Traits: PortThreading> ops::Index<TimeoutRef<Traits>> for TimeoutPool {
    type Output = Timeout<Traits>;

    #[inline]
    fn index(&self, index: TimeoutRef<Traits>) -> &Self::Output {
        index.timeout()
    }
}

/// Get a `ListAccessorCell` used to access the timer queue.
macro_rules! timeout_list_accessor {
    ($head:expr, $key:expr) => {{
        let accessor = ListAccessorCell::new($head, &TimeoutPool, |timeout| &timeout.link, $key);

        // Safety: This linked list is structurally sound.
        #[allow(unused_unsafe)]
        unsafe {
            accessor.unchecked()
        }
    }};
}

/// The global state of the timekeeping subsystem.
pub(crate) struct TimeoutGlobals<Traits: PortThreading> {
    /// The number of ticks elapsed since boot, as of the last report from the
    /// port.
    tick_count: CpuLockCell<Traits, u64>,

    /// The timer queue, sorted by `Timeout::at`.
    queue: CpuLockCell<Traits, ListHead<TimeoutRef<Traits>>>,
}

impl<Traits: PortThreading> TimeoutGlobals<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            tick_count: CpuLockCell::new(0),
            queue: CpuLockCell::new(ListHead::new()),
        }
    }
}

/// Collect the ticks the port has counted since the last report. Returns the
/// number of new ticks.
fn sync_ticks<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) -> u32 {
    // Safety: CPU Lock active
    let elapsed = unsafe { Traits::elapsed_ticks() };
    *Traits::state().timeout.tick_count.write(&mut *lock) += u64::from(elapsed);
    elapsed
}

/// Get the current tick count.
pub(crate) fn now<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) -> u64 {
    sync_ticks(lock.borrow_mut());
    *Traits::state().timeout.tick_count.read(&*lock)
}

/// Insert an entry into the timer queue, after all entries with the same or
/// an earlier deadline. The entry must not be linked already.
pub(crate) fn insert<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout_ref: TimeoutRef<Traits>,
) {
    let at = *timeout_ref.timeout().at.read(&*lock);
    let mut accessor = timeout_list_accessor!(&Traits::state().timeout.queue, lock.borrow_mut());

    let pos = accessor
        .iter()
        .map(|x| {
            let Ok(x) = x;
            x
        })
        .find(|(_, timeout)| *timeout.at.read(&**accessor.cell_key()) > at)
        .map(|(timeout_ref, _)| timeout_ref);

    // Safety: The caller ensures `timeout_ref` is unlinked
    unsafe { accessor.insert(timeout_ref, pos).unwrap_unchecked() };
}

/// Remove an entry from the timer queue. Does nothing if it's not linked.
pub(crate) fn remove<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    timeout_ref: TimeoutRef<Traits>,
) {
    let mut accessor = timeout_list_accessor!(&Traits::state().timeout.queue, lock);
    if accessor.is_linked(timeout_ref) {
        // Safety: The timer queue is the only list `Timeout::link` is used for
        unsafe { accessor.remove(timeout_ref).unwrap_unchecked() };
    }
}

/// Remove and return the first expired entry (an entry whose deadline is at
/// or before `now`) of the timer queue. If `timers_only` is set, expired
/// threads are skipped over.
fn pop_expired<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    now: u64,
    timers_only: bool,
) -> Option<TimeoutRef<Traits>> {
    let mut accessor = timeout_list_accessor!(&Traits::state().timeout.queue, lock.borrow_mut());

    let found = accessor
        .iter()
        .map(|x| {
            let Ok(x) = x;
            x
        })
        .take_while(|(_, timeout)| *timeout.at.read(&**accessor.cell_key()) <= now)
        .map(|(timeout_ref, _)| timeout_ref)
        .find(|timeout_ref| !timers_only || matches!(timeout_ref, TimeoutRef::Timer(_)))?;

    // Safety: `found` is linked to this list
    Some(unsafe { accessor.remove(found).unwrap_unchecked() })
}

/// Handle an expired entry removed from the timer queue.
fn expire<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout_ref: TimeoutRef<Traits>,
    now: u64,
) {
    match timeout_ref {
        TimeoutRef::Thread(thread) => wait::handle_timeout(lock, thread),
        TimeoutRef::Timer(timer) => {
            if !timer.fire(lock.borrow_mut()) {
                // Not ready yet. Try again at the next tick.
                timer.timeout.at.replace(&mut *lock, now + 1);
                insert(lock, timeout_ref);
            }
        }
    }
}

/// Implements [`PortToKernel::timer_tick`].
///
/// Precondition: CPU Lock inactive, an interrupt context
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        debug_assert!(false, "`timer_tick` was called with CPU Lock active");
        return;
    };

    let elapsed = sync_ticks(lock.borrow_mut());

    let state = Traits::state();
    if !state.is_started() {
        return;
    }

    // Round-robin
    let rotate = elapsed > 0 && thread::is_running_thread_contended(lock.borrow_mut());
    if elapsed > 0 {
        state.time_slice_pending.replace(&mut *lock, true);
    }

    let now = *state.timeout.tick_count.read(&*lock);

    // User timers first. Their callbacks may post semaphores, which are
    // deferred to the handoff queue because CPU Lock is active.
    while let Some(timeout_ref) = pop_expired(lock.borrow_mut(), now, true) {
        expire(lock.borrow_mut(), timeout_ref, now);
    }

    // Deliver pending posts before expiring waits, so that a post and a
    // timeout at the same tick resolve in favour of the post
    semaphore::drain_handoff_queue(lock.borrow_mut());

    while let Some(timeout_ref) = pop_expired(lock.borrow_mut(), now, false) {
        expire(lock.borrow_mut(), timeout_ref, now);
    }

    if rotate {
        update_tick_interval(lock.borrow_mut());
        drop(lock);
        request_dispatch::<Traits>();
    } else {
        thread::unlock_cpu_and_check_preemption(lock);
    }
}

/// Calculate the distance to the next tick interrupt. `None` means no
/// interrupt is needed.
fn next_tick_interval<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<NonZeroU32> {
    const ONE: NonZeroU32 = NonZeroU32::MIN;

    let max = Traits::MAX_TICK_INTERVAL.max(1);

    if thread::is_running_thread_contended(lock.borrow_mut()) {
        return Some(ONE);
    }

    let now = *Traits::state().timeout.tick_count.read(&*lock);
    let accessor = timeout_list_accessor!(&Traits::state().timeout.queue, lock);
    match accessor.front_data() {
        Some(timeout) => {
            let remaining = timeout.at.read(&**accessor.cell_key()).saturating_sub(now);
            let interval = remaining.clamp(1, u64::from(max)) as u32;
            NonZeroU32::new(interval).or(Some(ONE))
        }
        // The timer may only stop in the idle context. Stopped time isn't
        // counted, and a running thread must see the tick count advance.
        None if Traits::TICKLESS_IDLE && Traits::state().running_thread().is_none() => None,
        None => NonZeroU32::new(max),
    }
}

/// Reprogram the port's timer after something affecting the next tick has
/// changed. Does nothing during the boot phase.
pub(crate) fn update_tick_interval<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    if !Traits::state().is_started() {
        return;
    }

    sync_ticks(lock.borrow_mut());
    let interval = next_tick_interval(lock.borrow_mut());

    // Safety: CPU Lock active
    let elapsed = unsafe { Traits::set_tick_interval(interval) };
    *Traits::state().timeout.tick_count.write(&mut *lock) += u64::from(elapsed);
}

impl<Traits: KernelTraits> System<Traits> {
    /// Get the number of ticks elapsed since boot.
    pub fn now() -> Result<u64, TimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(now(lock.borrow_mut()))
    }
}
