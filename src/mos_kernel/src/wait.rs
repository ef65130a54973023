//! Pend queues and the generic blocking machinery
//!
//! A blocked thread is linked (through `ThreadCb::sched_link`, the same link
//! used by run queues) into the *pend queue* of the object it waits on, which
//! is ordered by effective priority and FIFO within a priority. A timed wait
//! additionally links the thread into the timer queue. Whichever of the two
//! fires first completes the wait through [`complete_wait`], which unlinks the
//! thread from both.
use core::fmt;

use crate::{
    error::WaitTimeoutError,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    mutex::{self, Mutex},
    semaphore::SemCore,
    thread::{self, sched_list_accessor, ThreadCb, ThreadState},
    timeout::{self, TimeoutRef},
    utils::intrusive_list::{Ident, StaticListHead},
    KernelTraits, PortThreading,
};

/// The object a thread is blocked on.
pub(crate) enum WaitObject<Traits: PortThreading> {
    Semaphore(&'static SemCore<Traits>),
    Mutex(&'static Mutex<Traits>),
    /// Waiting for the specified thread to stop.
    ThreadStop(&'static ThreadCb<Traits>),
}

impl<Traits: PortThreading> Clone for WaitObject<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for WaitObject<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitObject<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Semaphore(x) => f.debug_tuple("Semaphore").field(&(*x as *const _)).finish(),
            Self::Mutex(x) => f.debug_tuple("Mutex").field(&(*x as *const _)).finish(),
            Self::ThreadStop(x) => f.debug_tuple("ThreadStop").field(&(*x as *const _)).finish(),
        }
    }
}

impl<Traits: PortThreading> WaitObject<Traits> {
    /// Get the pend queue of the object.
    fn queue(self) -> &'static CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>> {
        match self {
            Self::Semaphore(sem) => &sem.waiters,
            Self::Mutex(mutex) => &mutex.waiters,
            Self::ThreadStop(thread) => &thread.stop_waiters,
        }
    }
}

/// The per-thread wait state, embedded in `ThreadCb`.
pub(crate) struct ThreadWait<Traits: PortThreading> {
    /// The object the thread is blocked on. `None` when the thread is not
    /// blocked, or blocked only on time.
    pub(crate) blocked_on: CpuLockCell<Traits, Option<WaitObject<Traits>>>,

    /// The outcome of the last wait. The completer stores the payload here
    /// (the semaphore units taken, the signal mask, or the exit value of the
    /// thread waited for) before making the thread runnable.
    pub(crate) result: CpuLockCell<Traits, Result<u32, WaitTimeoutError>>,
}

impl<Traits: PortThreading> ThreadWait<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            blocked_on: CpuLockCell::new(None),
            result: CpuLockCell::new(Ok(0)),
        }
    }
}

/// Insert `thread` into `queue` after every waiter with the same or a more
/// urgent effective priority.
fn insert_by_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &'static CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
    thread: &'static ThreadCb<Traits>,
) {
    let pri = *thread.pri.read(&*lock);
    let mut accessor = sched_list_accessor!(queue, lock.borrow_mut());

    let at = accessor
        .iter()
        .map(|x| {
            let Ok((ident, waiter)) = x;
            (ident, waiter)
        })
        .find(|(_, waiter)| *waiter.pri.read(&**accessor.cell_key()) > pri)
        .map(|(ident, _)| ident);

    // Safety: A waiting thread is in no run queue or pend queue
    unsafe { accessor.insert(Ident(thread), at).unwrap_unchecked() };
}

/// Get the first (most urgent) waiter of `queue`.
pub(crate) fn front_waiter<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &'static CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
) -> Option<&'static ThreadCb<Traits>> {
    sched_list_accessor!(queue, lock).front().map(|x| x.0)
}

/// Put the running thread into the waiting state `st`, linking it into the
/// pend queue of `object` (if any) and, if `at` is given, into the timer queue
/// with the absolute deadline `at`.
///
/// The thread keeps running until [`finish_wait`] is called.
pub(crate) fn prepare_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    object: Option<WaitObject<Traits>>,
    st: ThreadState,
    at: Option<u64>,
) {
    debug_assert!(st.is_waiting());

    thread::remove_from_run_queue(lock.borrow_mut(), thread);
    thread.st.replace(&mut *lock, st);
    thread
        .wait
        .result
        .replace(&mut *lock, Err(WaitTimeoutError::Timeout));
    thread.wait.blocked_on.replace(&mut *lock, object);

    if let Some(object) = object {
        insert_by_priority(lock.borrow_mut(), object.queue(), thread);
    }

    if let Some(at) = at {
        thread.timeout.at.replace(&mut *lock, at);
        timeout::insert(lock.borrow_mut(), TimeoutRef::Thread(thread));
    }
}

/// Block the running thread, which has been prepared by [`prepare_wait`],
/// until the wait completes, and return its result.
pub(crate) fn finish_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) -> Result<u32, WaitTimeoutError> {
    thread::wait_until_woken_up(lock.borrow_mut(), thread);
    *thread.wait.result.read(&*lock)
}

/// [`prepare_wait`] followed by [`finish_wait`].
pub(crate) fn wait_on<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    object: Option<WaitObject<Traits>>,
    st: ThreadState,
    at: Option<u64>,
) -> Result<u32, WaitTimeoutError> {
    prepare_wait(lock.borrow_mut(), thread, object, st, at);
    finish_wait(lock, thread)
}

/// Unlink a waiting thread from its pend queue and the timer queue. The
/// thread's state is left unchanged.
pub(crate) fn cancel_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    if let Some(object) = thread.wait.blocked_on.replace(&mut *lock, None) {
        // Safety: A thread blocked on `object` is linked to its pend queue
        unsafe {
            sched_list_accessor!(object.queue(), lock.borrow_mut())
                .remove(Ident(thread))
                .unwrap_unchecked()
        };

        if let WaitObject::Mutex(mutex) = object {
            // The owner might have been inheriting the priority of `thread`
            if let Some(owner) = *mutex.owner.read(&*lock) {
                mutex::update_priority_chain(lock.borrow_mut(), owner);
            }
        }
    }

    timeout::remove(lock, TimeoutRef::Thread(thread));
}

/// Complete the wait of `thread` with `result`, making it runnable.
pub(crate) fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    result: Result<u32, WaitTimeoutError>,
) {
    debug_assert!(thread.st.read(&*lock).is_waiting());

    cancel_wait(lock.borrow_mut(), thread);
    thread.wait.result.replace(&mut *lock, result);
    thread::make_runnable(lock, thread);
}

/// Called by the timer queue when the deadline of a waiting thread passes.
pub(crate) fn handle_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let result = match *thread.st.read(&*lock) {
        // A delay ending is not a timeout
        ThreadState::WaitForTick => Ok(0),
        st => {
            debug_assert!(st.is_waiting());
            Err(WaitTimeoutError::Timeout)
        }
    };
    complete_wait(lock.borrow_mut(), thread, result);
}

/// Move a waiting thread, whose effective priority has just changed, to the
/// right position in its pend queue.
pub(crate) fn reposition_waiter<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let Some(object) = *thread.wait.blocked_on.read(&*lock) else {
        return;
    };

    // Safety: A thread blocked on `object` is linked to its pend queue
    unsafe {
        sched_list_accessor!(object.queue(), lock.borrow_mut())
            .remove(Ident(thread))
            .unwrap_unchecked()
    };
    insert_by_priority(lock, object.queue(), thread);
}

/// Complete the waits of all threads in `queue` with `Ok(value)`.
pub(crate) fn wake_all<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &'static CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,
    value: u32,
) {
    while let Some(waiter) = front_waiter(lock.borrow_mut(), queue) {
        complete_wait(lock.borrow_mut(), waiter, Ok(value));
    }
}
