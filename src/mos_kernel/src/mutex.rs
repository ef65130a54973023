//! Mutexes
//!
//! Mutexes are recursive and implement the priority inheritance protocol. The
//! effective priority of a thread is the most urgent of its nominal priority
//! and the priorities of the first waiters of the mutexes it holds. It's
//! recomputed whenever one of these changes, and the change is propagated
//! along the chain of owners (a boosted owner may itself be blocked on another
//! mutex).
use core::{fmt, ptr};

use crate::{
    error::{
        expect_not_timeout, QueryMutexError, TryLockMutexError, UnlockMutexError, WaitError,
        WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state::expect_waitable_context,
    thread::{self, ptr_from_option_ref, ThreadCb, ThreadId, ThreadState},
    timeout,
    utils::intrusive_list::{
        Ident, ListAccessorCell, ListHead, Static, StaticLink, StaticListHead,
    },
    wait::{self, WaitObject},
    KernelTraits, PortThreading, Priority,
};

/// Get a `ListAccessorCell` used to access the list of the mutexes held by a
/// thread.
macro_rules! held_list_accessor {
    ($head:expr, $key:expr) => {{
        let accessor = ListAccessorCell::new($head, &Static, |mutex| &mutex.held_link, $key);

        // Safety: This linked list is structurally sound.
        #[allow(unused_unsafe)]
        unsafe {
            accessor.unchecked()
        }
    }};
}

/// A recursive mutex with priority inheritance.
///
/// ```rust,ignore
/// static M: Mutex<SystemTraits> = Mutex::new();
///
/// M.lock().unwrap();
/// M.lock().unwrap(); // recursion
/// assert_eq!(M.depth(), Ok(2));
/// M.unlock().unwrap();
/// M.unlock().unwrap();
/// ```
pub struct Mutex<Traits: PortThreading> {
    pub(crate) owner: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// The recursion depth. Zero iff `owner` is `None`.
    depth: CpuLockCell<Traits, u32>,

    /// The pend queue.
    pub(crate) waiters: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,

    /// The link in `ThreadCb::held_mutexes` of the owner.
    held_link: CpuLockCell<Traits, Option<StaticLink<Mutex<Traits>>>>,
}

impl<Traits: PortThreading> Mutex<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            owner: CpuLockCell::new(None),
            depth: CpuLockCell::new(0),
            waiters: CpuLockCell::new(ListHead::new()),
            held_link: CpuLockCell::new(None),
        }
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Acquire the mutex, blocking until it's available. If the calling
    /// thread already owns it, the recursion depth is incremented.
    pub fn lock(&'static self) -> Result<(), WaitError> {
        self.lock_core(None).map_err(expect_not_timeout)
    }

    /// [`lock`](Self::lock) with a timeout measured in ticks.
    pub fn lock_or_timeout(&'static self, ticks: u32) -> Result<(), WaitTimeoutError> {
        self.lock_core(Some(ticks))
    }

    /// Acquire the mutex if it's available or already owned by the calling
    /// thread.
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = expect_waitable_context::<Traits>()?;
        if self.poll(lock.borrow_mut(), thread) {
            Ok(())
        } else {
            Err(TryLockMutexError::WouldBlock)
        }
    }

    /// Release one level of recursion. When the depth reaches zero, the
    /// ownership passes to the most urgent waiter.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread doesn't own the mutex.
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = expect_waitable_context::<Traits>()?;

        let owner = ptr_from_option_ref(*self.owner.read(&*lock));
        kassert!(
            owner == thread as *const _,
            "unlocking a mutex not owned by the caller (owner = {:?})",
            owner
        );

        self.unlock_one_level(lock.borrow_mut());
        thread::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Like [`unlock`](Self::unlock), but does nothing if the calling thread
    /// doesn't own the mutex. Meant for stop handlers, which can't tell if the
    /// thread they replace was in the middle of a critical section.
    pub fn restore(&'static self) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = expect_waitable_context::<Traits>()?;

        if ptr_from_option_ref(*self.owner.read(&*lock)) != thread as *const _ {
            return Ok(());
        }

        self.unlock_one_level(lock.borrow_mut());
        thread::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Return `true` if the calling thread owns the mutex.
    pub fn is_owner(&'static self) -> Result<bool, QueryMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let thread = expect_waitable_context::<Traits>()?;
        Ok(ptr_from_option_ref(*self.owner.read(&*lock)) == thread as *const _)
    }

    /// Get the owning thread.
    pub fn owner(&'static self) -> Result<Option<ThreadId>, QueryMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.owner.read(&*lock).map(thread::thread_id::<Traits>))
    }

    /// Get the recursion depth. `0` means the mutex is free.
    pub fn depth(&'static self) -> Result<u32, QueryMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(*self.depth.read(&*lock))
    }

    fn lock_core(&'static self, ticks: Option<u32>) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = expect_waitable_context::<Traits>()?;

        if self.poll(lock.borrow_mut(), thread) {
            return Ok(());
        }

        let (st, at) = match ticks {
            Some(0) => return Err(WaitTimeoutError::Timeout),
            Some(ticks) => (
                ThreadState::WaitForMutexOrTick,
                Some(timeout::now(lock.borrow_mut()) + u64::from(ticks)),
            ),
            None => (ThreadState::WaitForMutex, None),
        };

        wait::prepare_wait(
            lock.borrow_mut(),
            thread,
            Some(WaitObject::Mutex(self)),
            st,
            at,
        );

        // The owner inherits our priority
        if let Some(owner) = *self.owner.read(&*lock) {
            update_priority_chain(lock.borrow_mut(), owner);
        }

        // The releaser transfers the ownership to us before waking us up
        wait::finish_wait(lock.borrow_mut(), thread).map(drop)
    }

    /// Acquire the mutex if it's free or already owned by `thread`.
    fn poll(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) -> bool {
        let owner = *self.owner.read(&*lock);
        match owner {
            None => {
                self.give_to(lock, thread);
                true
            }
            Some(owner) if ptr::eq(owner, thread) => {
                let depth = self.depth.write(&mut *lock);
                kassert!(*depth < u32::MAX, "mutex recursion depth overflow");
                *depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Make `thread` the owner with depth 1. The mutex must be free.
    fn give_to(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        debug_assert!(self.owner.read(&*lock).is_none());

        self.owner.replace(&mut *lock, Some(thread));
        self.depth.replace(&mut *lock, 1);

        // Safety: A free mutex is in nobody's held list
        unsafe {
            held_list_accessor!(&thread.held_mutexes, lock.borrow_mut())
                .push_back(Ident(self))
                .unwrap_unchecked()
        };
    }

    fn unlock_one_level(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let depth = self.depth.write(&mut *lock);
        *depth -= 1;
        if *depth == 0 {
            self.release(lock);
        }
    }

    /// Release the mutex, handing it over to the first waiter if any. Restores
    /// the effective priority of the previous owner.
    fn release(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let Some(prev_owner) = self.owner.replace(&mut *lock, None) else {
            return;
        };
        self.depth.replace(&mut *lock, 0);

        // Safety: The owner's held list includes `self`
        unsafe {
            held_list_accessor!(&prev_owner.held_mutexes, lock.borrow_mut())
                .remove(Ident(self))
                .unwrap_unchecked()
        };

        if let Some(next) = wait::front_waiter(lock.borrow_mut(), &self.waiters) {
            self.give_to(lock.borrow_mut(), next);

            // Unlinking `next` from `waiters` recomputes its effective
            // priority with the remaining waiters
            wait::complete_wait(lock.borrow_mut(), next, Ok(0));
        }

        // The previous owner doesn't inherit from the waiters anymore
        update_priority_chain(lock, prev_owner);
    }
}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field(
                "owner",
                &self
                    .owner
                    .debug_fmt_with_ref(|x, f| fmt::Debug::fmt(&ptr_from_option_ref(*x), f)),
            )
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// Calculate the effective priority of `thread` from its nominal priority and
/// the waiters of the mutexes it holds.
pub(crate) fn effective_priority<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) -> Priority {
    let nom_pri = *thread.nom_pri.read(&*lock);
    let accessor = held_list_accessor!(&thread.held_mutexes, lock);
    let key = &**accessor.cell_key();

    accessor
        .iter()
        .filter_map(|x| {
            let Ok((_, mutex)) = x;
            // Pend queues are sorted, so the first waiter is the most urgent
            let first = mutex.waiters.read(key).first?;
            Some(*first.0.pri.read(key))
        })
        .fold(nom_pri, Priority::min)
}

/// Recompute the effective priority of `thread`, and if it has changed,
/// propagate the change to the owner of the mutex `thread` is blocked on, and
/// so on.
pub(crate) fn update_priority_chain<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mut thread: &'static ThreadCb<Traits>,
) {
    loop {
        let pri = effective_priority(lock.borrow_mut(), thread);
        if pri == *thread.pri.read(&*lock) {
            return;
        }

        thread::set_effective_priority(lock.borrow_mut(), thread, pri);

        // `thread`'s position in the pend queue has changed, which may change
        // the first waiter
        match *thread.wait.blocked_on.read(&*lock) {
            Some(WaitObject::Mutex(mutex)) => match *mutex.owner.read(&*lock) {
                Some(owner) => thread = owner,
                None => return,
            },
            _ => return,
        }
    }
}

/// Release all mutexes held by `thread`, which is exiting.
pub(crate) fn release_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    loop {
        let front = held_list_accessor!(&thread.held_mutexes, lock.borrow_mut()).front();
        let Some(Ident(mutex)) = front else {
            break;
        };

        log::warn!(
            "thread {:?} exited while holding a mutex {:p} (depth = {})",
            thread::thread_id::<Traits>(thread),
            mutex,
            mutex.depth.read(&*lock)
        );
        mutex.release(lock.borrow_mut());
    }
}
