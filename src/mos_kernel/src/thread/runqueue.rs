//! Run queues
//!
//! There's one FIFO queue for each priority level, and a bitmap of the
//! non-empty levels. Runnable threads (including the running one, which stays
//! at the front of its queue) are linked through `ThreadCb::sched_link`.
use super::{sched_list_accessor, ThreadCb};
use crate::{klock::CpuLockTokenRefMut, utils::intrusive_list::Ident, KernelTraits};

/// Insert `thread` at the back of the queue for its effective priority.
/// `thread` must not be linked to any queue.
pub(super) fn push_back<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let state = Traits::state();
    let pri = usize::from(*thread.pri.read(&*lock));

    // Safety: `thread` is unlinked, so it shouldn't return
    //         `InsertError::AlreadyLinked`.
    unsafe {
        sched_list_accessor!(&state.run_queues[pri], lock.borrow_mut())
            .push_back(Ident(thread))
            .unwrap_unchecked();
    }

    state.ready_bitmap.write(&mut *lock).set(pri);
}

/// Remove `thread` from its run queue. Does nothing if it isn't in any.
pub(super) fn remove<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let state = Traits::state();
    let pri = usize::from(*thread.pri.read(&*lock));

    let now_empty = {
        let mut accessor = sched_list_accessor!(&state.run_queues[pri], lock.borrow_mut());
        if !accessor.is_linked(Ident(thread)) {
            return;
        }
        // Safety: `thread` is linked to this list (a Runnable thread is always
        //         in the queue for its current effective priority)
        unsafe { accessor.remove(Ident(thread)).unwrap_unchecked() };
        accessor.is_empty()
    };

    if now_empty {
        state.ready_bitmap.write(&mut *lock).clear(pri);
    }
}

/// Get the thread at the front of the most urgent non-empty queue.
///
/// If `rotate` is set and that thread is `prev` with another thread behind
/// it, `prev` is moved to the back of the queue first (round-robin).
pub(super) fn choose<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    prev: Option<&'static ThreadCb<Traits>>,
    rotate: bool,
) -> Option<&'static ThreadCb<Traits>> {
    let state = Traits::state();
    let pri = state.ready_bitmap.read(&*lock).find_set()?;

    let mut accessor = sched_list_accessor!(&state.run_queues[pri], lock.borrow_mut());
    // There must be at least one element, because the bitmap indicated so
    let front = accessor.front()?;

    if rotate && prev.is_some_and(|prev| Ident(prev) == front) {
        if let Ok(Some(_)) = accessor.next(front) {
            // Safety: `front` is linked to this list
            unsafe { accessor.move_to_back(front).unwrap_unchecked() };
        }
    }

    accessor.front().map(|x| x.0)
}

/// Return `true` if the queue for `pri` holds more than one thread.
pub(super) fn is_contended<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    pri: usize,
) -> bool {
    let accessor = sched_list_accessor!(&Traits::state().run_queues[pri], lock);
    accessor
        .front()
        .is_some_and(|front| matches!(accessor.next(front), Ok(Some(_))))
}
