//! Kernel state
use core::{
    fmt,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use crate::{
    error::BadContextError,
    klock::{self, CpuLockCell, CpuLockTokenRefMut, IrqLockCell},
    semaphore::SemCore,
    thread::ThreadCb,
    timeout::TimeoutGlobals,
    utils::{
        intrusive_list::{ListHead, StaticListHead},
        PrioBitmap, PRIO_BITMAP_MAX_LEN,
    },
    KernelTraits, PortThreading,
};

/// Global kernel state. One instance is created by [`build!`] for each system
/// type.
///
/// [`build!`]: crate::build
pub struct State<Traits: PortThreading> {
    /// The currently running thread. Written by the scheduler with CPU Lock
    /// active. A port's dispatcher reads it through
    /// [`Self::running_thread_ptr`].
    running_thread: AtomicPtr<ThreadCb<Traits>>,

    /// Set when the boot phase completes. Dispatch requests issued before
    /// that are ignored.
    pub(crate) started: AtomicBool,

    /// Run queues, one for each priority level. The running thread stays at
    /// the front of its queue.
    pub(crate) run_queues:
        [CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>; PRIO_BITMAP_MAX_LEN],

    /// Bit `i` is set iff `run_queues[i]` is non-empty.
    pub(crate) ready_bitmap: CpuLockCell<Traits, PrioBitmap>,

    /// Set when the running thread should yield to the next thread of the
    /// same priority at the next scheduling decision (a tick elapsed, or the
    /// thread called `yield_now`).
    pub(crate) time_slice_pending: CpuLockCell<Traits, bool>,

    pub(crate) timeout: TimeoutGlobals<Traits>,

    /// Semaphores that received a post which couldn't be delivered to
    /// waiters directly (because it was made from an interrupt context or
    /// while CPU Lock was active). Drained by the scheduler.
    pub(crate) handoff: IrqLockCell<Traits, StaticListHead<SemCore<Traits>>>,
}

impl<Traits: PortThreading> State<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            running_thread: AtomicPtr::new(ptr::null_mut()),
            started: AtomicBool::new(false),
            run_queues: [const { CpuLockCell::new(ListHead::new()) }; PRIO_BITMAP_MAX_LEN],
            ready_bitmap: CpuLockCell::new(PrioBitmap::new()),
            time_slice_pending: CpuLockCell::new(false),
            timeout: TimeoutGlobals::new(),
            handoff: IrqLockCell::new(ListHead::new()),
        }
    }

    /// Get the currently running thread, or `None` if the processor is idle.
    #[inline]
    pub fn running_thread(&self) -> Option<&'static ThreadCb<Traits>> {
        // Safety: `running_thread` only ever holds null or a pointer derived
        //         from `&'static ThreadCb`
        unsafe { self.running_thread.load(Ordering::Relaxed).as_ref() }
    }

    /// Get a raw pointer to the variable storing the currently running
    /// thread, for the use by a port's dispatcher written in assembly. The
    /// variable holds a `*const ThreadCb<Traits>` (null when idle).
    #[inline]
    pub fn running_thread_ptr(&self) -> *mut *mut ThreadCb<Traits> {
        self.running_thread.as_ptr()
    }

    pub(crate) fn set_running_thread(
        &self,
        _lock: CpuLockTokenRefMut<'_, Traits>,
        thread: Option<&'static ThreadCb<Traits>>,
    ) {
        let ptr = thread.map_or(ptr::null_mut(), |t| t as *const _ as *mut _);
        self.running_thread.store(ptr, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("running_thread", &self.running_thread())
            .field("started", &self.is_started())
            .field("ready_bitmap", &self.ready_bitmap)
            .field("time_slice_pending", &self.time_slice_pending)
            .finish_non_exhaustive()
    }
}

/// Implements [`PortToKernel::boot`].
///
/// [`PortToKernel::boot`]: crate::PortToKernel::boot
pub(crate) fn boot<Traits: KernelTraits>() -> ! {
    log::trace!("boot: running the startup hook");
    Traits::startup_hook();

    // Safety: CPU Lock inactive (the precondition of `boot`)
    unsafe { Traits::enter_cpu_lock() };
    // Safety: We just entered CPU Lock
    let lock = unsafe { klock::assume_cpu_lock::<Traits>() };

    Traits::state().started.store(true, Ordering::Relaxed);
    log::trace!("boot: dispatching the first thread");

    // `dispatch_first_thread` takes over the CPU Lock state
    core::mem::forget(lock);

    // Safety: CPU Lock active, a boot context
    unsafe { Traits::dispatch_first_thread() }
}

/// If the current context is not a thread context, return `BadContext`.
/// Otherwise, return the running thread.
#[inline]
pub(crate) fn expect_waitable_context<Traits: KernelTraits>(
) -> Result<&'static ThreadCb<Traits>, BadContextError> {
    if !Traits::is_thread_context() {
        return Err(BadContextError::BadContext);
    }
    Traits::state()
        .running_thread()
        .ok_or(BadContextError::BadContext)
}

/// Ask the port to run the dispatcher. Ignored during the boot phase.
///
/// Precondition: CPU Lock inactive, or an interrupt context
#[inline]
pub(crate) fn request_dispatch<Traits: KernelTraits>() {
    debug_assert!(!Traits::is_cpu_lock_active() || Traits::is_interrupt_context());
    if Traits::state().is_started() {
        // Safety: CPU Lock inactive, or an interrupt context
        unsafe { Traits::yield_cpu() };
    }
}
