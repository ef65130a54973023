//! Threads
use core::{
    cell::UnsafeCell,
    convert::Infallible,
    fmt,
    mem::MaybeUninit,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use crate::{
    error::{
        BadContextError, BadIdError, BadObjectStateError, InitThreadError, KillThreadError,
        QueryThreadError, RunThreadError, SetPriorityError, WaitError, WaitThreadError,
        WaitThreadTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex::{self, Mutex},
    semaphore,
    state::{expect_waitable_context, request_dispatch},
    timeout::{self, Timeout},
    utils::intrusive_list::{ListHead, StaticLink, StaticListHead},
    wait::{self, ThreadWait, WaitObject},
    KernelTraits, PortThreading, Priority, System,
};

/// Get a [`ListAccessorCell`] for a list of threads linked through
/// `sched_link` (a run queue or a pend queue).
///
/// [`ListAccessorCell`]: crate::utils::intrusive_list::ListAccessorCell
macro_rules! sched_list_accessor {
    ($head:expr, $key:expr) => {{
        let accessor = $crate::utils::intrusive_list::ListAccessorCell::new(
            $head,
            &$crate::utils::intrusive_list::Static,
            |thread_cb| &thread_cb.sched_link,
            $key,
        );

        // Safety: This linked list is structurally sound.
        #[allow(unused_unsafe)]
        unsafe {
            accessor.unchecked()
        }
    }};
}
pub(crate) use sched_list_accessor;

mod runqueue;

/// The value a killed thread returns when it has no stop handler.
pub const STOP_KILLED: i32 = i32::MIN;

/// The value a thread stopped by a fault returns when it has no stop handler.
pub const STOP_FAULT: i32 = i32::MIN + 1;

/// Identifies a thread. This is an index into the thread arena created by
/// [`build!`](crate::build).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

/// Thread state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// The thread has never been initialized.
    Uninit,
    /// The thread has been initialized but not started yet.
    Init,
    /// The thread is running or ready to run.
    Runnable,
    /// The thread is in a timed delay.
    WaitForTick,
    WaitForMutex,
    WaitForMutexOrTick,
    /// The thread is waiting on a semaphore or a signal.
    WaitForSem,
    WaitForSemOrTick,
    /// The thread is waiting for another thread to stop.
    WaitForStop,
    WaitForStopOrTick,
    /// The thread has been killed or has faulted, and is about to be restarted
    /// with its stop handler at the next scheduling decision.
    TimeToStop,
    /// The thread's start routine has returned.
    Stopped,
}

impl ThreadState {
    /// Return `true` if the thread is blocked.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Self::WaitForTick
                | Self::WaitForMutex
                | Self::WaitForMutexOrTick
                | Self::WaitForSem
                | Self::WaitForSemOrTick
                | Self::WaitForStop
                | Self::WaitForStopOrTick
        )
    }
}

/// Why a thread was stopped from outside its own control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`System::kill_thread`] was called.
    Killed,
    /// The thread caused an unrecoverable fault.
    Fault,
}

/// A function run by a thread, along with its parameter.
#[derive(Clone, Copy)]
pub(crate) struct EntryPoint {
    pub(crate) func: fn(usize) -> i32,
    pub(crate) arg: usize,
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoint")
            .field("func", &(self.func as *const ()))
            .field("arg", &self.arg)
            .finish()
    }
}

fn never_started(_: usize) -> i32 {
    0
}

/// A memory region used as a thread's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    ptr: *mut u8,
    len: usize,
}

// Safety: `StackRegion` is merely a description of a memory region. The
//         kernel hands it to exactly one thread at a time.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    const EMPTY: Self = Self {
        ptr: ptr::null_mut(),
        len: 0,
    };

    /// Construct a `StackRegion` from a raw memory region.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes for `'static`, suitably
    /// aligned for the port, and not used by anything else while any thread
    /// is initialized with it.
    pub const unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Get the lowest address of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Statically-allocated stack storage. Each instance can be handed out once.
///
/// ```rust
/// use mos_kernel::ThreadStack;
/// static STACK: ThreadStack<1024> = ThreadStack::new();
///
/// let region = STACK.take().unwrap();
/// assert_eq!(region.len(), 1024);
/// assert!(STACK.take().is_none());
/// ```
#[repr(C, align(8))]
pub struct ThreadStack<const LEN: usize> {
    buf: UnsafeCell<[MaybeUninit<u8>; LEN]>,
    taken: AtomicBool,
}

// Safety: `buf` is only accessed through the `StackRegion` obtained from
//         `take`, which can succeed only once
unsafe impl<const LEN: usize> Sync for ThreadStack<LEN> {}

impl<const LEN: usize> ThreadStack<LEN> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([MaybeUninit::uninit(); LEN]),
            taken: AtomicBool::new(false),
        }
    }

    /// Get the memory region. Returns `None` if it has already been taken.
    pub fn take(&'static self) -> Option<StackRegion> {
        if self.taken.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(StackRegion {
                ptr: self.buf.get().cast(),
                len: LEN,
            })
        }
    }
}

/// The parameters of [`System::init_thread`].
#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr {
    /// The entry function. Its return value becomes the thread's exit value.
    pub entry: fn(usize) -> i32,
    /// The parameter passed to `entry`.
    pub arg: usize,
    /// The nominal priority.
    pub priority: Priority,
    pub stack: StackRegion,
    /// The name (for diagnostics).
    pub name: &'static str,
}

impl ThreadAttr {
    pub const fn new(entry: fn(usize) -> i32, arg: usize, priority: Priority, stack: StackRegion) -> Self {
        Self {
            entry,
            arg,
            priority,
            stack,
            name: "",
        }
    }

    pub const fn with_name(self, name: &'static str) -> Self {
        Self { name, ..self }
    }
}

/// Thread control block - the state data of a thread.
#[repr(C)]
pub struct ThreadCb<Traits: PortThreading> {
    /// Get a reference to `Traits::PortThreadState` in the thread control
    /// block.
    ///
    /// This is only meant to be used by a port. It's located at offset zero so
    /// that a context switch routine written in assembly can find it.
    pub port_thread_state: Traits::PortThreadState,

    stack_ptr: AtomicPtr<u8>,
    stack_len: AtomicUsize,

    pub(crate) name: CpuLockCell<Traits, &'static str>,

    /// The entry point given by `init_thread`.
    pub(crate) entry: CpuLockCell<Traits, EntryPoint>,

    pub(crate) stop_handler: CpuLockCell<Traits, Option<EntryPoint>>,

    /// What `thread_main` runs when the thread is dispatched after
    /// `initialize_thread_state`. Either `entry` or the stop handler.
    pub(crate) start: CpuLockCell<Traits, EntryPoint>,

    pub(crate) st: CpuLockCell<Traits, ThreadState>,

    /// The effective priority. Lower than `nom_pri` while the thread is
    /// inheriting a priority from the waiters of a mutex it holds.
    pub(crate) pri: CpuLockCell<Traits, Priority>,

    /// The nominal priority.
    pub(crate) nom_pri: CpuLockCell<Traits, Priority>,

    pub(crate) wait: ThreadWait<Traits>,

    /// The entry in the timer queue for timed waits.
    pub(crate) timeout: Timeout<Traits>,

    /// The link in a run queue or in a pend queue. A thread is linked into at
    /// most one of them.
    pub(crate) sched_link: CpuLockCell<Traits, Option<StaticLink<ThreadCb<Traits>>>>,

    /// Threads waiting for this thread to stop.
    pub(crate) stop_waiters: CpuLockCell<Traits, StaticListHead<ThreadCb<Traits>>>,

    /// The mutexes held by this thread.
    pub(crate) held_mutexes: CpuLockCell<Traits, StaticListHead<Mutex<Traits>>>,

    pub(crate) exit_value: CpuLockCell<Traits, i32>,

    pub(crate) stop_reason: CpuLockCell<Traits, Option<StopReason>>,
}

impl<Traits: PortThreading> ThreadCb<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        const NEVER_STARTED: EntryPoint = EntryPoint {
            func: never_started,
            arg: 0,
        };
        Self {
            port_thread_state: Traits::PORT_THREAD_STATE_INIT,
            stack_ptr: AtomicPtr::new(ptr::null_mut()),
            stack_len: AtomicUsize::new(0),
            name: CpuLockCell::new(""),
            entry: CpuLockCell::new(NEVER_STARTED),
            stop_handler: CpuLockCell::new(None),
            start: CpuLockCell::new(NEVER_STARTED),
            st: CpuLockCell::new(ThreadState::Uninit),
            pri: CpuLockCell::new(0),
            nom_pri: CpuLockCell::new(0),
            wait: ThreadWait::new(),
            timeout: Timeout::new(),
            sched_link: CpuLockCell::new(None),
            stop_waiters: CpuLockCell::new(ListHead::new()),
            held_mutexes: CpuLockCell::new(ListHead::new()),
            exit_value: CpuLockCell::new(0),
            stop_reason: CpuLockCell::new(None),
        }
    }

    /// Get the stack region given by the last `init_thread`.
    ///
    /// This is only meant to be used by a port.
    #[inline]
    pub fn stack(&self) -> StackRegion {
        StackRegion {
            ptr: self.stack_ptr.load(Ordering::Relaxed),
            len: self.stack_len.load(Ordering::Relaxed),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("port_thread_state", &self.port_thread_state)
            .field("st", &self.st)
            .field("pri", &self.pri)
            .field("nom_pri", &self.nom_pri)
            .finish_non_exhaustive()
    }
}

/// Get the `ThreadCb` for the specified ID.
#[inline]
pub(crate) fn thread_cb<Traits: KernelTraits>(
    id: ThreadId,
) -> Result<&'static ThreadCb<Traits>, BadIdError> {
    Traits::thread_cb_pool()
        .get(id.0)
        .ok_or(BadIdError::BadId)
}

/// Get the ID of the specified `ThreadCb`, which must be an element of
/// `Traits::thread_cb_pool()`.
pub(crate) fn thread_id<Traits: KernelTraits>(thread: &ThreadCb<Traits>) -> ThreadId {
    let pool = Traits::thread_cb_pool();
    let offset = thread as *const ThreadCb<Traits> as usize - pool.as_ptr() as usize;
    ThreadId(offset / core::mem::size_of::<ThreadCb<Traits>>())
}

const STACK_PAINT: u8 = 0xcd;

impl<Traits: KernelTraits> System<Traits> {
    /// Initialize a thread. The thread must be in the `Uninit`, `Init`, or
    /// `Stopped` state. It transitions to `Init`, and starts running `entry`
    /// when [`run_thread`](Self::run_thread) is called.
    ///
    /// Any previously registered stop handler is cleared.
    pub fn init_thread(id: ThreadId, attr: ThreadAttr) -> Result<(), InitThreadError> {
        if usize::from(attr.priority) >= Traits::NUM_PRIORITIES || attr.stack.is_empty() {
            return Err(InitThreadError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = thread_cb::<Traits>(id)?;

        if !matches!(
            *thread.st.read(&*lock),
            ThreadState::Uninit | ThreadState::Init | ThreadState::Stopped
        ) {
            return Err(InitThreadError::BadObjectState);
        }

        let entry = EntryPoint {
            func: attr.entry,
            arg: attr.arg,
        };
        thread.entry.replace(&mut *lock, entry);
        thread.start.replace(&mut *lock, entry);
        thread.stop_handler.replace(&mut *lock, None);
        thread.name.replace(&mut *lock, attr.name);
        thread.pri.replace(&mut *lock, attr.priority);
        thread.nom_pri.replace(&mut *lock, attr.priority);
        thread.exit_value.replace(&mut *lock, 0);
        thread.stop_reason.replace(&mut *lock, None);
        thread.stack_ptr.store(attr.stack.ptr, Ordering::Relaxed);
        thread.stack_len.store(attr.stack.len, Ordering::Relaxed);

        if Traits::STACK_USAGE {
            // Safety: The thread isn't running, so nothing else is using the
            //         region
            unsafe { ptr::write_bytes(attr.stack.ptr, STACK_PAINT, attr.stack.len) };
        }

        // Safety: CPU Lock active, the thread is not running
        unsafe { Traits::initialize_thread_state(thread) };

        thread.st.replace(&mut *lock, ThreadState::Init);

        log::trace!("thread {id:?} ({:?}) initialized", attr.name);

        Ok(())
    }

    /// Start a thread in the `Init` state.
    pub fn run_thread(id: ThreadId) -> Result<(), RunThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = thread_cb::<Traits>(id)?;

        if *thread.st.read(&*lock) != ThreadState::Init {
            return Err(RunThreadError::BadObjectState);
        }

        log::trace!("thread {id:?} started");
        make_runnable(lock.borrow_mut(), thread);

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Register the function run in place of a thread when the thread is
    /// killed or faults. `None` restores the default handler, which returns
    /// [`STOP_KILLED`] or [`STOP_FAULT`].
    pub fn set_stop_handler(
        id: ThreadId,
        handler: Option<fn(usize) -> i32>,
        arg: usize,
    ) -> Result<(), QueryThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = thread_cb::<Traits>(id)?;
        thread
            .stop_handler
            .replace(&mut *lock, handler.map(|func| EntryPoint { func, arg }));
        Ok(())
    }

    /// Stop a thread by restarting it with its stop handler, which runs at
    /// the thread's nominal priority (raised by any priority it inherits from
    /// the mutexes it still holds).
    ///
    /// If the target is the calling thread, this function doesn't return.
    pub fn kill_thread(id: ThreadId) -> Result<(), KillThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = thread_cb::<Traits>(id)?;

        let st = *thread.st.read(&*lock);
        if matches!(
            st,
            ThreadState::Uninit | ThreadState::Init | ThreadState::Stopped | ThreadState::TimeToStop
        ) {
            return Err(BadObjectStateError::BadObjectState.into());
        }

        thread.stop_reason.replace(&mut *lock, Some(StopReason::Killed));

        let running_thread = Traits::state().running_thread();
        if ptr_from_option_ref(running_thread) == thread as *const _ {
            // The thread's context is live. Let the dispatcher restart it
            // after saving the context.
            log::trace!("thread {id:?} is being killed while running");
            stop_running_thread(lock.borrow_mut(), thread);
            drop(lock);
            request_dispatch::<Traits>();
            return Ok(());
        }

        log::trace!("killing thread {id:?} ({st:?})");
        if st.is_waiting() {
            wait::cancel_wait(lock.borrow_mut(), thread);
        } else {
            runqueue::remove(lock.borrow_mut(), thread);
        }

        restart_for_stop(lock.borrow_mut(), thread);
        runqueue::push_back(lock.borrow_mut(), thread);

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Terminate the calling thread with the specified exit value. Mutexes it
    /// holds are released.
    ///
    /// # Safety
    ///
    /// The thread's stack is discarded without running destructors. This can
    /// violate the pinning guarantee of objects on it.
    pub unsafe fn exit_thread(exit_value: i32) -> Result<Infallible, WaitError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let thread = expect_waitable_context::<Traits>()?;
        exit_current_thread(lock, thread, exit_value)
    }

    /// Wait until a thread stops, and get its exit value. Returns immediately
    /// if it has already stopped.
    pub fn wait_for_thread_stop(id: ThreadId) -> Result<i32, WaitThreadError> {
        wait_for_stop_core::<Traits>(id, None).map_err(|e| match e {
            WaitThreadTimeoutError::BadContext => WaitThreadError::BadContext,
            WaitThreadTimeoutError::BadId => WaitThreadError::BadId,
            WaitThreadTimeoutError::BadObjectState => WaitThreadError::BadObjectState,
            WaitThreadTimeoutError::Timeout => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        })
    }

    /// [`wait_for_thread_stop`](Self::wait_for_thread_stop) with a timeout
    /// measured in ticks.
    pub fn wait_for_thread_stop_or_timeout(
        id: ThreadId,
        ticks: u32,
    ) -> Result<i32, WaitThreadTimeoutError> {
        wait_for_stop_core::<Traits>(id, Some(ticks))
    }

    /// Yield the processor to the next runnable thread of the same priority,
    /// if any.
    pub fn yield_now() -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        expect_waitable_context::<Traits>()?;
        Traits::state()
            .time_slice_pending
            .replace(&mut *lock, true);
        drop(lock);
        request_dispatch::<Traits>();
        Ok(())
    }

    /// Block the calling thread for the specified number of ticks. `delay(0)`
    /// is equivalent to [`yield_now`](Self::yield_now).
    pub fn delay(ticks: u32) -> Result<(), WaitError> {
        if ticks == 0 {
            return Self::yield_now();
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = expect_waitable_context::<Traits>()?;
        let at = timeout::now(lock.borrow_mut()) + u64::from(ticks);

        wait::wait_on(
            lock.borrow_mut(),
            thread,
            None,
            ThreadState::WaitForTick,
            Some(at),
        )
        .map(drop)
        .map_err(crate::error::expect_not_timeout)
    }

    /// Get the currently running thread. In an interrupt context, this is the
    /// interrupted thread.
    pub fn current_thread() -> Option<ThreadId> {
        Traits::state().running_thread().map(thread_id::<Traits>)
    }

    pub fn thread_state(id: ThreadId) -> Result<ThreadState, QueryThreadError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let thread = thread_cb::<Traits>(id)?;
        Ok(*thread.st.read(&*lock))
    }

    /// Get the effective and nominal priorities of a thread.
    pub fn thread_priority(id: ThreadId) -> Result<(Priority, Priority), QueryThreadError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let thread = thread_cb::<Traits>(id)?;
        Ok((*thread.pri.read(&*lock), *thread.nom_pri.read(&*lock)))
    }

    /// Change the nominal priority of a thread. The effective priority is
    /// recomputed, taking priority inheritance into account.
    pub fn set_thread_priority(id: ThreadId, priority: Priority) -> Result<(), SetPriorityError> {
        if usize::from(priority) >= Traits::NUM_PRIORITIES {
            return Err(SetPriorityError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = thread_cb::<Traits>(id)?;

        match *thread.st.read(&*lock) {
            ThreadState::Uninit => return Err(SetPriorityError::BadObjectState),
            ThreadState::Init | ThreadState::Stopped => {
                thread.nom_pri.replace(&mut *lock, priority);
                thread.pri.replace(&mut *lock, priority);
            }
            _ => {
                thread.nom_pri.replace(&mut *lock, priority);
                mutex::update_priority_chain(lock.borrow_mut(), thread);
            }
        }

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the reason the calling thread is running its stop handler, or
    /// `None` if it's running its entry function.
    pub fn current_stop_reason() -> Result<Option<StopReason>, QueryThreadError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let thread = expect_waitable_context::<Traits>()?;
        Ok(*thread.stop_reason.read(&*lock))
    }

    /// Get the maximum number of bytes the thread has used of its stack. Returns
    /// `None` unless stack usage instrumentation is enabled.
    pub fn max_stack_usage(id: ThreadId) -> Result<Option<usize>, QueryThreadError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let thread = thread_cb::<Traits>(id)?;
        if !Traits::STACK_USAGE || *thread.st.read(&*lock) == ThreadState::Uninit {
            return Ok(None);
        }
        drop(lock);

        // The stack grows downwards, so the untouched part is at the bottom
        let stack = thread.stack();
        let untouched = (0..stack.len)
            // Safety: The region is valid for reads. The thread may be
            //         writing the upper part concurrently, hence `volatile`.
            .take_while(|&i| unsafe { stack.ptr.add(i).read_volatile() } == STACK_PAINT)
            .count();
        Ok(Some(stack.len - untouched))
    }
}

fn wait_for_stop_core<Traits: KernelTraits>(
    id: ThreadId,
    ticks: Option<u32>,
) -> Result<i32, WaitThreadTimeoutError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let me = expect_waitable_context::<Traits>()?;
    let thread = thread_cb::<Traits>(id)?;

    if ptr::eq(me, thread) {
        return Err(BadContextError::BadContext.into());
    }

    let st = match *thread.st.read(&*lock) {
        ThreadState::Uninit => return Err(WaitThreadTimeoutError::BadObjectState),
        ThreadState::Stopped => return Ok(*thread.exit_value.read(&*lock)),
        _ if ticks.is_some() => ThreadState::WaitForStopOrTick,
        _ => ThreadState::WaitForStop,
    };

    let at = match ticks {
        Some(0) => return Err(WaitThreadTimeoutError::Timeout),
        Some(ticks) => Some(timeout::now(lock.borrow_mut()) + u64::from(ticks)),
        None => None,
    };

    let exit_value = wait::wait_on(
        lock.borrow_mut(),
        me,
        Some(WaitObject::ThreadStop(thread)),
        st,
        at,
    )?;

    Ok(exit_value as i32)
}

/// Implements [`PortToKernel::thread_main`].
///
/// [`PortToKernel::thread_main`]: crate::PortToKernel::thread_main
pub(crate) fn thread_main<Traits: KernelTraits>() -> ! {
    let (thread, start) = {
        // Safety: CPU Lock inactive (the precondition of `thread_main`)
        let lock = unsafe {
            Traits::enter_cpu_lock();
            klock::assume_cpu_lock::<Traits>()
        };
        let Some(thread) = Traits::state().running_thread() else {
            unreachable!("`thread_main` was called without a running thread");
        };
        (thread, *thread.start.read(&*lock))
    };

    let exit_value = (start.func)(start.arg);

    // Safety: CPU Lock inactive (we just released it above, and the start
    //         routine can't leave it active)
    let lock = unsafe {
        Traits::enter_cpu_lock();
        klock::assume_cpu_lock::<Traits>()
    };
    exit_current_thread(lock, thread, exit_value)
}

/// Stop the calling thread and dispatch the next one.
fn exit_current_thread<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
    exit_value: i32,
) -> ! {
    // Release mutexes, handing them over to their waiters
    mutex::release_held_mutexes(lock.borrow_mut(), thread);

    runqueue::remove(lock.borrow_mut(), thread);
    thread.st.replace(&mut *lock, ThreadState::Stopped);
    thread.exit_value.replace(&mut *lock, exit_value);

    wait::wake_all(lock.borrow_mut(), &thread.stop_waiters, exit_value as u32);

    log::trace!(
        "thread {:?} exited with {exit_value}",
        thread_id::<Traits>(thread)
    );

    Traits::state().set_running_thread(lock.borrow_mut(), None);

    core::mem::forget(lock);

    // Safety: CPU Lock active, a thread context. `thread` has been removed
    //         from `running_thread`.
    unsafe { Traits::exit_and_dispatch(thread) }
}

/// Implements [`PortToKernel::thread_faulted`].
///
/// [`PortToKernel::thread_faulted`]: crate::PortToKernel::thread_faulted
pub(crate) fn thread_faulted<Traits: KernelTraits>() {
    let mut lock = unsafe {
        // The fault may have happened with CPU Lock active
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let Some(thread) = Traits::state().running_thread() else {
        kprint!("fault outside any thread");
        return;
    };

    let id = thread_id::<Traits>(thread);
    log::warn!("thread {id:?} faulted; restarting it with its stop handler");
    kprint!("thread {:?} ({}) faulted", id, thread.name.read(&*lock));

    thread.stop_reason.replace(&mut *lock, Some(StopReason::Fault));
    stop_running_thread(lock.borrow_mut(), thread);

    drop(lock);
    request_dispatch::<Traits>();
}

/// Mark the running thread (whose context the dispatcher hasn't saved yet) as
/// `TimeToStop`. The dispatcher restarts it with its stop handler.
fn stop_running_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    if thread.st.read(&*lock).is_waiting() {
        // It's on its way to the dispatcher (e.g., interrupted within
        // `wait_until_woken_up`)
        wait::cancel_wait(lock.borrow_mut(), thread);
        thread.st.replace(&mut *lock, ThreadState::TimeToStop);
        runqueue::push_back(lock, thread);
    } else {
        thread.st.replace(&mut *lock, ThreadState::TimeToStop);
    }
}

/// The stop handler used when none is registered.
fn default_stop_handler<Traits: KernelTraits>(_: usize) -> i32 {
    match System::<Traits>::current_stop_reason() {
        Ok(Some(StopReason::Fault)) => STOP_FAULT,
        _ => STOP_KILLED,
    }
}

/// Re-initialize `thread` to run its stop handler. The thread must not be
/// linked to any run queue, pend queue, or the timer queue.
fn restart_for_stop<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let handler = thread.stop_handler.read(&*lock).unwrap_or(EntryPoint {
        func: default_stop_handler::<Traits>,
        arg: 0,
    });
    thread.start.replace(&mut *lock, handler);

    // Drop any priority inherited from the wait it was killed in, keeping
    // what the held mutexes demand
    let pri = mutex::effective_priority(lock.borrow_mut(), thread);
    thread.pri.replace(&mut *lock, pri);

    // Safety: CPU Lock active. The thread is not the one executing this code,
    //         or its context has already been saved by the dispatcher.
    unsafe { Traits::initialize_thread_state(thread) };

    thread.st.replace(&mut *lock, ThreadState::Runnable);

    log::trace!(
        "thread {:?} restarted with its stop handler at priority {pri}",
        thread_id::<Traits>(thread)
    );
}

/// Transition the thread into `Runnable` and put it into its run queue. Any
/// cleanup for the previous state is the caller's responsibility.
pub(crate) fn make_runnable<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    thread.st.replace(&mut *lock, ThreadState::Runnable);
    runqueue::push_back(lock, thread);
}

/// Remove the running thread from its run queue (in preparation for
/// blocking).
pub(crate) fn remove_from_run_queue<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    runqueue::remove(lock, thread);
}

/// Change the effective priority of a thread, moving it to the right position
/// in the run queue or pend queue it's in.
pub(crate) fn set_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    pri: Priority,
) {
    match *thread.st.read(&*lock) {
        ThreadState::Runnable | ThreadState::TimeToStop => {
            runqueue::remove(lock.borrow_mut(), thread);
            thread.pri.replace(&mut *lock, pri);
            runqueue::push_back(lock, thread);
        }
        st if st.is_waiting() => {
            thread.pri.replace(&mut *lock, pri);
            wait::reposition_waiter(lock, thread);
        }
        _ => {
            thread.pri.replace(&mut *lock, pri);
        }
    }
}

/// Relinquish CPU Lock. After that, if there's a higher-priority thread than
/// the running one, call `yield_cpu`.
///
/// Operations that make threads runnable should call this before returning.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let state = Traits::state();

    let running_pri = match state.running_thread() {
        Some(thread) if *thread.st.read(&*lock) == ThreadState::Runnable => {
            usize::from(*thread.pri.read(&*lock))
        }
        _ => usize::MAX,
    };

    // Posts deferred while CPU Lock was active must reach the scheduler, too
    let has_preempting_thread = state.ready_bitmap.read(&*lock).any_below(running_pri)
        || semaphore::has_pending_handoff::<Traits>();

    if !has_preempting_thread {
        // The dispatcher won't run, so the tick interval has to be updated
        // here (e.g., a new thread may now share the running thread's level)
        timeout::update_tick_interval(lock.borrow_mut());
    }

    drop(lock);

    if has_preempting_thread {
        request_dispatch::<Traits>();
    }
}

/// Implements [`PortToKernel::choose_running_thread`].
///
/// [`PortToKernel::choose_running_thread`]: crate::PortToKernel::choose_running_thread
pub(crate) fn choose_next_running_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let state = Traits::state();
    let prev = state.running_thread();

    if let Some(prev) = prev {
        if *prev.st.read(&*lock) == ThreadState::TimeToStop {
            // The dispatcher has saved its context, so it can be restarted in
            // place
            runqueue::remove(lock.borrow_mut(), prev);
            restart_for_stop(lock.borrow_mut(), prev);
            runqueue::push_back(lock.borrow_mut(), prev);
        }
    }

    semaphore::drain_handoff_queue(lock.borrow_mut());

    let time_slice = state.time_slice_pending.replace(&mut *lock, false);

    // The running thread stays at the front of its queue. Rotating the
    // queue hands the processor to the next thread of the same priority.
    let next = runqueue::choose(lock.borrow_mut(), prev, time_slice);

    #[cfg(feature = "trace_sched")]
    log::trace!(
        "scheduler: {:?} -> {:?} (time slice = {time_slice})",
        prev.map(thread_id::<Traits>),
        next.map(thread_id::<Traits>)
    );

    state.set_running_thread(lock.borrow_mut(), next);

    timeout::update_tick_interval(lock);
}

/// Transition the currently running thread into the waiting state that the
/// caller has already set up. Returns when woken up.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    debug_assert!(thread.st.read(&*lock).is_waiting());

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from this
        //             function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if *thread.st.read(&*lock) == ThreadState::Runnable {
            break;
        }

        debug_assert!(thread.st.read(&*lock).is_waiting());
    }
}

/// Is the running thread contended, i.e., does it share its priority level
/// with another runnable thread?
pub(crate) fn is_running_thread_contended<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    match Traits::state().running_thread() {
        Some(thread) if *thread.st.read(&*lock) == ThreadState::Runnable => {
            let pri = usize::from(*thread.pri.read(&*lock));
            runqueue::is_contended(lock, pri)
        }
        _ => false,
    }
}

#[inline]
pub(crate) fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        ptr::null()
    }
}
