//! Simulation environment for running the MOS kernel in a hosted environment
//!
//! Every kernel thread is backed by an OS thread, and the boot context (which
//! becomes the idle context after the first dispatch) by another. Exactly one
//! of them holds the simulated CPU at a time. The others are parked until the
//! dispatcher hands the CPU to them.
//!
//! # Time and interrupts
//!
//! Time is virtual. The tick timer is a simulated SysTick clocked by simulated
//! CPU cycles, driven by `mos_portkit`'s adaptive tick state machine, and
//! [`CYCLES_PER_TICK`] cycles make a tick. A thread consumes one cycle
//! every time it leaves CPU Lock or IRQ Lock, and [`consume_cycles`] consumes
//! any number of them. When every thread is blocked, the idle context skips
//! ahead to the next timer interrupt.
//!
//! Interrupts are taken at the points where a thread consumes cycles (and
//! thus never while CPU Lock or IRQ Lock is active). They run on the
//! interrupted thread's OS thread, as does the dispatcher. [`simulate_interrupt`]
//! runs arbitrary code in an interrupt context.
//!
//! # Usage
//!
//! ```rust,ignore
//! mos_port_std::use_port!(unsafe struct SystemTraits);
//! mos_kernel::build!(SystemTraits, Cfg::new(8, 4), startup_hook = startup);
//!
//! fn startup() { /* initialize and start threads */ }
//!
//! #[test]
//! fn run() {
//!     mos_port_std::boot::<SystemTraits>();
//! }
//! ```
//!
//! [`boot`] returns when a thread calls [`shutdown`]. A panic in any thread
//! shuts the system down and is propagated to the caller of `boot`. So is a
//! stall (every thread is blocked and no timer interrupt is coming).
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]
use mos_kernel::{KernelCfg, KernelTraits, PortThreading, PortToKernel, ThreadCb};
use mos_portkit::tickless::{ReloadTimer, TicklessCfg, TicklessState};
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    num::NonZeroU32,
    panic,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread,
};

mod timer;

use self::timer::SimTimer;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate mos_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// The number of simulated CPU cycles in a tick.
pub const CYCLES_PER_TICK: u32 = 100;

#[doc(hidden)]
pub const TICKLESS_CFG: TicklessCfg =
    TicklessCfg::new(CYCLES_PER_TICK as u64, 1, SimTimer::MAX_RELOAD, 0);

/// The value of `PortTimer::MAX_TICK_INTERVAL`.
pub const MAX_TICK_INTERVAL: u32 = TICKLESS_CFG.max_tick_interval();

/// The context the boot phase runs in, and the idle loop after that.
const IDLE_CONTEXT: usize = 0;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortThreadState = ThreadContext> + PortToKernel
{
    fn port_state() -> &'static State;
}

/// The internal state of the port.
#[doc(hidden)]
pub struct State {
    sched: Mutex<Sched>,
    /// Signaled when `Sched::current` or `Sched::shutdown` changes, or a
    /// context is abandoned.
    sched_cond: Condvar,
}

struct Sched {
    /// The context holding the CPU.
    current: usize,
    /// Contexts backed by live OS threads.
    contexts: Slab<Context>,
    join_handles: Vec<thread::JoinHandle<()>>,
    cpu_lock: bool,
    irq_lock: bool,
    dispatch_pending: bool,
    timer: SimTimer,
    tickless: TicklessState,
    shutdown: bool,
    /// The first panic that occurred in a context.
    panic: Option<Box<dyn Any + Send>>,
}

#[derive(Debug, Default)]
struct Context {
    /// The kernel thread using this context has been re-initialized or has
    /// exited. The OS thread must terminate without touching anything.
    abandoned: bool,
}

/// The port-specific part of a thread control block.
#[derive(Debug)]
pub struct ThreadContext {
    /// Accessed with CPU Lock active or by the dispatcher, so `SpinMutex` is
    /// sufficient.
    tsm: SpinMutex<Tsm>,
}

/// Thread context state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// `initialize_thread_state` hasn't been called.
    Uninit,
    /// Initialized but not backed by an OS thread yet. One is spawned when the
    /// thread is dispatched.
    Dormant,
    /// Backed by the context with the given ID.
    Running(usize),
}

/// The role of an OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The boot context after `dispatch_first_thread`.
    Idle,
    /// Running an interrupt handler or the dispatcher.
    Interrupt,
    Thread,
    /// Terminating. Port operations are no-ops.
    Detached,
}

thread_local! {
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };
    static CONTEXT: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// The panic payload used to unwind an OS thread whose context is being
/// discarded.
struct ContextExit;

fn thread_role() -> ThreadRole {
    THREAD_ROLE.with(|r| r.get())
}

fn is_detached() -> bool {
    thread_role() == ThreadRole::Detached || thread::panicking()
}

/// Run `f` with the current OS thread's role temporarily changed.
fn with_role<R>(role: ThreadRole, f: impl FnOnce() -> R) -> R {
    let prev = THREAD_ROLE.with(|r| r.replace(role));
    let result = f();
    THREAD_ROLE.with(|r| r.set(prev));
    result
}

/// Terminate the current OS thread by unwinding to its entry point.
fn exit_context() -> ! {
    THREAD_ROLE.with(|r| r.set(ThreadRole::Detached));
    panic::resume_unwind(Box::new(ContextExit))
}

impl ThreadContext {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

impl Sched {
    const fn new() -> Self {
        Self {
            current: IDLE_CONTEXT,
            contexts: Slab::new(),
            join_handles: Vec::new(),
            cpu_lock: false,
            irq_lock: false,
            dispatch_pending: false,
            timer: SimTimer::new(),
            tickless: TicklessState::new(),
            shutdown: false,
            panic: None,
        }
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            sched: Mutex::new(Sched::new()),
            sched_cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sched> {
        self.sched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Boot the kernel and run the system until [`shutdown`] is called.
    pub fn port_boot<Traits: PortInstance>(&'static self) {
        let mut sched = self.lock();
        assert!(
            sched.contexts.is_empty() && !sched.shutdown,
            "the system can only be booted once"
        );

        let ctx = sched.contexts.insert(Context::default());
        debug_assert_eq!(ctx, IDLE_CONTEXT);
        sched.current = ctx;

        log::trace!("starting the boot context");
        let join_handle = self.spawn_context(ctx, ThreadRole::Boot, || {
            // Safety: We are a port, so it's okay to call this
            unsafe { <Traits as PortToKernel>::boot() }
        });
        sched.join_handles.push(join_handle);

        while !sched.shutdown {
            sched = (self.sched_cond.wait(sched)).unwrap_or_else(PoisonError::into_inner);
        }

        // Wait until all OS threads exit
        loop {
            let join_handles = std::mem::take(&mut sched.join_handles);
            if join_handles.is_empty() {
                break;
            }
            drop(sched);
            for join_handle in join_handles {
                // Panics are caught by the context
                let _ = join_handle.join();
            }
            sched = self.lock();
        }
        log::trace!("all contexts have exited");

        // Propagate any panic that occurred in a context
        if let Some(payload) = sched.panic.take() {
            drop(sched);
            panic::resume_unwind(payload);
        }
    }

    /// Spawn an OS thread backing the context `ctx`. It waits until the
    /// context is given the CPU, and then calls `f`.
    fn spawn_context(
        &'static self,
        ctx: usize,
        role: ThreadRole,
        f: impl FnOnce() + Send + 'static,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            THREAD_ROLE.with(|r| r.set(role));
            CONTEXT.with(|c| c.set(ctx));

            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                self.wait_for_cpu(ctx);
                f();
            }));

            THREAD_ROLE.with(|r| r.set(ThreadRole::Detached));

            let mut sched = self.lock();
            sched.contexts.try_remove(ctx);
            if let Err(payload) = result {
                if !payload.is::<ContextExit>() {
                    log::trace!("context {ctx} panicked; shutting down");
                    sched.panic.get_or_insert(payload);
                    sched.shutdown = true;
                }
            }
            self.sched_cond.notify_all();
        })
    }

    /// Block the calling OS thread until `ctx` holds the CPU. Exits the OS
    /// thread if the context is abandoned or the system shuts down.
    fn wait_for_cpu(&self, ctx: usize) {
        let mut sched = self.lock();
        loop {
            let abandoned = sched.contexts.get(ctx).map_or(true, |c| c.abandoned);
            if sched.shutdown || abandoned {
                drop(sched);
                exit_context();
            }
            if sched.current == ctx {
                return;
            }
            sched = (self.sched_cond.wait(sched)).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take pending interrupts (including the dispatcher) unless masked.
    fn take_interrupts<Traits: PortInstance>(&'static self) {
        loop {
            let mut sched = self.lock();
            if sched.shutdown {
                drop(sched);
                exit_context();
            }
            if sched.cpu_lock || sched.irq_lock {
                return;
            }

            if sched.timer.take_pending() {
                drop(sched);
                log::trace!("timer interrupt");
                with_role(ThreadRole::Interrupt, || {
                    // Safety: CPU Lock inactive, an interrupt context
                    unsafe { <Traits as PortToKernel>::timer_tick() }
                });
            } else if sched.dispatch_pending {
                sched.dispatch_pending = false;
                drop(sched);
                self.dispatch::<Traits>();
            } else {
                return;
            }
        }
    }

    /// Consume a cycle and take interrupts. Called when a thread leaves CPU
    /// Lock or IRQ Lock.
    fn checkpoint<Traits: PortInstance>(&'static self) {
        if thread_role() != ThreadRole::Thread {
            return;
        }
        self.lock().timer.advance(1);
        self.take_interrupts::<Traits>();
    }

    /// Choose the next thread and hand the CPU to its context. Returns when
    /// the calling context is chosen again.
    fn dispatch<Traits: PortInstance>(&'static self) {
        let me = CONTEXT.with(|c| c.get());

        with_role(ThreadRole::Interrupt, || {
            self.lock().cpu_lock = true;
            // Safety: CPU Lock active, not a thread context
            unsafe { <Traits as PortToKernel>::choose_running_thread() };
            self.lock().cpu_lock = false;
        });

        let next = match Traits::state().running_thread() {
            None => IDLE_CONTEXT,
            Some(thread) => {
                let mut tsm = thread.port_thread_state.tsm.lock();
                match *tsm {
                    Tsm::Running(ctx) => ctx,
                    Tsm::Dormant => {
                        let ctx = self.spawn_thread_context::<Traits>();
                        log::trace!("spawned context {ctx} for thread {thread:p}");
                        *tsm = Tsm::Running(ctx);
                        ctx
                    }
                    Tsm::Uninit => unreachable!("dispatching an uninitialized thread"),
                }
            }
        };

        if next == me {
            return;
        }

        log::trace!("switching from context {me} to {next}");
        {
            let mut sched = self.lock();
            sched.current = next;
            self.sched_cond.notify_all();
        }

        self.wait_for_cpu(me);
    }

    fn spawn_thread_context<Traits: PortInstance>(&'static self) -> usize {
        let mut sched = self.lock();
        let ctx = sched.contexts.insert(Context::default());
        let join_handle = self.spawn_context(ctx, ThreadRole::Thread, || {
            // Safety: CPU Lock inactive, a thread context that has just been
            //         dispatched
            unsafe { <Traits as PortToKernel>::thread_main() }
        });
        sched.join_handles.push(join_handle);
        ctx
    }

    pub unsafe fn dispatch_first_thread<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_thread");
        assert_eq!(thread_role(), ThreadRole::Boot);

        {
            let mut sched = self.lock();
            assert!(sched.cpu_lock);
            sched.cpu_lock = false;
            sched.dispatch_pending = true;
        }

        THREAD_ROLE.with(|r| r.set(ThreadRole::Idle));
        self.idle_loop::<Traits>()
    }

    fn idle_loop<Traits: PortInstance>(&'static self) -> ! {
        loop {
            self.take_interrupts::<Traits>();

            // Nothing to do until the next timer interrupt. Skip ahead.
            let mut sched = self.lock();
            match sched.timer.cycles_to_wrap() {
                Some(cycles) => {
                    log::trace!("idle: skipping {cycles} cycles");
                    sched.timer.advance(cycles);
                }
                None if sched.dispatch_pending => {}
                None => {
                    drop(sched);
                    panic!("the system has stalled: every thread is blocked and the tick timer is stopped");
                }
            }
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        match thread_role() {
            ThreadRole::Detached => {}
            ThreadRole::Thread => {
                self.lock().dispatch_pending = true;
                self.take_interrupts::<Traits>();
            }
            ThreadRole::Boot | ThreadRole::Idle | ThreadRole::Interrupt => {
                // Deferred until the interrupt handler returns
                self.lock().dispatch_pending = true;
            }
            ThreadRole::Unknown => panic!("`yield_cpu` was called from an unknown thread"),
        }
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        thread: &'static ThreadCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch({thread:p})");
        assert_eq!(thread_role(), ThreadRole::Thread);

        // Dissociate this context from the thread
        let ctx = match std::mem::replace(&mut *thread.port_thread_state.tsm.lock(), Tsm::Uninit) {
            Tsm::Running(ctx) => ctx,
            tsm => unreachable!("exiting a thread in {tsm:?}"),
        };
        debug_assert_eq!(ctx, CONTEXT.with(|c| c.get()));

        {
            let mut sched = self.lock();
            assert!(sched.cpu_lock);
            if let Some(context) = sched.contexts.get_mut(ctx) {
                context.abandoned = true;
            }
            sched.cpu_lock = false;
            sched.dispatch_pending = true;
        }

        // The dispatcher switches to another context and never comes back
        self.take_interrupts::<Traits>();
        exit_context()
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&self) {
        if is_detached() {
            return;
        }
        log::trace!("enter_cpu_lock");

        let mut sched = self.lock();
        assert!(!sched.cpu_lock);
        sched.cpu_lock = true;
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&'static self) {
        if is_detached() {
            return;
        }
        log::trace!("leave_cpu_lock");

        {
            let mut sched = self.lock();
            assert!(sched.cpu_lock);
            sched.cpu_lock = false;
        }

        self.checkpoint::<Traits>();
    }

    pub unsafe fn initialize_thread_state<Traits: PortInstance>(
        &self,
        thread: &'static ThreadCb<Traits>,
    ) {
        log::trace!("initialize_thread_state({thread:p})");

        let mut tsm = thread.port_thread_state.tsm.lock();
        if let Tsm::Running(ctx) = *tsm {
            // Discard the old context. If it's blocked, it wakes up and exits.
            // If it's the current one, it exits when it gives up the CPU.
            log::trace!("abandoning context {ctx}");
            let mut sched = self.lock();
            if let Some(context) = sched.contexts.get_mut(ctx) {
                context.abandoned = true;
            }
            self.sched_cond.notify_all();
        }
        *tsm = Tsm::Dormant;
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        self.lock().cpu_lock
    }

    pub fn is_thread_context<Traits: PortInstance>(&self) -> bool {
        thread_role() == ThreadRole::Thread
    }

    pub fn is_interrupt_context<Traits: PortInstance>(&self) -> bool {
        thread_role() == ThreadRole::Interrupt
    }

    pub unsafe fn enter_irq_lock<Traits: PortInstance>(&self) -> bool {
        if is_detached() {
            return true;
        }
        std::mem::replace(&mut self.lock().irq_lock, true)
    }

    pub unsafe fn leave_irq_lock<Traits: PortInstance>(&'static self, was_active: bool) {
        if is_detached() {
            return;
        }
        self.lock().irq_lock = was_active;
        if !was_active {
            self.checkpoint::<Traits>();
        }
    }

    pub unsafe fn elapsed_ticks<Traits: PortInstance>(&self) -> u32 {
        let mut sched = self.lock();
        let Sched {
            tickless, timer, ..
        } = &mut *sched;
        tickless.elapsed_ticks(&TICKLESS_CFG, timer)
    }

    pub unsafe fn set_tick_interval<Traits: PortInstance>(&self, interval: Option<NonZeroU32>) -> u32 {
        log::trace!("set_tick_interval({interval:?})");
        let mut sched = self.lock();
        let Sched {
            tickless, timer, ..
        } = &mut *sched;
        tickless.set_tick_interval(&TICKLESS_CFG, timer, interval)
    }
}

/// Boot the kernel and run the system until [`shutdown`] is called. See
/// [the crate-level documentation](crate) for details.
pub fn boot<Traits: PortInstance>() {
    Traits::port_state().port_boot::<Traits>();
}

/// Shut down the system. The caller of [`boot`] regains control once every
/// context has exited.
///
/// This can be called from a thread or an interrupt context. It doesn't
/// return.
pub fn shutdown<Traits: PortInstance>() -> ! {
    log::trace!("shutdown");
    assert!(
        matches!(thread_role(), ThreadRole::Thread | ThreadRole::Interrupt),
        "`shutdown` was called from outside the system"
    );

    let state = Traits::port_state();
    {
        let mut sched = state.lock();
        sched.shutdown = true;
        state.sched_cond.notify_all();
    }
    exit_context()
}

/// Consume `cycles` cycles of simulated CPU time in the calling thread,
/// taking interrupts as they come.
pub fn consume_cycles<Traits: PortInstance>(cycles: u32) {
    assert_eq!(
        thread_role(),
        ThreadRole::Thread,
        "`consume_cycles` can only be called from a thread context"
    );

    let state = Traits::port_state();
    let mut remaining = cycles;
    while remaining > 0 {
        {
            let mut sched = state.lock();
            let step = sched.timer.cycles_to_wrap().map_or(remaining, |c| c.min(remaining));
            sched.timer.advance(step);
            remaining -= step;
        }
        state.take_interrupts::<Traits>();
    }
}

/// Run `f` in an interrupt context, as if an interrupt was taken right now.
/// A dispatch requested by `f` happens when it returns.
///
/// Must be called from a thread context with CPU Lock inactive.
pub fn simulate_interrupt<Traits: PortInstance, R>(f: impl FnOnce() -> R) -> R {
    assert_eq!(
        thread_role(),
        ThreadRole::Thread,
        "`simulate_interrupt` can only be called from a thread context"
    );
    assert!(!Traits::is_cpu_lock_active());

    log::trace!("simulated interrupt");
    let result = with_role(ThreadRole::Interrupt, f);
    Traits::port_state().take_interrupts::<Traits>();
    result
}

/// Simulate an unrecoverable fault in the calling thread. The thread is
/// stopped and restarted with its stop handler.
pub fn simulate_fault<Traits: PortInstance>() -> ! {
    simulate_interrupt::<Traits, _>(|| {
        // Safety: An interrupt context
        unsafe { <Traits as PortToKernel>::thread_faulted() }
    });
    unreachable!("the faulted thread was resumed")
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::mos_kernel::{PortAtomic, PortThreading, PortTimer, ThreadCb};
            use $crate::{PortInstance, State, ThreadContext};
            use ::core::num::NonZeroU32;

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelCfg`
            unsafe impl PortThreading for $SystemTraits {
                type PortThreadState = ThreadContext;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_THREAD_STATE_INIT: Self::PortThreadState = ThreadContext::new();

                unsafe fn dispatch_first_thread() -> ! {
                    unsafe { PORT_STATE.dispatch_first_thread::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(thread: &'static ThreadCb<Self>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(thread) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                unsafe fn initialize_thread_state(thread: &'static ThreadCb<Self>) {
                    unsafe { PORT_STATE.initialize_thread_state::<Self>(thread) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                fn is_thread_context() -> bool {
                    PORT_STATE.is_thread_context::<Self>()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context::<Self>()
                }
            }

            unsafe impl PortAtomic for $SystemTraits {
                type IrqLockState = bool;

                unsafe fn enter_irq_lock() -> bool {
                    unsafe { PORT_STATE.enter_irq_lock::<Self>() }
                }

                unsafe fn leave_irq_lock(was_active: bool) {
                    unsafe { PORT_STATE.leave_irq_lock::<Self>(was_active) }
                }
            }

            impl PortTimer for $SystemTraits {
                const MAX_TICK_INTERVAL: u32 = $crate::MAX_TICK_INTERVAL;

                unsafe fn elapsed_ticks() -> u32 {
                    unsafe { PORT_STATE.elapsed_ticks::<Self>() }
                }

                unsafe fn set_tick_interval(interval: Option<NonZeroU32>) -> u32 {
                    unsafe { PORT_STATE.set_tick_interval::<Self>(interval) }
                }
            }
        }
    };
}
