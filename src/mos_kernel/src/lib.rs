//! The portable core of a preemptive real-time microkernel for single-core
//! microcontrollers.
//!
//! This crate contains everything that doesn't depend on a particular
//! processor: the thread state machine, the priority run queues and the
//! scheduling decision procedure, the tick counter and the timer queue, and the
//! synchronization primitives ([`Mutex`], [`Semaphore`], [`Signal`], [`Queue`])
//! whose blocking logic is entangled with the scheduler.
//!
//! A port (e.g., `mos_port_arm_m` or `mos_port_std`) supplies the
//! processor-specific parts by implementing [`PortThreading`], [`PortAtomic`],
//! and [`PortTimer`] on an application-defined *system type*, and calls back
//! into the kernel through [`PortToKernel`]. The application instantiates the
//! kernel state for the system type with [`build!`].
//!
//! # Contexts
//!
//! Kernel code runs in one of three contexts: a **thread context**, an
//! **interrupt context**, or the **boot context** (which the idle loop takes
//! over after the first dispatch). Blocking operations are only allowed in a
//! thread context. Operations documented as *ISR-safe* never take CPU Lock and
//! may be called from any context, including interrupt handlers that run above
//! the kernel's interrupt masking level.
//!
//! # Locking
//!
//! See the `klock` module for the two locks (CPU Lock and IRQ Lock) that guard
//! kernel state.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]
#![doc(test(attr(deny(warnings))))]
use core::{fmt, marker::PhantomData, num::NonZeroU32};

#[macro_use]
mod print;

mod cfg;
mod error;
mod klock;
mod mutex;
mod queue;
mod semaphore;
mod signal;
mod state;
mod thread;
mod timeout;
mod timer;
mod utils;
mod wait;

pub use self::{
    cfg::Cfg,
    error::*,
    mutex::Mutex,
    print::set_print_hook,
    queue::{wait_on_multi_queue, wait_on_multi_queue_or_timeout, Queue},
    semaphore::Semaphore,
    signal::Signal,
    state::State,
    thread::{
        StackRegion, StopReason, ThreadAttr, ThreadCb, ThreadId, ThreadStack, ThreadState,
        STOP_FAULT, STOP_KILLED,
    },
    timer::Timer,
    utils::PRIO_BITMAP_MAX_LEN,
};

/// Numeric value used to express a priority level. `0` is the most urgent
/// level.
pub type Priority = u8;

/// The context-switching interface a port implements.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + 'static {
    /// The per-thread context saved by the port, e.g., the saved stack
    /// pointer.
    type PortThreadState: Send + Sync + fmt::Debug + 'static;

    /// The initial value of [`ThreadCb::port_thread_state`] for all threads.
    #[allow(clippy::declare_interior_mutable_const)]
    const PORT_THREAD_STATE_INIT: Self::PortThreadState;

    /// Transfer the control to the thread chosen by
    /// [`PortToKernel::choose_running_thread`] (or to the idle context if
    /// there is none), discarding the current (boot) context.
    ///
    /// Precondition: CPU Lock active, a boot context
    unsafe fn dispatch_first_thread() -> !;

    /// Yield the processor.
    ///
    /// In a thread context, this method immediately transfers the control to
    /// a dispatcher, which calls [`PortToKernel::choose_running_thread`] with
    /// CPU Lock active and switches to the chosen thread. The method returns
    /// when the calling thread is chosen again.
    ///
    /// In an interrupt context, the effect of this method is deferred until the
    /// processor completes the execution of all active interrupt handlers and
    /// CPU Lock is released. An interrupt handler may call this method while
    /// the thread it preempted holds CPU Lock.
    ///
    /// Precondition: CPU Lock inactive, or an interrupt context
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running thread (`thread`, which has
    /// already been removed from [`State::running_thread`]) and proceed to the
    /// dispatcher.
    ///
    /// Precondition: CPU Lock active, a thread context
    unsafe fn exit_and_dispatch(thread: &'static ThreadCb<Self>) -> !;

    /// Disable all kernel-managed interrupts (this state is called *CPU
    /// Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Activate CPU Lock. Return `true` iff CPU Lock was inactive before the
    /// call.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Prepare the thread for activation. More specifically, set the current
    /// program counter to the thread entry trampoline (which calls
    /// [`PortToKernel::thread_main`]) and the current stack pointer to the
    /// top of the thread's stack.
    ///
    /// The thread may have been running before. Its old context is discarded.
    ///
    /// Precondition: CPU Lock active, the thread is not the one currently
    /// executing the caller
    unsafe fn initialize_thread_state(thread: &'static ThreadCb<Self>);

    /// Return a flag indicating whether CPU Lock is currently active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a thread
    /// context.
    fn is_thread_context() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;
}

/// The interface for the short, strictly-nesting interrupt-disable regions
/// (*IRQ Lock*) used by ISR-safe operations.
///
/// # Safety
///
/// `enter_irq_lock` must disable every interrupt that can call into the
/// kernel, including the ones running above CPU Lock's masking level.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortAtomic: Sized + 'static {
    /// The interrupt state saved by [`Self::enter_irq_lock`].
    type IrqLockState: Copy;

    /// Disable all interrupts and return the previous state.
    unsafe fn enter_irq_lock() -> Self::IrqLockState;

    /// Restore the interrupt state saved by [`Self::enter_irq_lock`].
    unsafe fn leave_irq_lock(state: Self::IrqLockState);
}

/// The adaptive tick timer interface a port implements.
///
/// The port reports time in whole ticks. The kernel accumulates reported ticks
/// into the 64-bit tick count, and reprograms the distance to the next tick
/// interrupt whenever its timing needs change.
#[allow(clippy::missing_safety_doc)]
pub trait PortTimer {
    /// The maximum value accepted by [`Self::set_tick_interval`].
    const MAX_TICK_INTERVAL: u32;

    /// Return the number of whole ticks elapsed since the last report (the
    /// last call to `elapsed_ticks` or `set_tick_interval`).
    ///
    /// Precondition: CPU Lock active
    unsafe fn elapsed_ticks() -> u32;

    /// Schedule the next tick interrupt `interval` ticks after the last tick
    /// boundary, or stop the timer if `interval` is `None`. Return the number
    /// of whole ticks elapsed since the last report.
    ///
    /// `interval` never exceeds [`Self::MAX_TICK_INTERVAL`].
    ///
    /// Precondition: CPU Lock active
    unsafe fn set_tick_interval(interval: Option<NonZeroU32>) -> u32;
}

/// The static configuration of a kernel instance. Implemented by [`build!`].
///
/// # Safety
///
/// Only meant to be implemented by [`build!`].
pub unsafe trait KernelCfg: PortThreading + PortAtomic {
    /// The number of priority levels, in range `1..=32`.
    const NUM_PRIORITIES: usize;

    /// The tick frequency.
    const TICKS_PER_SECOND: u32;

    /// Stop the tick timer when the system is idle and nothing needs a timed
    /// wakeup.
    const TICKLESS_IDLE: bool;

    /// Paint thread stacks at initialization so that
    /// [`System::max_stack_usage`] can report a high-water mark.
    const STACK_USAGE: bool;

    /// Get the kernel state.
    fn state() -> &'static State<Self>;

    /// Get the thread control blocks.
    fn thread_cb_pool() -> &'static [ThreadCb<Self>];

    /// Called once by the boot context before the first dispatch. This is
    /// where the application initializes and starts its threads.
    fn startup_hook();
}

/// Represents a complete kernel instance. Implemented automatically on every
/// type that a port and [`build!`] have been applied to.
pub trait KernelTraits: KernelCfg + PortTimer {}

impl<T: KernelCfg + PortTimer> KernelTraits for T {}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Initialize runtime structures, run the startup hook, and dispatch the
    /// first thread.
    ///
    /// Precondition: CPU Lock inactive, a boot context. No interrupt handler
    /// that calls into the kernel has been taken yet.
    unsafe fn boot() -> !;

    /// Determine the next thread to run and store it in
    /// [`State::running_thread`].
    ///
    /// Precondition: CPU Lock active, not within a thread context
    unsafe fn choose_running_thread();

    /// Called by the port's timer driver when a tick interrupt fires.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn timer_tick();

    /// The body of every thread. Runs the running thread's start routine (its
    /// entry function, or its stop handler after a kill) and exits the thread
    /// with the returned value.
    ///
    /// Precondition: CPU Lock inactive, a thread context that has just been
    /// dispatched after [`PortThreading::initialize_thread_state`]
    unsafe fn thread_main() -> !;

    /// Called by the port's fault handler when the running thread caused an
    /// unrecoverable fault. The thread is stopped and its stop handler is
    /// scheduled to run.
    ///
    /// Precondition: an interrupt context or the faulting thread's context
    unsafe fn thread_faulted();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        state::boot::<Traits>()
    }

    unsafe fn choose_running_thread() {
        // Safety: The precondition of this method includes CPU Lock being
        //         active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        thread::choose_next_running_thread::<Traits>(lock.borrow_mut());

        // Post-condition: CPU Lock active
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }

    unsafe fn thread_main() -> ! {
        thread::thread_main::<Traits>()
    }

    unsafe fn thread_faulted() {
        thread::thread_faulted::<Traits>();
    }
}

/// The application-facing interface of a kernel instance.
///
/// # Examples
///
/// ```rust,ignore
/// type Sys = mos_kernel::System<SystemTraits>;
///
/// fn startup() {
///     Sys::init_thread(ThreadId::new(0), ThreadAttr::new(worker, 0, 3, STACK.take().unwrap()))
///         .unwrap();
///     Sys::run_thread(ThreadId::new(0)).unwrap();
/// }
/// ```
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits> fmt::Debug for System<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("System")
    }
}
