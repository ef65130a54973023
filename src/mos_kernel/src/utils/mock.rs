//! A system type for unit tests that exercise kernel data structures without
//! dispatching threads
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex, MutexGuard,
};

use crate::{KernelCfg, PortAtomic, PortThreading, PortTimer, State, ThreadCb};

pub(crate) struct Sys;

static CPU_LOCK: AtomicBool = AtomicBool::new(false);
static INTERRUPT: AtomicBool = AtomicBool::new(false);
static YIELDS: AtomicUsize = AtomicUsize::new(0);
static STATE: State<Sys> = State::new();
static THREADS: [ThreadCb<Sys>; 4] = [const { ThreadCb::new() }; 4];

/// Serialize the tests sharing `Sys`.
pub(crate) fn exclusive() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Make `Sys` report an interrupt context (or not).
pub(crate) fn set_interrupt_context(yes: bool) {
    INTERRUPT.store(yes, Ordering::Relaxed);
}

/// The number of times the kernel has called `yield_cpu`.
pub(crate) fn yield_count() -> usize {
    YIELDS.load(Ordering::Relaxed)
}

unsafe impl PortThreading for Sys {
    type PortThreadState = ();
    const PORT_THREAD_STATE_INIT: Self::PortThreadState = ();

    unsafe fn dispatch_first_thread() -> ! {
        unreachable!()
    }

    unsafe fn yield_cpu() {
        YIELDS.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn exit_and_dispatch(_: &'static ThreadCb<Self>) -> ! {
        unreachable!()
    }

    unsafe fn enter_cpu_lock() {
        assert!(!CPU_LOCK.swap(true, Ordering::Relaxed));
    }

    unsafe fn leave_cpu_lock() {
        assert!(CPU_LOCK.swap(false, Ordering::Relaxed));
    }

    unsafe fn initialize_thread_state(_: &'static ThreadCb<Self>) {}

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.load(Ordering::Relaxed)
    }

    fn is_thread_context() -> bool {
        false
    }

    fn is_interrupt_context() -> bool {
        INTERRUPT.load(Ordering::Relaxed)
    }
}

unsafe impl PortAtomic for Sys {
    type IrqLockState = ();

    unsafe fn enter_irq_lock() {}

    unsafe fn leave_irq_lock(_: ()) {}
}

impl PortTimer for Sys {
    const MAX_TICK_INTERVAL: u32 = 1 << 24;

    unsafe fn elapsed_ticks() -> u32 {
        0
    }

    unsafe fn set_tick_interval(_: Option<core::num::NonZeroU32>) -> u32 {
        0
    }
}

unsafe impl KernelCfg for Sys {
    const NUM_PRIORITIES: usize = 8;
    const TICKS_PER_SECOND: u32 = 1000;
    const TICKLESS_IDLE: bool = true;
    const STACK_USAGE: bool = false;

    fn state() -> &'static State<Self> {
        &STATE
    }

    fn thread_cb_pool() -> &'static [ThreadCb<Self>] {
        &THREADS
    }

    fn startup_hook() {}
}
