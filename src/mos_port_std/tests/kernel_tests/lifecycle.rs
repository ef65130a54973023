//! Thread states, exit values, and the error conditions of the thread
//! management API
use mos_kernel::{
    Cfg, InitThreadError, QueryThreadError, RunThreadError, SetPriorityError, System, ThreadAttr,
    ThreadId, ThreadState, WaitThreadError, WaitThreadTimeoutError,
};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{leak_stack, start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(4, 5), startup_hook = startup);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static PREEMPTED: AtomicBool = AtomicBool::new(false);

const SUPERVISOR: ThreadId = ThreadId::new(0);
const A: ThreadId = ThreadId::new(1);
const B: ThreadId = ThreadId::new(2);
const C: ThreadId = ThreadId::new(3);
const NEVER_INITIALIZED: ThreadId = ThreadId::new(4);
const OUT_OF_RANGE: ThreadId = ThreadId::new(5);

fn startup() {
    start_thread::<SystemTraits>(0, supervisor_body, 0, 1);
    Sys::init_thread(A, ThreadAttr::new(double, 7, 2, leak_stack())).unwrap();
}

fn double(x: usize) -> i32 {
    assert_eq!(Sys::current_thread(), Some(A));
    x as i32 * 2
}

fn exiting(x: usize) -> i32 {
    // Safety: Nothing on the stack relies on its destructor being called
    let never = unsafe { Sys::exit_thread(x as i32) }.unwrap();
    match never {}
}

fn sleepy(_: usize) -> i32 {
    Sys::delay(10).unwrap();
    1
}

fn mark_preempted(_: usize) -> i32 {
    PREEMPTED.store(true, Ordering::Relaxed);
    0
}

fn supervisor_body(_: usize) -> i32 {
    assert_eq!(Sys::current_thread(), Some(SUPERVISOR));

    // Start, exit value, and restart
    assert_eq!(Sys::thread_state(A).unwrap(), ThreadState::Init);
    Sys::run_thread(A).unwrap();
    assert_eq!(Sys::thread_state(A).unwrap(), ThreadState::Runnable);
    assert_eq!(Sys::run_thread(A), Err(RunThreadError::BadObjectState));
    assert_eq!(
        Sys::init_thread(A, ThreadAttr::new(double, 0, 2, leak_stack())),
        Err(InitThreadError::BadObjectState)
    );
    assert_eq!(Sys::wait_for_thread_stop(A).unwrap(), 14);
    assert_eq!(Sys::thread_state(A).unwrap(), ThreadState::Stopped);
    // The exit value stays available
    assert_eq!(Sys::wait_for_thread_stop(A).unwrap(), 14);
    assert_eq!(Sys::run_thread(A), Err(RunThreadError::BadObjectState));

    start_thread::<SystemTraits>(1, double, 21, 2);
    assert_eq!(Sys::wait_for_thread_stop(A).unwrap(), 42);

    // Parameter and ID checks
    assert_eq!(
        Sys::init_thread(B, ThreadAttr::new(double, 0, 4, leak_stack())),
        Err(InitThreadError::BadParam)
    );
    assert_eq!(
        Sys::init_thread(OUT_OF_RANGE, ThreadAttr::new(double, 0, 2, leak_stack())),
        Err(InitThreadError::BadId)
    );
    assert_eq!(
        Sys::thread_state(OUT_OF_RANGE),
        Err(QueryThreadError::BadId)
    );
    assert_eq!(
        Sys::wait_for_thread_stop(NEVER_INITIALIZED),
        Err(WaitThreadError::BadObjectState)
    );
    assert_eq!(
        Sys::wait_for_thread_stop(SUPERVISOR),
        Err(WaitThreadError::BadContext)
    );

    // `exit_thread`
    start_thread::<SystemTraits>(2, exiting, 5, 2);
    assert_eq!(Sys::wait_for_thread_stop(B).unwrap(), 5);

    // Timed wait for a thread
    start_thread::<SystemTraits>(3, sleepy, 0, 2);
    assert_eq!(
        Sys::wait_for_thread_stop_or_timeout(C, 3),
        Err(WaitThreadTimeoutError::Timeout)
    );
    assert_eq!(Sys::thread_state(C).unwrap(), ThreadState::WaitForTick);
    assert_eq!(Sys::wait_for_thread_stop_or_timeout(C, 100).unwrap(), 1);

    // Raising a thread's priority above ours lets it preempt us at once
    start_thread::<SystemTraits>(1, mark_preempted, 0, 3);
    assert!(!PREEMPTED.load(Ordering::Relaxed));
    assert_eq!(
        Sys::set_thread_priority(A, 4),
        Err(SetPriorityError::BadParam)
    );
    Sys::set_thread_priority(A, 0).unwrap();
    assert!(PREEMPTED.load(Ordering::Relaxed));
    assert_eq!(Sys::thread_state(A).unwrap(), ThreadState::Stopped);
    assert_eq!(
        Sys::set_thread_priority(NEVER_INITIALIZED, 1),
        Err(SetPriorityError::BadObjectState)
    );

    // `delay(0)` yields to nobody here
    Sys::delay(0).unwrap();
    Sys::yield_now().unwrap();

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
