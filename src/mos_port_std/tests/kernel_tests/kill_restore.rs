//! Killing threads: the stop handler runs in place of the thread, can release
//! the mutexes the thread left behind, and its return value becomes the exit
//! value.
use mos_kernel::{
    Cfg, KillThreadError, Mutex, Semaphore, StopReason, System, ThreadId, ThreadState,
    STOP_KILLED,
};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(8, 3), startup_hook = startup);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static M: Mutex<SystemTraits> = Mutex::new();
static NEVER: Semaphore<SystemTraits> = Semaphore::new(0);

const HOLDER: ThreadId = ThreadId::new(1);
const SUICIDAL: ThreadId = ThreadId::new(2);

fn startup() {
    start_thread::<SystemTraits>(0, supervisor_body, 0, 2);
    start_thread::<SystemTraits>(1, holder_body, 0, 3);
    Sys::set_stop_handler(HOLDER, Some(holder_stop_handler), 77).unwrap();
}

fn holder_body(_: usize) -> i32 {
    M.lock().unwrap();
    // Block forever while holding the mutex
    NEVER.wait().unwrap();
    unreachable!()
}

fn holder_stop_handler(arg: usize) -> i32 {
    assert_eq!(Sys::current_stop_reason().unwrap(), Some(StopReason::Killed));
    assert!(M.is_owner().unwrap());
    M.restore().unwrap();
    // A second `restore` finds nothing to release
    M.restore().unwrap();
    arg as i32
}

fn increment_stop_handler(arg: usize) -> i32 {
    arg as i32 + 1
}

fn suicidal_body(_: usize) -> i32 {
    Sys::kill_thread(SUICIDAL).unwrap();
    unreachable!()
}

fn supervisor_body(_: usize) -> i32 {
    Sys::delay(1).unwrap();

    // `holder` is waiting on `NEVER` with the mutex held
    assert_eq!(Sys::thread_state(HOLDER).unwrap(), ThreadState::WaitForSem);
    assert_eq!(M.owner().unwrap(), Some(HOLDER));

    Sys::kill_thread(HOLDER).unwrap();
    assert_eq!(Sys::wait_for_thread_stop(HOLDER).unwrap(), 77);
    assert_eq!(M.owner().unwrap(), None);
    assert_eq!(Sys::thread_state(HOLDER).unwrap(), ThreadState::Stopped);

    // Can't kill a stopped thread
    assert_eq!(
        Sys::kill_thread(HOLDER),
        Err(KillThreadError::BadObjectState)
    );

    // A thread killing itself runs the default stop handler
    start_thread::<SystemTraits>(2, suicidal_body, 0, 4);
    assert_eq!(Sys::wait_for_thread_stop(SUICIDAL).unwrap(), STOP_KILLED);

    // Killed while runnable but not running
    start_thread::<SystemTraits>(2, suicidal_body, 0, 4);
    assert_eq!(Sys::thread_state(SUICIDAL).unwrap(), ThreadState::Runnable);
    Sys::set_stop_handler(SUICIDAL, Some(increment_stop_handler), 41).unwrap();
    Sys::kill_thread(SUICIDAL).unwrap();
    assert_eq!(Sys::wait_for_thread_stop(SUICIDAL).unwrap(), 42);

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
