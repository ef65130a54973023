//! A faulting thread is restarted with its stop handler.
use mos_kernel::{Cfg, Mutex, StopReason, System, ThreadId, STOP_FAULT};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(4, 2), startup_hook = startup);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static M: Mutex<SystemTraits> = Mutex::new();

const FAULTY: ThreadId = ThreadId::new(1);

fn startup() {
    start_thread::<SystemTraits>(0, supervisor_body, 0, 1);
}

fn faulty_body(_: usize) -> i32 {
    M.lock().unwrap();
    mos_port_std::simulate_fault::<SystemTraits>();
}

fn fault_handler(arg: usize) -> i32 {
    assert_eq!(Sys::current_stop_reason().unwrap(), Some(StopReason::Fault));
    assert!(M.is_owner().unwrap());
    M.restore().unwrap();
    arg as i32
}

fn supervisor_body(_: usize) -> i32 {
    assert_eq!(Sys::current_stop_reason().unwrap(), None);

    // The default stop handler
    start_thread::<SystemTraits>(1, faulty_body, 0, 2);
    assert_eq!(Sys::wait_for_thread_stop(FAULTY).unwrap(), STOP_FAULT);
    // Stopping releases the mutexes the thread still holds
    assert_eq!(M.owner().unwrap(), None);

    // A custom stop handler
    start_thread::<SystemTraits>(1, faulty_body, 0, 2);
    Sys::set_stop_handler(FAULTY, Some(fault_handler), 9).unwrap();
    assert_eq!(Sys::wait_for_thread_stop(FAULTY).unwrap(), 9);
    assert_eq!(M.owner().unwrap(), None);

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
