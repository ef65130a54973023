//! A low-priority mutex owner inherits the priority of a high-priority waiter,
//! so a CPU-bound medium-priority thread can't delay the latter indefinitely.
//! Every thread is back at its nominal priority once the mutex is released.
use mos_kernel::{Cfg, Mutex, System, ThreadId};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(
    SystemTraits,
    Cfg::new(8, 3),
    startup_hook = startup,
);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static M: Mutex<SystemTraits> = Mutex::new();
static MID_RAN: AtomicBool = AtomicBool::new(false);
static STOP: AtomicBool = AtomicBool::new(false);

const LOW: ThreadId = ThreadId::new(0);
const HIGH: ThreadId = ThreadId::new(1);
const MID: ThreadId = ThreadId::new(2);

fn assert_nominal_priorities() {
    assert_eq!(Sys::thread_priority(LOW).unwrap(), (5, 5));
    assert_eq!(Sys::thread_priority(HIGH).unwrap(), (1, 1));
    assert_eq!(Sys::thread_priority(MID).unwrap(), (3, 3));
}

fn startup() {
    start_thread::<SystemTraits>(0, low_body, 0, 5);
    start_thread::<SystemTraits>(1, high_body, 0, 1);
    start_thread::<SystemTraits>(2, mid_body, 0, 3);
}

fn low_body(_: usize) -> i32 {
    M.lock().unwrap();
    assert_eq!(M.owner().unwrap(), Some(LOW));

    // Hold the mutex long enough for `high` and `mid` to wake up
    while Sys::now().unwrap() < 10 {
        mos_port_std::consume_cycles::<SystemTraits>(10);
    }

    assert_eq!(Sys::thread_priority(LOW).unwrap(), (1, 5));
    assert!(!MID_RAN.load(Ordering::Relaxed));

    M.unlock().unwrap();
    0
}

fn high_body(_: usize) -> i32 {
    Sys::delay(2).unwrap();

    M.lock().unwrap();
    assert!(M.is_owner().unwrap());
    assert!(!MID_RAN.load(Ordering::Relaxed));
    // The inherited priority is gone
    assert_nominal_priorities();
    M.unlock().unwrap();
    assert_nominal_priorities();

    // `mid` gets the processor now, and hogs it
    Sys::delay(1).unwrap();
    assert!(MID_RAN.load(Ordering::Relaxed));
    assert_nominal_priorities();
    STOP.store(true, Ordering::Relaxed);

    TEST_UTIL.success::<SystemTraits>();
}

fn mid_body(_: usize) -> i32 {
    Sys::delay(3).unwrap();
    MID_RAN.store(true, Ordering::Relaxed);

    // Bounded so that a missing priority boost fails the assertions in `low`
    // instead of hanging
    while !STOP.load(Ordering::Relaxed) && Sys::now().unwrap() < 50 {
        mos_port_std::consume_cycles::<SystemTraits>(10);
    }
    0
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
