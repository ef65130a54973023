//! Priority inheritance propagates along a chain of mutex owners.
use mos_kernel::{Cfg, Mutex, System, ThreadId};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(
    SystemTraits,
    Cfg::new(8, 4),
    startup_hook = startup,
);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static M1: Mutex<SystemTraits> = Mutex::new();
static M2: Mutex<SystemTraits> = Mutex::new();
static D_RAN: AtomicBool = AtomicBool::new(false);

const A: ThreadId = ThreadId::new(0);
const B: ThreadId = ThreadId::new(1);
const C: ThreadId = ThreadId::new(2);

fn startup() {
    start_thread::<SystemTraits>(0, a_body, 0, 6);
    start_thread::<SystemTraits>(1, b_body, 0, 4);
    start_thread::<SystemTraits>(2, c_body, 0, 1);
    start_thread::<SystemTraits>(3, d_body, 0, 3);
}

fn a_body(_: usize) -> i32 {
    M1.lock().unwrap();

    while Sys::now().unwrap() < 10 {
        mos_port_std::consume_cycles::<SystemTraits>(10);
    }

    // `C` waits for `B`, which waits for `A`
    assert_eq!(Sys::thread_priority(A).unwrap(), (1, 6));
    assert_eq!(Sys::thread_priority(B).unwrap(), (1, 4));
    assert!(!D_RAN.load(Ordering::Relaxed));

    M1.unlock().unwrap();
    0
}

fn b_body(_: usize) -> i32 {
    Sys::delay(1).unwrap();
    M2.lock().unwrap();
    M1.lock().unwrap();

    assert_eq!(Sys::thread_priority(A).unwrap(), (6, 6));
    assert_eq!(Sys::thread_priority(B).unwrap(), (1, 4));
    assert!(!D_RAN.load(Ordering::Relaxed));

    M1.unlock().unwrap();
    M2.unlock().unwrap();
    0
}

fn c_body(_: usize) -> i32 {
    Sys::delay(2).unwrap();
    M2.lock().unwrap();

    assert_eq!(Sys::thread_priority(B).unwrap(), (4, 4));
    assert!(!D_RAN.load(Ordering::Relaxed));
    M2.unlock().unwrap();

    Sys::delay(1).unwrap();
    assert!(D_RAN.load(Ordering::Relaxed));

    TEST_UTIL.success::<SystemTraits>();
}

fn d_body(_: usize) -> i32 {
    Sys::delay(3).unwrap();
    D_RAN.store(true, Ordering::Relaxed);
    0
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
