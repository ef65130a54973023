//! A post that arrives in the same tick as the waiter's timeout wins, no
//! matter which of them was scheduled first.
use mos_kernel::{Cfg, Semaphore, System, Timer, WaitTimeoutError};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(4, 2), startup_hook = startup);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static SEM: Semaphore<SystemTraits> = Semaphore::new(0);
static ARM: Semaphore<SystemTraits> = Semaphore::new(0);
static TIMER: Timer<SystemTraits> = Timer::new(post);
static INTERVAL: AtomicU32 = AtomicU32::new(0);

fn startup() {
    start_thread::<SystemTraits>(0, waiter_body, 0, 1);
    start_thread::<SystemTraits>(1, helper_body, 0, 2);
}

fn post(_: usize) -> bool {
    SEM.increment();
    true
}

fn waiter_body(_: usize) -> i32 {
    for ticks in 1..=8 {
        // The timer is set before the wait begins
        Sys::delay(1).unwrap();
        TIMER.set(ticks, 0).unwrap();
        assert_eq!(SEM.wait_or_timeout(ticks), Ok(()), "ticks = {ticks}");

        // The timer is set after the wait begins, by `helper`, which runs
        // when we block
        Sys::delay(1).unwrap();
        INTERVAL.store(ticks, Ordering::Relaxed);
        ARM.increment();
        assert_eq!(SEM.wait_or_timeout(ticks), Ok(()), "ticks = {ticks}");
    }

    // Without a post, the wait times out
    Sys::delay(1).unwrap();
    let start = Sys::now().unwrap();
    assert_eq!(SEM.wait_or_timeout(5), Err(WaitTimeoutError::Timeout));
    let elapsed = Sys::now().unwrap() - start;
    assert!((5..=6).contains(&elapsed), "{elapsed}");

    TEST_UTIL.success::<SystemTraits>();
}

fn helper_body(_: usize) -> i32 {
    loop {
        ARM.wait().unwrap();
        TIMER.set(INTERVAL.load(Ordering::Relaxed), 0).unwrap();
    }
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
