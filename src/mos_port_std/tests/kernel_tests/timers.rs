//! One-shot timers: expiration, re-arming by the callback, cancellation, and
//! `reset`
use mos_kernel::{Cfg, Semaphore, System, Timer, WaitTimeoutError};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(4, 1), startup_hook = startup);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static SEM: Semaphore<SystemTraits> = Semaphore::new(0);
static CALLS: AtomicU32 = AtomicU32::new(0);

/// Succeeds on the `attempts`-th call
static TIMER: Timer<SystemTraits> = Timer::new(|attempts| {
    let calls = CALLS.fetch_add(1, Ordering::Relaxed) + 1;
    if calls as usize >= attempts {
        SEM.increment();
        true
    } else {
        false
    }
});

fn startup() {
    start_thread::<SystemTraits>(0, body, 0, 1);
}

/// Wait for `SEM` and return the number of ticks it took.
fn measure(start: u64) -> u64 {
    SEM.wait().unwrap();
    Sys::now().unwrap() - start
}

fn body(_: usize) -> i32 {
    // Simple expiration
    Sys::delay(1).unwrap();
    let start = Sys::now().unwrap();
    TIMER.set(5, 1).unwrap();
    assert!(TIMER.is_set().unwrap());
    let elapsed = measure(start);
    assert!((5..=6).contains(&elapsed), "{elapsed}");
    assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    assert!(!TIMER.is_set().unwrap());

    // The callback declines three times, getting called on each of the
    // following ticks
    CALLS.store(0, Ordering::Relaxed);
    Sys::delay(1).unwrap();
    let start = Sys::now().unwrap();
    TIMER.set(5, 4).unwrap();
    let elapsed = measure(start);
    assert!((8..=9).contains(&elapsed), "{elapsed}");
    assert_eq!(CALLS.load(Ordering::Relaxed), 4);

    // Cancellation
    CALLS.store(0, Ordering::Relaxed);
    TIMER.set(3, 1).unwrap();
    TIMER.cancel().unwrap();
    assert!(!TIMER.is_set().unwrap());
    assert_eq!(SEM.wait_or_timeout(6), Err(WaitTimeoutError::Timeout));
    assert_eq!(CALLS.load(Ordering::Relaxed), 0);
    // Cancelling a disarmed timer is fine
    TIMER.cancel().unwrap();

    // `reset` restarts the countdown with the last interval
    Sys::delay(1).unwrap();
    let start = Sys::now().unwrap();
    TIMER.set(10, 1).unwrap();
    Sys::delay(5).unwrap();
    TIMER.reset().unwrap();
    let elapsed = measure(start);
    assert!((15..=16).contains(&elapsed), "{elapsed}");

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
