//! Tickless idle: the tick timer is programmed for the next timed event, and
//! long delays span several timer periods.
use mos_kernel::{Cfg, PortTimer, System, ThreadId};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(
    SystemTraits,
    Cfg::new(4, 3).stack_usage(true),
    startup_hook = startup,
);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static WOKEN_AT: [AtomicU64; 2] = [AtomicU64::new(0), AtomicU64::new(0)];

fn startup() {
    start_thread::<SystemTraits>(0, main_body, 0, 1);
}

fn sleeper_body(i: usize) -> i32 {
    Sys::delay([30, 10][i]).unwrap();
    WOKEN_AT[i].store(Sys::now().unwrap(), Ordering::Relaxed);
    0
}

fn main_body(_: usize) -> i32 {
    // A delay longer than the timer can count in one period
    let long = <SystemTraits as PortTimer>::MAX_TICK_INTERVAL * 2 + 100;
    let start = Sys::now().unwrap();
    Sys::delay(long).unwrap();
    let elapsed = Sys::now().unwrap() - start;
    assert!(
        (u64::from(long)..=u64::from(long) + 1).contains(&elapsed),
        "{elapsed}"
    );

    // Sleepers wake up in the order of their deadlines
    Sys::delay(1).unwrap();
    let start = Sys::now().unwrap();
    start_thread::<SystemTraits>(1, sleeper_body, 0, 2);
    start_thread::<SystemTraits>(2, sleeper_body, 1, 2);
    for id in [1, 2] {
        Sys::wait_for_thread_stop(ThreadId::new(id)).unwrap();
    }
    let woken_at = [
        WOKEN_AT[0].load(Ordering::Relaxed) - start,
        WOKEN_AT[1].load(Ordering::Relaxed) - start,
    ];
    assert!((30..=31).contains(&woken_at[0]), "{woken_at:?}");
    assert!((10..=11).contains(&woken_at[1]), "{woken_at:?}");

    // Nothing is scheduled, but a thread is running, so the tick count keeps
    // advancing
    for ticks in [10, 50, <SystemTraits as PortTimer>::MAX_TICK_INTERVAL + 7] {
        let start = Sys::now().unwrap();
        mos_port_std::consume_cycles::<SystemTraits>(mos_port_std::CYCLES_PER_TICK * ticks);
        let elapsed = Sys::now().unwrap() - start;
        assert!(
            (u64::from(ticks)..=u64::from(ticks) + 1).contains(&elapsed),
            "{ticks}: {elapsed}"
        );
    }

    // Stack usage measurement is enabled. The simulation doesn't run threads
    // on their stacks, so nothing is used.
    assert_eq!(Sys::max_stack_usage(ThreadId::new(1)).unwrap(), Some(0));

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
