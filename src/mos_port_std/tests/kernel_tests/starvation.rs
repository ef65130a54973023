//! A lower-priority thread gets no processor time while a higher-priority
//! thread stays runnable, and runs as soon as the latter blocks.
use mos_kernel::{Cfg, System};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(
    SystemTraits,
    Cfg::new(4, 2),
    startup_hook = startup,
);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static LO_COUNT: AtomicU32 = AtomicU32::new(0);

const BUSY_TICKS: u64 = 50;

fn startup() {
    start_thread::<SystemTraits>(0, hi_body, 0, 1);
    start_thread::<SystemTraits>(1, lo_body, 0, 2);
}

fn hi_body(_: usize) -> i32 {
    let start = Sys::now().unwrap();
    while Sys::now().unwrap() < start + BUSY_TICKS {
        mos_port_std::consume_cycles::<SystemTraits>(10);
        assert_eq!(LO_COUNT.load(Ordering::Relaxed), 0);
    }

    // Let the low-priority thread run
    Sys::delay(5).unwrap();
    assert_ne!(LO_COUNT.load(Ordering::Relaxed), 0);

    TEST_UTIL.success::<SystemTraits>();
}

fn lo_body(_: usize) -> i32 {
    loop {
        LO_COUNT.fetch_add(1, Ordering::Relaxed);
        mos_port_std::consume_cycles::<SystemTraits>(10);
    }
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
