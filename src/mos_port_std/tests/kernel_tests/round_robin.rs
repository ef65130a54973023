//! Threads of the same priority share the processor in tick-sized slices.
use mos_kernel::{Cfg, System};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(4, 3), startup_hook = startup);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static COUNTS: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];

fn startup() {
    start_thread::<SystemTraits>(0, supervisor_body, 0, 1);
    start_thread::<SystemTraits>(1, worker_body, 0, 2);
    start_thread::<SystemTraits>(2, worker_body, 1, 2);
}

fn worker_body(i: usize) -> i32 {
    loop {
        mos_port_std::consume_cycles::<SystemTraits>(10);
        COUNTS[i].fetch_add(1, Ordering::Relaxed);
    }
}

fn supervisor_body(_: usize) -> i32 {
    let start = Sys::now().unwrap();
    Sys::delay(100).unwrap();
    let elapsed = u32::try_from(Sys::now().unwrap() - start).unwrap();

    let counts = [
        COUNTS[0].load(Ordering::Relaxed),
        COUNTS[1].load(Ordering::Relaxed),
    ];
    log::debug!("elapsed = {elapsed}, counts = {counts:?}");

    // Each worker gets half of the slices, give or take one
    let per_slice = mos_port_std::CYCLES_PER_TICK / 10;
    let fair_share = elapsed * per_slice / 2;
    for count in counts {
        assert!(count.abs_diff(fair_share) <= per_slice, "{counts:?}");
    }
    assert!(counts[0].abs_diff(counts[1]) <= per_slice, "{counts:?}");

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
