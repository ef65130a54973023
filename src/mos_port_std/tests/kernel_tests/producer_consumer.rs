//! Two producers post a semaphore periodically for a while. The consumer sees
//! every post.
use mos_kernel::{Cfg, Semaphore, System, ThreadId};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(4, 4), startup_hook = startup);

type Sys = System<SystemTraits>;

const INITIAL: u32 = 5;
const PERIOD: u32 = 50;
const DURATION: u32 = 5000;

static TEST_UTIL: TestUtil = TestUtil::new();
static SEM: Semaphore<SystemTraits> = Semaphore::new(INITIAL);
static STOP: AtomicBool = AtomicBool::new(false);
static PRODUCED: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];

const PRODUCERS: [ThreadId; 2] = [ThreadId::new(1), ThreadId::new(2)];
const CONSUMER: ThreadId = ThreadId::new(3);

fn startup() {
    start_thread::<SystemTraits>(0, supervisor_body, 0, 0);
    start_thread::<SystemTraits>(1, producer_body, 0, 2);
    start_thread::<SystemTraits>(2, producer_body, 1, 2);
    start_thread::<SystemTraits>(3, consumer_body, 0, 1);
}

fn producer_body(i: usize) -> i32 {
    loop {
        Sys::delay(PERIOD).unwrap();
        if STOP.load(Ordering::Relaxed) {
            return 0;
        }
        SEM.increment();
        PRODUCED[i].fetch_add(1, Ordering::Relaxed);
    }
}

fn consumer_body(_: usize) -> i32 {
    let mut consumed = 0;
    loop {
        SEM.wait().unwrap();
        consumed += 1;
        if STOP.load(Ordering::Relaxed) {
            return consumed;
        }
    }
}

fn supervisor_body(_: usize) -> i32 {
    Sys::delay(DURATION).unwrap();
    STOP.store(true, Ordering::Relaxed);

    for id in PRODUCERS {
        assert_eq!(Sys::wait_for_thread_stop(id).unwrap(), 0);
    }

    // Wake up the consumer for the last time
    SEM.increment();
    let consumed = Sys::wait_for_thread_stop(CONSUMER).unwrap() as u32;

    let produced = [
        PRODUCED[0].load(Ordering::Relaxed),
        PRODUCED[1].load(Ordering::Relaxed),
    ];
    log::debug!("produced = {produced:?}, consumed = {consumed}");

    assert!(produced.iter().all(|&n| n > DURATION / PERIOD - 10), "{produced:?}");
    assert_eq!(consumed, produced[0] + produced[1] + INITIAL + 1);
    assert_eq!(SEM.value(), 0);

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
