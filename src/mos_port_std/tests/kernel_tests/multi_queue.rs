//! Waiting on several queues bound to one signal
use mos_kernel::{
    wait_on_multi_queue, wait_on_multi_queue_or_timeout, Cfg, Queue, Signal, System, ThreadId,
    WaitTimeoutError,
};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(4, 2), startup_hook = startup);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static EVENTS: Signal<SystemTraits> = Signal::new();
static URGENT: Queue<SystemTraits, u32, 2> = Queue::new().with_signal(&EVENTS, 0);
static NORMAL: Queue<SystemTraits, u32, 4> = Queue::new().with_signal(&EVENTS, 1);

const CONSUMER: ThreadId = ThreadId::new(0);

fn startup() {
    start_thread::<SystemTraits>(0, consumer_body, 0, 1);
    start_thread::<SystemTraits>(1, producer_body, 0, 2);
}

fn producer_body(_: usize) -> i32 {
    // The consumer is sleeping. Fill both queues.
    NORMAL.send(10).unwrap();
    NORMAL.send(11).unwrap();
    URGENT.send(1).unwrap();
    URGENT.send(2).unwrap();

    assert_eq!(Sys::wait_for_thread_stop(CONSUMER).unwrap(), 4);

    // Sends from an interrupt handler wake up a blocked consumer
    start_thread::<SystemTraits>(0, isr_consumer_body, 0, 1);
    Sys::delay(2).unwrap();
    let accepted = mos_port_std::simulate_interrupt::<SystemTraits, _>(|| NORMAL.try_send(20));
    assert!(accepted);
    assert_eq!(Sys::wait_for_thread_stop(CONSUMER).unwrap(), 20);

    TEST_UTIL.success::<SystemTraits>();
}

fn receive(channel: u32) -> Option<u32> {
    match channel {
        0 => URGENT.try_receive(),
        1 => NORMAL.try_receive(),
        _ => unreachable!(),
    }
}

fn consumer_body(_: usize) -> i32 {
    Sys::delay(2).unwrap();

    // The lower channel is served first
    let mut pending = 0;
    let mut received = Vec::new();
    for _ in 0..4 {
        let channel = wait_on_multi_queue(&EVENTS, &mut pending).unwrap();
        received.push(receive(channel).unwrap());
    }
    assert_eq!(received, [1, 2, 10, 11]);

    assert!(URGENT.is_empty());
    assert!(NORMAL.is_empty());
    assert_eq!(
        wait_on_multi_queue_or_timeout(&EVENTS, &mut pending, 3),
        Err(WaitTimeoutError::Timeout)
    );

    received.len() as i32
}

fn isr_consumer_body(_: usize) -> i32 {
    let mut pending = 0;
    let channel = wait_on_multi_queue(&EVENTS, &mut pending).unwrap();
    assert_eq!(channel, 1);
    receive(channel).unwrap() as i32
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
