//! Message queues deliver items in FIFO order, reject items when full in an
//! interrupt context, and block senders and receivers in a thread context.
use mos_kernel::{Cfg, Queue, System, ThreadId, WaitTimeoutError};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(4, 2), startup_hook = startup);

type Sys = System<SystemTraits>;

const CAPACITY: usize = 4;

static TEST_UTIL: TestUtil = TestUtil::new();
static Q: Queue<SystemTraits, u32, CAPACITY> = Queue::new();

const CONSUMER: ThreadId = ThreadId::new(1);

fn startup() {
    start_thread::<SystemTraits>(0, producer_body, 0, 1);
}

fn producer_body(_: usize) -> i32 {
    assert_eq!(Q.capacity(), CAPACITY);
    assert!(Q.is_empty());

    // Fill the queue from an interrupt handler. The last item doesn't fit.
    let accepted = mos_port_std::simulate_interrupt::<SystemTraits, _>(|| {
        (0..=CAPACITY as u32)
            .map(|i| Q.try_send(i))
            .collect::<Vec<_>>()
    });
    assert_eq!(accepted, [true, true, true, true, false]);
    assert_eq!(Q.len(), CAPACITY);
    assert_eq!(Q.send_or_timeout(99, 3), Err(WaitTimeoutError::Timeout));

    let received = mos_port_std::simulate_interrupt::<SystemTraits, _>(|| {
        std::iter::from_fn(|| Q.try_receive()).collect::<Vec<_>>()
    });
    assert_eq!(received, [0, 1, 2, 3]);
    assert!(Q.is_empty());
    assert_eq!(Q.receive_or_timeout(3), Err(WaitTimeoutError::Timeout));

    // Blocking transfer between threads. The consumer has a lower priority,
    // so the producer blocks when the queue is full.
    crate::start_thread::<SystemTraits>(1, consumer_body, 0, 2);
    for i in 0..20 {
        Q.send(i).unwrap();
    }

    assert_eq!(Sys::wait_for_thread_stop(CONSUMER).unwrap(), 20);
    TEST_UTIL.success::<SystemTraits>();
}

fn consumer_body(_: usize) -> i32 {
    for i in 0..20 {
        assert_eq!(Q.receive().unwrap(), i);
    }
    assert!(Q.try_receive().is_none());
    20
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
