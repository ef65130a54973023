//! Recursive locking, and mutex ownership as seen by other threads
use mos_kernel::{Cfg, Mutex, System, ThreadId, TryLockMutexError, WaitTimeoutError};

use crate::{start_thread, TestUtil};

mos_port_std::use_port!(unsafe struct SystemTraits);
mos_kernel::build!(SystemTraits, Cfg::new(4, 2), startup_hook = startup);

type Sys = System<SystemTraits>;

static TEST_UTIL: TestUtil = TestUtil::new();
static M: Mutex<SystemTraits> = Mutex::new();

const OWNER: ThreadId = ThreadId::new(0);
const OTHER: ThreadId = ThreadId::new(1);

fn startup() {
    start_thread::<SystemTraits>(0, owner_body, 0, 1);
    start_thread::<SystemTraits>(1, other_body, 0, 2);
}

fn owner_body(_: usize) -> i32 {
    assert_eq!(M.owner().unwrap(), None);
    assert_eq!(M.depth().unwrap(), 0);

    M.lock().unwrap();
    M.lock().unwrap();
    M.try_lock().unwrap();
    assert_eq!(M.depth().unwrap(), 3);
    assert_eq!(M.owner().unwrap(), Some(OWNER));
    assert!(M.is_owner().unwrap());

    // Let `other` observe the mutex
    Sys::delay(5).unwrap();

    M.unlock().unwrap();
    M.unlock().unwrap();
    assert_eq!(M.depth().unwrap(), 1);
    assert_eq!(M.owner().unwrap(), Some(OWNER));

    // Releasing the last level hands the mutex over to `other`, which has a
    // lower priority, so we keep running
    M.unlock().unwrap();
    assert_eq!(M.owner().unwrap(), Some(OTHER));
    assert_eq!(M.depth().unwrap(), 1);
    assert!(!M.is_owner().unwrap());

    // `restore` is a no-op for a non-owner
    M.restore().unwrap();
    assert_eq!(M.owner().unwrap(), Some(OTHER));

    assert_eq!(Sys::wait_for_thread_stop(OTHER).unwrap(), 0);
    assert_eq!(M.owner().unwrap(), None);

    TEST_UTIL.success::<SystemTraits>();
}

fn other_body(_: usize) -> i32 {
    assert_eq!(M.owner().unwrap(), Some(OWNER));
    assert_eq!(M.try_lock(), Err(TryLockMutexError::WouldBlock));
    assert_eq!(M.lock_or_timeout(2), Err(WaitTimeoutError::Timeout));

    M.lock().unwrap();
    assert!(M.is_owner().unwrap());
    M.unlock().unwrap();
    0
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>();
}
