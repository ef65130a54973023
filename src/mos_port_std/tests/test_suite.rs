//! Runs scenario tests of the kernel on the simulation port. Each test case
//! instantiates its own system.
use mos_kernel::{KernelTraits, Priority, StackRegion, System, ThreadAttr, ThreadId};
use mos_port_std::PortInstance;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct TestUtil {
    is_successful: AtomicBool,
}

impl TestUtil {
    pub const fn new() -> Self {
        Self {
            is_successful: AtomicBool::new(false),
        }
    }

    /// Report success and shut down the system.
    pub fn success<Traits: PortInstance>(&self) -> ! {
        self.is_successful.store(true, Ordering::Relaxed);
        mos_port_std::shutdown::<Traits>();
    }

    /// Boot the system and wait until it calls `success`.
    pub fn run<Traits: PortInstance>(&self) {
        let _ = env_logger::try_init();

        mos_port_std::boot::<Traits>();

        assert!(
            self.is_successful.load(Ordering::Relaxed),
            "the system shut down without calling `success`"
        );
    }
}

/// Allocate a stack region. The simulation port doesn't run threads on it,
/// but the kernel requires one.
pub fn leak_stack() -> StackRegion {
    let stack: &'static mut [u8] = Box::leak(vec![0u8; 512].into_boxed_slice());
    // Safety: The region is leaked, so it's valid for `'static` and unused by
    //         anything else
    unsafe { StackRegion::from_raw_parts(stack.as_mut_ptr(), stack.len()) }
}

/// Initialize and start a thread.
pub fn start_thread<Traits: KernelTraits>(
    id: usize,
    entry: fn(usize) -> i32,
    arg: usize,
    priority: Priority,
) {
    let attr = ThreadAttr::new(entry, arg, priority, leak_stack());
    System::<Traits>::init_thread(ThreadId::new(id), attr).unwrap();
    System::<Traits>::run_thread(ThreadId::new(id)).unwrap();
}

mod kernel_tests {
    pub mod kill_restore;
    pub mod lifecycle;
    pub mod multi_queue;
    pub mod mutex_recursion;
    pub mod priority_inheritance;
    pub mod producer_consumer;
    pub mod queue_fifo;
    pub mod round_robin;
    pub mod starvation;
    pub mod thread_fault;
    pub mod tickless;
    pub mod timeout_race;
    pub mod timers;
    pub mod transitive_inheritance;
}
