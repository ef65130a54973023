//! Static configuration mechanism for the kernel
use crate::utils::PRIO_BITMAP_MAX_LEN;

/// The static configuration of a kernel instance, consumed by [`build!`].
///
/// [`build!`]: crate::build
#[derive(Debug, Clone, Copy)]
pub struct Cfg {
    pub num_priorities: usize,
    pub num_threads: usize,
    pub ticks_per_second: u32,
    pub tickless_idle: bool,
    pub stack_usage: bool,
}

impl Cfg {
    /// Construct a `Cfg` with the default values of the optional items.
    pub const fn new(num_priorities: usize, num_threads: usize) -> Self {
        assert!(
            num_priorities >= 1 && num_priorities <= PRIO_BITMAP_MAX_LEN,
            "`num_priorities` must be in range `1..=32`"
        );
        Self {
            num_priorities,
            num_threads,
            ticks_per_second: 1000,
            tickless_idle: true,
            stack_usage: false,
        }
    }

    pub const fn ticks_per_second(self, ticks_per_second: u32) -> Self {
        assert!(ticks_per_second > 0, "`ticks_per_second` must be nonzero");
        Self {
            ticks_per_second,
            ..self
        }
    }

    /// Keep the tick timer stopped while the system is idle and nothing needs a
    /// timed wakeup. Idle time spent that way isn't counted. When disabled, the
    /// timer keeps running at the port's maximum interval so that the tick
    /// count advances through idle time too.
    pub const fn tickless_idle(self, tickless_idle: bool) -> Self {
        Self {
            tickless_idle,
            ..self
        }
    }

    /// Paint stacks at `init_thread` so that `max_stack_usage` can report a
    /// high-water mark.
    pub const fn stack_usage(self, stack_usage: bool) -> Self {
        Self {
            stack_usage,
            ..self
        }
    }
}

/// Instantiate the kernel state and the thread control blocks for a system
/// type by implementing [`KernelCfg`].
///
/// ```rust,ignore
/// struct SystemTraits;
/// mos_port_std::use_port!(unsafe struct SystemTraits);
/// mos_kernel::build!(
///     SystemTraits,
///     Cfg::new(8, 4).ticks_per_second(100),
///     startup_hook = startup,
/// );
/// ```
///
/// [`KernelCfg`]: crate::KernelCfg
#[macro_export]
macro_rules! build {
    ($sys:ty, $cfg:expr, startup_hook = $startup_hook:path $(,)?) => {
        const _: () = {
            use $crate::{Cfg, KernelCfg, State, ThreadCb};

            const CFG: Cfg = $cfg;

            static STATE: State<$sys> = State::new();
            static THREADS: [ThreadCb<$sys>; CFG.num_threads] =
                [const { ThreadCb::new() }; CFG.num_threads];

            // Safety: We are `build!`
            unsafe impl KernelCfg for $sys {
                const NUM_PRIORITIES: usize = CFG.num_priorities;
                const TICKS_PER_SECOND: u32 = CFG.ticks_per_second;
                const TICKLESS_IDLE: bool = CFG.tickless_idle;
                const STACK_USAGE: bool = CFG.stack_usage;

                #[inline(always)]
                fn state() -> &'static State<Self> {
                    &STATE
                }

                #[inline(always)]
                fn thread_cb_pool() -> &'static [ThreadCb<Self>] {
                    &THREADS
                }

                fn startup_hook() {
                    $startup_hook()
                }
            }
        };
    };
}
