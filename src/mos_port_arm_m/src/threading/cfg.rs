use mos_kernel::ThreadId;

/// The configuration of the port.
pub trait ThreadingOptions {
    /// The priority value to which CPU Lock boosts the current execution
    /// priority. Must be in range `0..256`. Defaults to `0` when unspecified.
    ///
    /// If this is `0`, CPU Lock disables all interrupts by setting `PRIMASK`.
    /// Otherwise, it sets `BASEPRI` to this value, and interrupts with a
    /// higher priority (a lower value) keep running. Such interrupts must not
    /// call kernel functions other than ISR-safe ones.
    ///
    /// Must be `0` on Armv6-M and Armv8-M Baseline because they don't support
    /// `BASEPRI`.
    const CPU_LOCK_PRIORITY_MASK: u8 = 0;

    /// Enables the use of the `wfi` instruction in the idle loop to save power.
    /// Defaults to `true`.
    const USE_WFI: bool = true;

    /// Enables lazy stacking of the floating-point context (`FPCCR.LSPEN`).
    /// Defaults to `true`. Ignored if the target doesn't have an FPU.
    ///
    /// The context switch routine saves the floating-point registers only for
    /// threads that have used the FPU either way.
    const LAZY_FP_CONTEXT: bool = true;

    /// The hook called on every context switch for the management of TrustZone
    /// secure contexts. Defaults to `None`.
    const SECURE_CONTEXT_HOOK: Option<&'static dyn SecureContextHook> = None;

    /// Get the top of the interrupt stack. Defaults to
    /// `*(SCB.VTOR as *const u32)`.
    ///
    /// # Safety
    ///
    /// This only can be called by the port.
    unsafe fn interrupt_stack_top() -> usize {
        #[cfg(target_os = "none")]
        {
            // Safety: We claimed the ownership of `Peripherals`
            let peripherals = unsafe { cortex_m::Peripherals::steal() };

            // Safety: `unsafe trait`
            unsafe { (peripherals.SCB.vtor.read() as *const usize).read_volatile() }
        }

        #[cfg(not(target_os = "none"))]
        panic!("unsupported target")
    }
}

/// Called by the dispatcher whenever the running thread changes, with CPU Lock
/// active. `None` represents the idle context.
///
/// An implementation would save and load the secure context of the outgoing
/// and incoming threads, e.g., through the Armv8-M secure context management
/// API.
pub trait SecureContextHook: Sync {
    fn switch_context(&self, from: Option<ThreadId>, to: Option<ThreadId>);
}

/// Instantiate the port.
///
/// This macro doesn't provide an implementation of `PortTimer`, which you
/// must supply through other ways, e.g., [`use_systick_tickless!`].
///
/// # Safety
///
///  - The target must really be a bare-metal Arm-M environment.
///  - You shouldn't interfere with the port's operations. For example, you
///    shouldn't manually modify `PRIMASK`, `BASEPRI`, or `CONTROL`.
///  - `<$SystemTraits as `[`ThreadingOptions`]`>::`[`interrupt_stack_top`]
///    must return a valid stack pointer.
///
/// [`interrupt_stack_top`]: ThreadingOptions::interrupt_stack_top
/// [`use_systick_tickless!`]: crate::use_systick_tickless
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_arm_m_impl {
            use super::$SystemTraits;
            use $crate::mos_kernel::{PortAtomic, PortThreading, ThreadCb};
            use $crate::threading::imp::{self, PortInstance, ThreadContext};

            // Assume `$SystemTraits: KernelTraits + ThreadingOptions`
            unsafe impl PortInstance for $SystemTraits {}

            unsafe impl PortThreading for $SystemTraits {
                type PortThreadState = ThreadContext;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_THREAD_STATE_INIT: Self::PortThreadState = ThreadContext::new();

                unsafe fn dispatch_first_thread() -> ! {
                    unsafe { imp::dispatch_first_thread::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { imp::yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(thread: &'static ThreadCb<Self>) -> ! {
                    unsafe { imp::exit_and_dispatch::<Self>(thread) }
                }

                #[inline(always)]
                unsafe fn enter_cpu_lock() {
                    unsafe { imp::enter_cpu_lock::<Self>() }
                }

                #[inline(always)]
                unsafe fn leave_cpu_lock() {
                    unsafe { imp::leave_cpu_lock::<Self>() }
                }

                unsafe fn initialize_thread_state(thread: &'static ThreadCb<Self>) {
                    unsafe { imp::initialize_thread_state::<Self>(thread) }
                }

                #[inline(always)]
                fn is_cpu_lock_active() -> bool {
                    imp::is_cpu_lock_active::<Self>()
                }

                fn is_thread_context() -> bool {
                    imp::is_thread_context::<Self>()
                }

                fn is_interrupt_context() -> bool {
                    imp::is_interrupt_context::<Self>()
                }
            }

            unsafe impl PortAtomic for $SystemTraits {
                type IrqLockState = bool;

                #[inline(always)]
                unsafe fn enter_irq_lock() -> bool {
                    unsafe { imp::enter_irq_lock() }
                }

                #[inline(always)]
                unsafe fn leave_irq_lock(was_enabled: bool) {
                    unsafe { imp::leave_irq_lock(was_enabled) }
                }
            }
        }

        const _: () = $crate::threading::imp::validate::<$SystemTraits>();

        #[$crate::cortex_m_rt::entry]
        fn main() -> ! {
            // Register the context switch routine as the PendSV handler,
            // overriding `cortex_m_rt`'s default
            unsafe {
                ::core::arch::asm!(
                    "
                        .global PendSV
                        PendSV = {}
                    ",
                    sym $crate::threading::imp::handle_pend_sv::<$SystemTraits>,
                );
            }

            unsafe { $crate::threading::imp::port_boot::<$SystemTraits>() }
        }
    };
}
