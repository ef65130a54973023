/// The configuration for the implementation of `PortTimer` based on SysTick
/// ([tickless]).
///
/// [tickless]: crate::use_systick_tickless
pub trait SysTickOptions {
    /// The input clock frequency of SysTick, measured in hertz.
    const FREQUENCY: u64;

    /// The interrupt priority of SysTick. Defaults to `0xc0`.
    ///
    /// Must not be higher (numerically lower) than
    /// [`ThreadingOptions::CPU_LOCK_PRIORITY_MASK`] when that is non-zero.
    ///
    /// [`ThreadingOptions::CPU_LOCK_PRIORITY_MASK`]: crate::ThreadingOptions::CPU_LOCK_PRIORITY_MASK
    const INTERRUPT_PRIORITY: u8 = 0xc0;

    /// The minimum number of cycles between reading the counter and the end
    /// of the period in which the timer may still be reprogrammed. Defaults to
    /// `256`. Must be shorter than a tick.
    const HEADROOM: u32 = 256;
}

/// Attach the tickless implementation of `PortTimer` that is based on SysTick
/// to a given system type.
///
/// The tick period is `FREQUENCY / TICKS_PER_SECOND` cycles. SysTick is
/// reprogrammed for the next timed event, so a long delay only takes a few
/// interrupts. If the kernel is configured with tickless idle, SysTick is
/// stopped while the system is idle and nothing waits for time.
///
/// You should also do the following:
///
///  - Implement [`SysTickOptions`] manually.
///  - Call `$Traits::configure_systick()` in your startup hook.
///
/// ```rust,ignore
/// mos_port_arm_m::use_systick_tickless!(unsafe impl PortTimer for SystemTraits);
///
/// impl mos_port_arm_m::SysTickOptions for SystemTraits {
///    // SysTick = AHB, AHB = HSI (internal 16-MHz RC oscillator)
///     const FREQUENCY: u64 = 16_000_000;
/// }
///
/// fn startup() {
///     SystemTraits::configure_systick();
///     /* ... */
/// }
/// ```
///
/// # Safety
///
///  - The target must really be a bare-metal Arm-M environment.
///  - SysTick must be clocked by the processor clock.
///  - Nothing else may use SysTick.
#[macro_export]
macro_rules! use_systick_tickless {
    (unsafe impl PortTimer for $Traits:ty) => {
        const _: () = {
            use ::core::num::NonZeroU32;
            use $crate::mos_kernel::{KernelCfg, PortTimer};
            use $crate::mos_portkit::tickless::TicklessCfg;
            use $crate::systick_tickless::imp;

            static TIMER_STATE: imp::State = imp::State::new();

            impl PortTimer for $Traits {
                const MAX_TICK_INTERVAL: u32 =
                    <$Traits as imp::SysTickTicklessInstance>::CFG.max_tick_interval();

                unsafe fn elapsed_ticks() -> u32 {
                    // Safety: CPU Lock active
                    unsafe { TIMER_STATE.elapsed_ticks::<Self>() }
                }

                unsafe fn set_tick_interval(interval: Option<NonZeroU32>) -> u32 {
                    // Safety: CPU Lock active
                    unsafe { TIMER_STATE.set_tick_interval::<Self>(interval) }
                }
            }

            // Safety: Only `use_systick_tickless!` is allowed to `impl` this
            unsafe impl imp::SysTickTicklessInstance for $Traits {
                const CFG: TicklessCfg = TicklessCfg::new(
                    <$Traits as $crate::SysTickOptions>::FREQUENCY,
                    <$Traits as KernelCfg>::TICKS_PER_SECOND,
                    imp::MAX_RELOAD,
                    <$Traits as $crate::SysTickOptions>::HEADROOM,
                );
            }

            impl $Traits {
                /// Configure SysTick. Call this in the startup hook.
                pub fn configure_systick() {
                    imp::init::<Self>();
                }
            }

            const _: () = imp::validate::<$Traits>();
        };

        // Register the handler, overriding `cortex_m_rt`'s default
        ::core::arch::global_asm!(
            "
                .global SysTick
                SysTick = {}
            ",
            sym $crate::systick_tickless::imp::handle_tick::<$Traits>,
        );
    };
}
