//! The tickless `PortTimer` implementation based on SysTick.
use core::{cell::UnsafeCell, num::NonZeroU32};
use cortex_m::peripheral::{scb::SystemHandler, syst::SystClkSource, SCB, SYST};
use mos_kernel::{KernelTraits, PortToKernel};
use mos_portkit::tickless::{ReloadTimer, TicklessCfg, TicklessState};

use crate::{SysTickOptions, ThreadingOptions};

/// SysTick's counter is 24 bits wide.
pub const MAX_RELOAD: u32 = 0xff_ffff;

const CSR_ENABLE: u32 = 1 << 0;
const CSR_TICKINT: u32 = 1 << 1;
const CSR_COUNTFLAG: u32 = 1 << 16;

/// Implemented on a system type by [`use_systick_tickless!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_systick_tickless!`].
///
/// [`use_systick_tickless!`]: crate::use_systick_tickless
pub unsafe trait SysTickTicklessInstance: KernelTraits + SysTickOptions + ThreadingOptions {
    const CFG: TicklessCfg;
}

/// Used by `use_systick_tickless!`
pub const fn validate<Traits: SysTickTicklessInstance>() {
    if Traits::CPU_LOCK_PRIORITY_MASK > 0
        && Traits::INTERRUPT_PRIORITY < Traits::CPU_LOCK_PRIORITY_MASK
    {
        panic!("SysTick's priority must be within the range masked by CPU Lock");
    }
}

/// Configure SysTick. The counter stays stopped until the kernel schedules
/// the first tick.
pub fn init<Traits: SysTickTicklessInstance>() {
    // Safety: We have the control of SysTick
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // Safety: We don't make priority-based critical sections
    unsafe {
        peripherals
            .SCB
            .set_priority(SystemHandler::SysTick, Traits::INTERRUPT_PRIORITY)
    };

    peripherals.SYST.disable_counter();
    peripherals.SYST.disable_interrupt();
    peripherals.SYST.set_clock_source(SystClkSource::Core);
    peripherals.SYST.clear_current();
}

/// The SysTick exception handler.
///
/// # Safety
///
/// Must be registered as the SysTick handler.
pub unsafe extern "C" fn handle_tick<Traits: SysTickTicklessInstance>() {
    // The kernel reads the elapsed time through `PortTimer`, which observes
    // the wrap that raised this exception
    //
    // Safety: Interrupt context, CPU Lock inactive
    unsafe { <Traits as PortToKernel>::timer_tick() };
}

/// SysTick as seen by [`TicklessState`]. Only used with CPU Lock active.
struct SysTick;

impl SysTick {
    #[inline]
    fn regs() -> &'static cortex_m::peripheral::syst::RegisterBlock {
        // Safety: We have the control of SysTick
        unsafe { &*SYST::PTR }
    }
}

impl ReloadTimer for SysTick {
    const MAX_RELOAD: u32 = MAX_RELOAD;

    #[inline]
    fn current(&mut self) -> u32 {
        SYST::get_current()
    }

    #[inline]
    fn take_wrapped(&mut self) -> bool {
        // Reading `CSR` clears `COUNTFLAG`
        Self::regs().csr.read() & CSR_COUNTFLAG != 0
    }

    #[inline]
    fn set_reload(&mut self, reload: u32) {
        // Safety: The value is in range
        unsafe { Self::regs().rvr.write(reload) };
    }

    #[inline]
    fn restart(&mut self) {
        // Writing any value to `CVR` clears it and `COUNTFLAG`
        // Safety: No side effects besides that
        unsafe { Self::regs().cvr.write(0) };
        // An exception raised by the old period is stale
        SCB::clear_pendst();
    }

    fn set_enabled(&mut self, enabled: bool) {
        let regs = Self::regs();
        let csr = regs.csr.read();
        if enabled {
            // Safety: We have the control of SysTick
            unsafe { regs.csr.write(csr | CSR_ENABLE | CSR_TICKINT) };
        } else {
            // Safety: We have the control of SysTick
            unsafe { regs.csr.write(csr & !(CSR_ENABLE | CSR_TICKINT)) };
            SCB::clear_pendst();
        }
    }
}

pub struct State {
    inner: UnsafeCell<TicklessState>,
}

// Safety: `inner` is protected from concurrent access by CPU Lock
unsafe impl Sync for State {}

impl State {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(TicklessState::new()),
        }
    }

    /// Implements `PortTimer::elapsed_ticks`.
    ///
    /// # Safety
    ///
    /// CPU Lock active
    #[inline]
    pub unsafe fn elapsed_ticks<Traits: SysTickTicklessInstance>(&self) -> u32 {
        // Safety: CPU Lock protects it from concurrent access
        let inner = unsafe { &mut *self.inner.get() };

        inner.elapsed_ticks(&Traits::CFG, &mut SysTick)
    }

    /// Implements `PortTimer::set_tick_interval`.
    ///
    /// # Safety
    ///
    /// CPU Lock active
    #[inline]
    pub unsafe fn set_tick_interval<Traits: SysTickTicklessInstance>(
        &self,
        interval: Option<NonZeroU32>,
    ) -> u32 {
        // Safety: CPU Lock protects it from concurrent access
        let inner = unsafe { &mut *self.inner.get() };

        inner.set_tick_interval(&Traits::CFG, &mut SysTick, interval)
    }
}
