//! Cortex-M port for the MOS kernel
//!
//! # Usage
//!
//! ```rust,ignore
//! mos_port_arm_m::use_port!(unsafe struct SystemTraits);
//! mos_port_arm_m::use_systick_tickless!(unsafe impl PortTimer for SystemTraits);
//! mos_kernel::build!(SystemTraits, Cfg::new(8, 4).ticks_per_second(1000), startup_hook = startup);
//!
//! impl mos_port_arm_m::ThreadingOptions for SystemTraits {}
//!
//! impl mos_port_arm_m::SysTickOptions for SystemTraits {
//!     // SysTick = AHB, AHB = 64MHz
//!     const FREQUENCY: u64 = 64_000_000;
//! }
//!
//! fn startup() {
//!     SystemTraits::configure_systick();
//!     /* initialize and start threads */
//! }
//! ```
//!
//! # Threading
//!
//! Threads run in Thread mode on the process stack (PSP). The boot context,
//! and the idle loop that takes it over after the first dispatch, use the main
//! stack (MSP), which is also the interrupt stack.
//!
//! Context switching is done by the PendSV handler, which runs at the lowest
//! priority. [`ThreadingOptions::CPU_LOCK_PRIORITY_MASK`] chooses between
//! `BASEPRI` and `PRIMASK` for CPU Lock. IRQ Lock always uses `PRIMASK`.
//!
//! # Kernel timing
//!
//! [`use_systick_tickless!`] implements `PortTimer` on SysTick. It reprograms
//! SysTick for the next timed event and stops it while the system is idle and
//! nothing is scheduled (if the kernel is configured with tickless idle).
//!
//! # Faults
//!
//! The port enables the UsageFault, BusFault, and MemManage exceptions (where
//! available). Call [`handle_fault`] from their handlers to restart the
//! faulting thread with its stop handler:
//!
//! ```rust,ignore
//! #[cortex_m_rt::exception]
//! fn UsageFault() {
//!     unsafe { mos_port_arm_m::handle_fault::<SystemTraits>() };
//! }
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]
#![no_std]

/// The `mos_kernel::PortThreading` implementation.
#[doc(hidden)]
pub mod threading {
    pub mod cfg;
    #[cfg(target_os = "none")]
    pub mod imp;
}

/// The tickless `mos_kernel::PortTimer` implementation based on SysTick.
#[doc(hidden)]
pub mod systick_tickless {
    pub mod cfg;
    #[cfg(target_os = "none")]
    pub mod imp;
}

pub use self::{systick_tickless::cfg::*, threading::cfg::*};

#[cfg(target_os = "none")]
pub use self::threading::imp::handle_fault;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate mos_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate mos_portkit;
/// Used by `use_port!`
#[doc(hidden)]
#[cfg(target_os = "none")]
pub use cortex_m_rt;
