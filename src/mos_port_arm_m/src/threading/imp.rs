use core::{
    arch::{asm, naked_asm},
    cell::UnsafeCell,
    mem::MaybeUninit,
    slice,
};
use cortex_m::peripheral::{scb, SCB};
use mos_kernel::{KernelTraits, PortThreading, PortToKernel, ThreadCb, ThreadId};

use crate::ThreadingOptions;

/// Implemented on a system type by [`use_port!`](crate::use_port).
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`](crate::use_port).
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortThreadState = ThreadContext> + ThreadingOptions
{
}

/// The part of a thread's context that isn't on its stack.
#[derive(Debug)]
#[repr(C)]
pub struct ThreadContext {
    /// The saved PSP. Accessed by `handle_pend_sv`.
    sp: UnsafeCell<u32>,
}

// Safety: `sp` is only accessed with CPU Lock active or by the dispatcher
unsafe impl Sync for ThreadContext {}
unsafe impl Send for ThreadContext {}

impl ThreadContext {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            sp: UnsafeCell::new(0),
        }
    }
}

/// The smallest stack that can hold the initial context with some room to
/// spare.
const MIN_STACK_SIZE: usize = 128;

const SHCSR: *mut u32 = 0xe000_ed24 as *mut u32;
const SHCSR_FAULTS_ENA: u32 = 0b111 << 16;
#[cfg(has_fpu)]
const FPCCR: *mut u32 = 0xe000_ef34 as *mut u32;
const ICSR_RETTOBASE: u32 = 1 << 11;

/// Used by `use_port!`
pub const fn validate<Traits: PortInstance>() {
    #[cfg(any(armv6m, armv8m_base))]
    assert!(
        Traits::CPU_LOCK_PRIORITY_MASK == 0,
        "`CPU_LOCK_PRIORITY_MASK` must be zero because the target architecture \
         does not have a BASEPRI register"
    );
}

/// The entry point.
///
/// # Safety
///
/// Reset handler, called only once
pub unsafe fn port_boot<Traits: PortInstance>() -> ! {
    // Safety: We own the peripherals
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // The dispatcher and the supervisor call run at the lowest priority
    // Safety: We don't make priority-based critical sections
    unsafe {
        peripherals
            .SCB
            .set_priority(scb::SystemHandler::SVCall, 0xff);
        peripherals
            .SCB
            .set_priority(scb::SystemHandler::PendSV, 0xff);
    }

    // Enable UsageFault, BusFault, and MemManage so that a faulting thread
    // doesn't escalate to HardFault
    #[cfg(not(any(armv6m, armv8m_base)))]
    unsafe {
        SHCSR.write_volatile(SHCSR.read_volatile() | SHCSR_FAULTS_ENA)
    };

    #[cfg(has_fpu)]
    unsafe {
        // ASPEN = 1, LSPEN = LAZY_FP_CONTEXT
        let fpccr = FPCCR.read_volatile() & !(0b11 << 30);
        FPCCR.write_volatile(fpccr | (1 << 31) | ((Traits::LAZY_FP_CONTEXT as u32) << 30));
    }

    // Safety: We are the port. CPU Lock inactive, a boot context.
    unsafe { <Traits as PortToKernel>::boot() }
}

pub unsafe fn dispatch_first_thread<Traits: PortInstance>() -> ! {
    SCB::set_pendsv();

    // Discard the current context and transfer the control to the idle
    // loop. PendSV is pending, so the dispatcher kicks in as soon as the idle
    // loop releases CPU Lock.
    //
    // Safety: `CONTROL.SPSEL == 0`, Thread mode (entailed by the boot context),
    //         CPU Lock active
    unsafe { idle_loop::<Traits>() }
}

/// Reset MSP to `interrupt_stack_top()`, release CPU Lock, and start executing
/// the idle loop.
///
/// # Safety
///
/// `CONTROL.SPSEL == 0`, Thread mode, CPU Lock active
#[inline(never)]
unsafe extern "C" fn idle_loop<Traits: PortInstance>() -> ! {
    // Safety: Only the port can call this method
    let msp_top = unsafe { Traits::interrupt_stack_top() };

    #[cfg(not(any(armv6m, armv8m_base)))]
    macro_rules! clear_basepri {
        () => {
            "
                movs r1, #0
                msr basepri, r1
            "
        };
    }
    #[cfg(any(armv6m, armv8m_base))]
    macro_rules! clear_basepri {
        () => {
            ""
        };
    }

    // The idle loop uses MSP as its stack. Nothing above the reset point is
    // needed anymore.
    if Traits::USE_WFI {
        unsafe {
            asm!(
                concat!(
                    "cpsid i\n",
                    clear_basepri!(),
                    "
                        mov sp, {msp_top}
                        cpsie i
                    0:
                        wfi
                        b 0b
                    "
                ),
                msp_top = in(reg) msp_top,
                options(noreturn),
            )
        }
    } else {
        unsafe {
            asm!(
                concat!(
                    "cpsid i\n",
                    clear_basepri!(),
                    "
                        mov sp, {msp_top}
                        cpsie i
                    0:
                        b 0b
                    "
                ),
                msp_top = in(reg) msp_top,
                options(noreturn),
            )
        }
    }
}

pub unsafe fn yield_cpu<Traits: PortInstance>() {
    SCB::set_pendsv();
}

pub unsafe fn exit_and_dispatch<Traits: PortInstance>(_thread: &'static ThreadCb<Traits>) -> ! {
    SCB::set_pendsv();

    // Switch to MSP, making the processor state consistent with
    // `running_thread == None`, and transfer the control to the idle loop.
    //
    // Safety: `CONTROL.SPSEL == 0` (we just cleared it), Thread mode (a thread
    //         context), CPU Lock active (`exit_and_dispatch`'s requirement)
    unsafe {
        asm!(
            "
                mrs r0, control
                movs r1, #2
                bics r0, r1
                msr control, r0
                isb
                ldr r0, 0f
                bx r0

                .align 2
            0:
                .word {idle_loop}
            ",
            idle_loop = sym idle_loop::<Traits>,
            options(noreturn),
        )
    }
}

/// Called by `handle_pend_sv`. Returns the location of `running_thread`.
extern "C" fn running_thread_ptr<Traits: PortInstance>() -> *mut *mut ThreadCb<Traits> {
    Traits::state().running_thread_ptr()
}

/// Called by `handle_pend_sv` to choose the next thread to run.
extern "C" fn choose_next_thread<Traits: PortInstance>() {
    // Safety: CPU Lock inactive (PendSV is masked by CPU Lock)
    unsafe { enter_cpu_lock::<Traits>() };

    let prev = Traits::state().running_thread().map(thread_id::<Traits>);

    // Safety: CPU Lock active, not a thread context
    unsafe { <Traits as PortToKernel>::choose_running_thread() };

    if let Some(hook) = Traits::SECURE_CONTEXT_HOOK {
        let next = Traits::state().running_thread().map(thread_id::<Traits>);
        if prev != next {
            hook.switch_context(prev, next);
        }
    }

    // Safety: CPU Lock active
    unsafe { leave_cpu_lock::<Traits>() };
}

fn thread_id<Traits: PortInstance>(thread: &'static ThreadCb<Traits>) -> ThreadId {
    let pool = Traits::thread_cb_pool();
    // Safety: `thread` is an element of `pool`
    let index = unsafe { (thread as *const ThreadCb<Traits>).offset_from(pool.as_ptr()) };
    ThreadId::new(index as usize)
}

/// The PendSV handler.
///
/// The saved context of a thread is laid out as follows, from the saved PSP:
///
///  - `EXC_RETURN`
///  - `CONTROL`
///  - `s16`-`s31` (only if the thread has an active floating-point context)
///  - `r4`-`r11`
///  - The exception frame stacked by the processor
///
/// # Safety
///
/// This function must be registered as the PendSV handler. PendSV must have
/// the lowest priority, so the exception was taken from Thread mode.
#[cfg(not(any(armv6m, armv8m_base)))]
#[unsafe(naked)]
pub unsafe extern "C" fn handle_pend_sv<Traits: PortInstance>() {
    #[cfg(has_fpu)]
    macro_rules! fp_save {
        () => {
            "
                tst lr, #0x10
                it eq
                subeq r2, #64
                str r2, [r1]
                strd lr, r3, [r2], #8
                it eq
                vstmiaeq r2!, {{s16-s31}}
            "
        };
    }
    #[cfg(not(has_fpu))]
    macro_rules! fp_save {
        () => {
            "
                str r2, [r1]
                strd lr, r3, [r2], #8
            "
        };
    }
    #[cfg(has_fpu)]
    macro_rules! fp_restore {
        () => {
            "
                ldrd lr, r3, [r2], #8
                tst lr, #0x10
                it eq
                vldmiaeq r2!, {{s16-s31}}
            "
        };
    }
    #[cfg(not(has_fpu))]
    macro_rules! fp_restore {
        () => {
            "
                ldrd lr, r3, [r2], #8
            "
        };
    }

    naked_asm!(
        concat!(
            "
                # r0 = &running_thread
                push {{r0, lr}}
                bl {running_thread_ptr}
                pop {{r1, lr}}

                # Save the context of the previous thread, if any
                ldr r1, [r0]
                cbz r1, 0f
                mrs r2, psp
                mrs r3, control
                subs r2, #40
            ",
            fp_save!(),
            "
                stmia r2, {{r4-r11}}

            0:
                # Choose the next thread. r4-r11 are free to use now.
                mov r4, r0
                bl {choose_next_thread}
                mov r0, r4

                # Restore the context of the next thread, if any
                ldr r1, [r0]
                cbz r1, 1f
                ldr r2, [r1]
            ",
            fp_restore!(),
            "
                ldmia r2!, {{r4-r11}}
                msr control, r3
                isb
                msr psp, r2
                bx lr

            1:
                # Return to the idle loop, which uses MSP
                movs r0, #0
                msr control, r0
                isb
                mvn lr, #6
                bx lr
            "
        ),
        running_thread_ptr = sym running_thread_ptr::<Traits>,
        choose_next_thread = sym choose_next_thread::<Traits>,
    )
}

/// The PendSV handler. See the other definition for the context layout.
///
/// # Safety
///
/// This function must be registered as the PendSV handler. PendSV must have
/// the lowest priority, so the exception was taken from Thread mode.
#[cfg(any(armv6m, armv8m_base))]
#[unsafe(naked)]
pub unsafe extern "C" fn handle_pend_sv<Traits: PortInstance>() {
    naked_asm!(
        "
            # r0 = &running_thread
            push {{r0, lr}}
            bl {running_thread_ptr}
            pop {{r1, r2}}
            mov lr, r2

            # Save the context of the previous thread, if any
            ldr r1, [r0]
            cmp r1, #0
            beq 0f
            mrs r2, psp
            mrs r3, control
            subs r2, #40
            str r2, [r1]
            mov r1, lr
            stmia r2!, {{r1, r3}}
            stmia r2!, {{r4-r7}}
            mov r4, r8
            mov r5, r9
            mov r6, r10
            mov r7, r11
            stmia r2!, {{r4-r7}}

        0:
            # Choose the next thread. r4-r11 are free to use now.
            mov r4, r0
            bl {choose_next_thread}
            mov r0, r4

            # Restore the context of the next thread, if any
            ldr r1, [r0]
            cmp r1, #0
            beq 1f
            ldr r2, [r1]
            ldmia r2!, {{r0, r3}}
            mov lr, r0
            adds r2, #16
            ldmia r2!, {{r4-r7}}
            mov r8, r4
            mov r9, r5
            mov r10, r6
            mov r11, r7
            subs r2, #32
            ldmia r2!, {{r4-r7}}
            adds r2, #16
            msr control, r3
            isb
            msr psp, r2
            bx lr

        1:
            # Return to the idle loop, which uses MSP
            movs r0, #0
            msr control, r0
            isb
            # 0x00000006 = !0xfffffff9
            movs r1, #6
            mvns r1, r1
            mov lr, r1
            bx lr
        ",
        running_thread_ptr = sym running_thread_ptr::<Traits>,
        choose_next_thread = sym choose_next_thread::<Traits>,
    )
}

#[inline(always)]
pub unsafe fn enter_cpu_lock<Traits: PortInstance>() {
    #[cfg(not(any(armv6m, armv8m_base)))]
    if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
        // Set `BASEPRI` to `CPU_LOCK_PRIORITY_MASK`
        unsafe { cortex_m::register::basepri::write(Traits::CPU_LOCK_PRIORITY_MASK) };
        return;
    }

    // Set `PRIMASK` to `1`
    cortex_m::interrupt::disable();
}

#[inline(always)]
pub unsafe fn leave_cpu_lock<Traits: PortInstance>() {
    #[cfg(not(any(armv6m, armv8m_base)))]
    if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
        // Set `BASEPRI` to `0` (no masking)
        unsafe { cortex_m::register::basepri::write(0) };
        return;
    }

    // Set `PRIMASK` to `0`
    unsafe { cortex_m::interrupt::enable() };
}

#[inline(always)]
pub fn is_cpu_lock_active<Traits: PortInstance>() -> bool {
    #[cfg(not(any(armv6m, armv8m_base)))]
    if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
        return cortex_m::register::basepri::read() != 0;
    }

    cortex_m::register::primask::read().is_inactive()
}

/// Disable all interrupts. Returns `true` if they were enabled.
#[inline(always)]
pub unsafe fn enter_irq_lock() -> bool {
    let was_enabled = cortex_m::register::primask::read().is_active();
    cortex_m::interrupt::disable();
    was_enabled
}

#[inline(always)]
pub unsafe fn leave_irq_lock(was_enabled: bool) {
    if was_enabled {
        // Safety: Restoring the state saved by `enter_irq_lock`
        unsafe { cortex_m::interrupt::enable() };
    }
}

pub fn is_thread_context<Traits: PortInstance>() -> bool {
    // All threads use PSP. The idle loop doesn't, but no user code runs there.
    // `SPSEL` reads as zero in Handler mode.
    cortex_m::register::control::read().spsel() == cortex_m::register::control::Spsel::Psp
}

pub fn is_interrupt_context<Traits: PortInstance>() -> bool {
    SCB::vect_active() != scb::VectActive::ThreadMode
}

pub unsafe fn initialize_thread_state<Traits: PortInstance>(thread: &'static ThreadCb<Traits>) {
    let stack = thread.stack();
    debug_assert!(
        stack.len() >= MIN_STACK_SIZE,
        "the stack is too small for the initial context"
    );

    // The stack pointer must be 8-byte aligned on exception entry
    let top = (stack.as_ptr() as usize + stack.len()) & !7;
    let mut sp = top as *mut MaybeUninit<u32>;

    let preload_all = cfg!(feature = "preload-registers");

    // Exception frame (automatically saved and restored as part of the
    // architecturally-defined exception entry/return sequence)
    let exc_frame = unsafe {
        sp = sp.wrapping_sub(8);
        slice::from_raw_parts_mut(sp, 8)
    };

    // R0-R3, R12: Uninitialized. `thread_main` finds everything it needs in
    // the kernel state.
    exc_frame[0] = MaybeUninit::new(0);
    if preload_all {
        exc_frame[1] = MaybeUninit::new(0x01010101);
        exc_frame[2] = MaybeUninit::new(0x02020202);
        exc_frame[3] = MaybeUninit::new(0x03030303);
        exc_frame[4] = MaybeUninit::new(0x12121212);
    }
    // LR: `thread_entry` never returns
    exc_frame[5] = MaybeUninit::new(0xffffffff);
    // PC: The entry point. The Thumb bit of the function pointer must be
    // cleared in an exception frame.
    exc_frame[6] = MaybeUninit::new(thread_entry::<Traits> as usize as u32 & !1);
    // xPSR: Thumb state
    exc_frame[7] = MaybeUninit::new(0x01000000);

    // Extra context (saved and restored by `handle_pend_sv`)
    let extra_ctx = unsafe {
        sp = sp.wrapping_sub(10);
        slice::from_raw_parts_mut(sp, 10)
    };

    // EXC_RETURN: 0xfffffffd ("Return to Thread Mode; Exception return gets
    //             state from the Process stack; On return execution uses the
    //             Process Stack.")
    extra_ctx[0] = MaybeUninit::new(0xfffffffd);
    // CONTROL: SPSEL = 1 (Use PSP)
    extra_ctx[1] = MaybeUninit::new(0x00000002);

    // R4-R11: Uninitialized
    if preload_all {
        for (i, reg) in extra_ctx[2..].iter_mut().enumerate() {
            *reg = MaybeUninit::new(0x04040404 * (i as u32 + 1));
        }
    }

    unsafe { *thread.port_thread_state.sp.get() = sp as u32 };
}

/// The initial program counter of every thread.
extern "C" fn thread_entry<Traits: PortInstance>() -> ! {
    // Safety: CPU Lock inactive, a thread context that has just been
    //         dispatched
    unsafe { <Traits as PortToKernel>::thread_main() }
}

/// Handle a fault exception (UsageFault, BusFault, or MemManage). If the fault
/// was caused by a thread, the thread is restarted with its stop handler.
/// Otherwise, the fault is unrecoverable and this function panics.
///
/// # Safety
///
/// Must be called from the handler of a fault exception.
pub unsafe fn handle_fault<Traits: PortInstance>() {
    // Safety: Read-only access to a memory-mapped register
    let icsr = unsafe { (*SCB::PTR).icsr.read() };

    // The fault was taken from Thread mode if no other exception is active
    let from_thread_mode = icsr & ICSR_RETTOBASE != 0;
    if !from_thread_mode || Traits::state().running_thread().is_none() {
        panic!("unrecoverable fault (ICSR = {icsr:#010x})");
    }

    // Safety: An interrupt context. The kernel releases CPU Lock if the
    //         thread held it, so the dispatcher runs when we return.
    unsafe { <Traits as PortToKernel>::thread_faulted() };
}
