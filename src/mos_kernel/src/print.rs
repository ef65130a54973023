//! Raw diagnostic output
use core::{
    fmt,
    sync::atomic::{AtomicPtr, Ordering},
};

/// Holds a `fn(fmt::Arguments<'_>)`, or null.
static PRINT_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Register the function that receives the kernel's diagnostic reports
/// (assertion failures and thread faults). The hook may be called from any
/// context, including interrupt handlers and with CPU Lock active.
pub fn set_print_hook(hook: fn(fmt::Arguments<'_>)) {
    PRINT_HOOK.store(hook as *mut (), Ordering::Release);
}

pub(crate) fn print(args: fmt::Arguments<'_>) {
    let hook = PRINT_HOOK.load(Ordering::Acquire);
    if !hook.is_null() {
        // Safety: A non-null value was stored by `set_print_hook` from
        //         a function pointer of this type
        let hook = unsafe { core::mem::transmute::<*mut (), fn(fmt::Arguments<'_>)>(hook) };
        hook(args);
    }
}

/// Send a formatted report to the print hook.
macro_rules! kprint {
    ($($args:tt)*) => {
        $crate::print::print(format_args!($($args)*))
    };
}

/// Like `assert!`, but also reports the failure through the print hook.
macro_rules! kassert {
    ($cond:expr, $($args:tt)*) => {
        if !$cond {
            kprint!($($args)*);
            panic!($($args)*);
        }
    };
}
