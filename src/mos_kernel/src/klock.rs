//! Kernel state locking mechanism
//!
//! Two locks protect kernel state:
//!
//!  - **CPU Lock** masks every interrupt at or below the kernel's priority.
//!    All scheduler state (run queues, the timer queue, pend queues, thread
//!    control blocks) lives in [`CpuLockCell`]s.
//!
//!  - **IRQ Lock** disables all interrupts for a handful of instructions. It
//!    guards the state touched by ISR-safe fast paths (semaphore counts, the
//!    handoff queue, queue cursors), which may be reached from interrupt
//!    handlers running above the kernel's masking level. IRQ Lock may be
//!    taken while CPU Lock is held, but never the other way around.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, utils::intrusive_list::CellLike, PortAtomic, PortThreading};

pub(crate) struct CpuLockTag<Traits>(Traits);

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<Traits: PortThreading, T: ?Sized> CpuLockCell<Traits, T> {
    /// Return a debug formatting proxy of the cell. The given closure is used
    /// to format the borrowed contents. Note that CPU Lock is active when the
    /// closure is called.
    pub(crate) fn debug_fmt_with_ref<'a, F: 'a + Fn(&T, &mut fmt::Formatter) -> fmt::Result>(
        &'a self,
        f: F,
    ) -> impl fmt::Debug + 'a {
        struct DebugFmtWithRef<'a, Traits, T: ?Sized, F> {
            cell: &'a CpuLockCell<Traits, T>,
            f: F,
        }

        impl<Traits: PortThreading, T: ?Sized, F: Fn(&T, &mut fmt::Formatter) -> fmt::Result>
            fmt::Debug for DebugFmtWithRef<'_, Traits, T, F>
        {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if let Ok(lock) = lock_cpu() {
                    f.write_str("CpuLockCell(")?;
                    (self.f)(self.cell.0.read(&*lock), f)?;
                    f.write_str(")")
                } else {
                    f.write_str("CpuLockCell(< locked >)")
                }
            }
        }

        DebugFmtWithRef { cell: self, f }
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.debug_fmt_with_ref(|x, f| x.fmt(f)).fmt(f)
    }
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a, Element: Clone, Traits: PortThreading> CellLike<CpuLockTokenRefMut<'a, Traits>>
    for CpuLockCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &CpuLockTokenRefMut<'a, Traits>) -> Self::Target {
        self.0.read(&**key).clone()
    }
    fn set(&self, key: &mut CpuLockTokenRefMut<'a, Traits>, value: Self::Target) {
        *self.0.write(&mut **key) = value;
    }
    fn modify<T>(
        &self,
        key: &mut CpuLockTokenRefMut<'a, Traits>,
        f: impl FnOnce(&mut Self::Target) -> T,
    ) -> T {
        f(self.0.write(&mut **key))
    }
}

/// Attempt to enter a CPU Lock state and get an RAII guard.
/// Return `BadContext` if the kernel is already in a CPU Lock state.
pub(crate) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: `try_enter_cpu_lock` is only meant to be called by the kernel
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: We just entered a CPU Lock state. This also means there are
        //         no instances of `CpuLockGuard` existing at this point.
        Ok(unsafe { assume_cpu_lock() })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Assume a CPU Lock state and get `CpuLockGuard`.
///
/// # Safety
///
/// The system must be really in a CPU Lock state. There must be no instances of
/// `CpuLockGuard` existing at the point of the call.
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: There are no other instances of `CpuLockToken`; this is
        //         upheld by the caller.
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us (the kernel) who
        // are currently controlling the CPU Lock state
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but does not consume memory.
///
///  - Always prefer this over `&mut CpuLockGuard` in function parameters.
///  - When you pass `&'a mut _` to a function, the compiler automatically
///    reborrows it as `&'b mut _` so that the original `&'a mut _` remains
///    accessible after the function call. This does not happen with
///    `CpuLockTokenRefMut`. You have to call [`borrow_mut`] manually.
///
/// [`borrow_mut`]: tokenlock::UnsyncSingletonTokenRefMut::borrow_mut
pub(crate) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

// IRQ Lock
// ---------------------------------------------------------------------------

pub(crate) struct IrqLockTag<Traits>(Traits);

/// The key that "unlocks" [`IrqLockCell`].
pub(crate) type IrqLockToken<Traits> = tokenlock::UnsyncSingletonToken<IrqLockTag<Traits>>;

pub(crate) type IrqLockKeyhole<Traits> = tokenlock::SingletonTokenId<IrqLockTag<Traits>>;

/// Cell type that can be accessed by [`IrqLockToken`] (which can be obtained
/// by [`lock_irq`]).
pub(crate) struct IrqLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, IrqLockKeyhole<Traits>>);

impl<Traits, T> IrqLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(IrqLockKeyhole::new(), x))
    }
}

impl<Traits, T> ops::Deref for IrqLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, IrqLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits: PortAtomic, T: fmt::Debug + Clone> fmt::Debug for IrqLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = {
            let lock = lock_irq::<Traits>();
            self.0.read(&*lock).clone()
        };
        f.debug_tuple("IrqLockCell").field(&inner).finish()
    }
}

impl<'a, Element: Clone, Traits: PortAtomic> CellLike<IrqLockTokenRefMut<'a, Traits>>
    for IrqLockCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &IrqLockTokenRefMut<'a, Traits>) -> Self::Target {
        self.0.read(&**key).clone()
    }
    fn set(&self, key: &mut IrqLockTokenRefMut<'a, Traits>, value: Self::Target) {
        *self.0.write(&mut **key) = value;
    }
    fn modify<T>(
        &self,
        key: &mut IrqLockTokenRefMut<'a, Traits>,
        f: impl FnOnce(&mut Self::Target) -> T,
    ) -> T {
        f(self.0.write(&mut **key))
    }
}

/// Disable all interrupts and get an RAII guard. Unlike [`lock_cpu`], this
/// never fails and can be called from any context, including while CPU Lock
/// is active.
///
/// The kernel never holds two `IrqLockGuard`s at once. Callers must keep the
/// guarded region short and must not call back into anything that could take
/// IRQ Lock again.
pub(crate) fn lock_irq<Traits: PortAtomic>() -> IrqLockGuard<Traits> {
    // Safety: `enter_irq_lock` is only meant to be called by the kernel
    let saved = unsafe { Traits::enter_irq_lock() };
    IrqLockGuard {
        // Safety: IRQ Lock guards are never nested, so there are no other
        //         instances of `IrqLockToken`
        token: unsafe { IrqLockToken::new_unchecked() },
        saved,
    }
}

/// RAII guard for an IRQ Lock state.
pub(crate) struct IrqLockGuard<Traits: PortAtomic> {
    token: IrqLockToken<Traits>,
    saved: Traits::IrqLockState,
}

impl<Traits: PortAtomic> IrqLockGuard<Traits> {
    pub(crate) fn borrow_mut(&mut self) -> IrqLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortAtomic> Drop for IrqLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: Restores the state saved by `lock_irq`
        unsafe {
            Traits::leave_irq_lock(self.saved);
        }
    }
}

impl<Traits: PortAtomic> ops::Deref for IrqLockGuard<Traits> {
    type Target = IrqLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortAtomic> ops::DerefMut for IrqLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

pub(crate) type IrqLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, IrqLockTag<Traits>>;
