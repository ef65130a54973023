//! Error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use mos_kernel::ResultCode;
            /// assert_eq!(ResultCode::BadObjectState.as_str(), "BadObjectState");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that a kernel operation can
    /// produce.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is invalid in a way that is no covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified object identifier is out of range.
        BadId = -18,
        /// The current context disallows the operation.
        BadContext = -25,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// The operation could not complete without blocking.
        WouldBlock = -42,
        /// The operation timed out.
        Timeout = -50,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod wait_error {}
    /// Error type for blocking operations without a timeout, such as
    /// [`Semaphore::wait`] and [`Mutex::lock`].
    ///
    /// [`Semaphore::wait`]: crate::Semaphore::wait
    /// [`Mutex::lock`]: crate::Mutex::lock
    pub enum WaitError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
    }
}

define_error! {
    mod wait_timeout_error {}
    /// Error type for blocking operations with a timeout, such as
    /// [`Semaphore::wait_or_timeout`].
    ///
    /// [`Semaphore::wait_or_timeout`]: crate::Semaphore::wait_or_timeout
    pub enum WaitTimeoutError: WaitError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The wait was not satisfied before the deadline.
        Timeout,
    }
}

define_error! {
    mod try_lock_mutex_error {}
    /// Error type for [`Mutex::try_lock`].
    ///
    /// [`Mutex::try_lock`]: crate::Mutex::try_lock
    pub enum TryLockMutexError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The mutex is owned by another thread.
        WouldBlock,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Mutex::unlock`] and [`Mutex::restore`].
    ///
    /// [`Mutex::unlock`]: crate::Mutex::unlock
    /// [`Mutex::restore`]: crate::Mutex::restore
    pub enum UnlockMutexError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
    }
}

define_error! {
    mod query_mutex_error {}
    /// Error type for mutex queries such as [`Mutex::is_owner`].
    ///
    /// [`Mutex::is_owner`]: crate::Mutex::is_owner
    pub enum QueryMutexError {
        /// CPU Lock is active, or (for the operations concerning the caller)
        /// the current context is not a thread context.
        BadContext,
    }
}

define_error! {
    mod init_thread_error {}
    /// Error type for [`System::init_thread`].
    ///
    /// [`System::init_thread`]: crate::System::init_thread
    pub enum InitThreadError {
        /// CPU Lock is active.
        BadContext,
        /// The thread ID is out of range.
        BadId,
        /// The thread is live (neither uninitialized, initialized, nor
        /// stopped).
        BadObjectState,
        /// The priority is out of range, or the stack is too small.
        BadParam,
    }
}

define_error! {
    mod run_thread_error {}
    /// Error type for [`System::run_thread`].
    ///
    /// [`System::run_thread`]: crate::System::run_thread
    pub enum RunThreadError {
        /// CPU Lock is active.
        BadContext,
        /// The thread ID is out of range.
        BadId,
        /// The thread is not in the `Init` state.
        BadObjectState,
    }
}

define_error! {
    mod kill_thread_error {}
    /// Error type for [`System::kill_thread`].
    ///
    /// [`System::kill_thread`]: crate::System::kill_thread
    pub enum KillThreadError {
        /// CPU Lock is active, or the current context is not a thread context.
        BadContext,
        /// The thread ID is out of range.
        BadId,
        /// The thread has not been started, has stopped, or is already
        /// stopping.
        BadObjectState,
    }
}

define_error! {
    mod set_priority_error {}
    /// Error type for [`System::set_thread_priority`].
    ///
    /// [`System::set_thread_priority`]: crate::System::set_thread_priority
    pub enum SetPriorityError {
        /// CPU Lock is active.
        BadContext,
        /// The thread ID is out of range.
        BadId,
        /// The thread is uninitialized or stopped.
        BadObjectState,
        /// The priority is out of range.
        BadParam,
    }
}

define_error! {
    mod query_thread_error {}
    /// Error type for thread queries such as [`System::thread_state`].
    ///
    /// [`System::thread_state`]: crate::System::thread_state
    pub enum QueryThreadError {
        /// CPU Lock is active.
        BadContext,
        /// The thread ID is out of range.
        BadId,
    }
}

define_error! {
    mod wait_thread_error {}
    /// Error type for [`System::wait_for_thread_stop`].
    ///
    /// [`System::wait_for_thread_stop`]: crate::System::wait_for_thread_stop
    pub enum WaitThreadError: WaitError {
        /// CPU Lock is active, the current context is not a thread context, or
        /// the target is the calling thread.
        BadContext,
        /// The thread ID is out of range.
        BadId,
        /// The thread has never been initialized.
        BadObjectState,
    }
}

define_error! {
    mod wait_thread_timeout_error {}
    /// Error type for [`System::wait_for_thread_stop_or_timeout`].
    ///
    /// [`System::wait_for_thread_stop_or_timeout`]: crate::System::wait_for_thread_stop_or_timeout
    pub enum WaitThreadTimeoutError: WaitError, WaitTimeoutError, WaitThreadError {
        /// CPU Lock is active, the current context is not a thread context, or
        /// the target is the calling thread.
        BadContext,
        /// The thread ID is out of range.
        BadId,
        /// The thread has never been initialized.
        BadObjectState,
        /// The thread did not stop before the deadline.
        Timeout,
    }
}

define_error! {
    mod timer_error {}
    /// Error type for [`Timer`] operations.
    ///
    /// [`Timer`]: crate::Timer
    pub enum TimerError {
        /// CPU Lock is active.
        BadContext,
    }
}

// Internal sub-errors
// ---------------------------------------------------------------------------

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// `BadContext`
    #[into(WaitError)]
    #[into(WaitTimeoutError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(QueryMutexError)]
    #[into(InitThreadError)]
    #[into(RunThreadError)]
    #[into(KillThreadError)]
    #[into(SetPriorityError)]
    #[into(QueryThreadError)]
    #[into(WaitThreadError)]
    #[into(WaitThreadTimeoutError)]
    #[into(TimerError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId`
    #[into(InitThreadError)]
    #[into(RunThreadError)]
    #[into(KillThreadError)]
    #[into(SetPriorityError)]
    #[into(QueryThreadError)]
    #[into(WaitThreadError)]
    #[into(WaitThreadTimeoutError)]
    pub(crate) enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// `BadObjectState`
    #[into(InitThreadError)]
    #[into(RunThreadError)]
    #[into(KillThreadError)]
    #[into(SetPriorityError)]
    #[into(WaitThreadError)]
    #[into(WaitThreadTimeoutError)]
    pub(crate) enum BadObjectStateError {
        BadObjectState,
    }
}

/// Convert `e` to `WaitError`, panicking if `e == Timeout`.
#[inline]
pub(crate) fn expect_not_timeout(e: WaitTimeoutError) -> WaitError {
    match e {
        WaitTimeoutError::BadContext => WaitError::BadContext,
        WaitTimeoutError::Timeout => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}
