//! Blocking queues
//!
//! A queue is a ring buffer guarded by two counting semaphores: `free` counts
//! the empty slots and `filled` counts the occupied ones. A sender takes a unit
//! of `free`, copies the element in, and gives a unit of `filled`. A receiver
//! does the opposite. Only the element copy and the cursor update happen under
//! IRQ Lock, so the non-blocking variants are ISR-safe.
use core::{fmt, mem::MaybeUninit};

use crate::{
    error::{expect_not_timeout, WaitError, WaitTimeoutError},
    klock::{self, IrqLockCell},
    semaphore::{SemCore, SemMode},
    signal::Signal,
    KernelTraits, PortThreading,
};

struct Ring<T, const N: usize> {
    slots: [MaybeUninit<T>; N],
    /// The index of the oldest element.
    head: usize,
    /// The index of the next free slot.
    tail: usize,
    len: usize,
}

impl<T, const N: usize> Ring<T, N> {
    const fn new() -> Self {
        Self {
            slots: [const { MaybeUninit::uninit() }; N],
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    fn push(&mut self, item: T) {
        self.slots[self.tail] = MaybeUninit::new(item);
        self.tail = (self.tail + 1) % N;
        self.len += 1;
    }

    /// # Safety
    ///
    /// The ring must hold at least one element.
    unsafe fn pop(&mut self) -> T {
        // Safety: The slot at `head` is occupied (upheld by the caller)
        let item = unsafe { self.slots[self.head].assume_init_read() };
        self.head = (self.head + 1) % N;
        self.len -= 1;
        item
    }
}

/// A fixed-capacity FIFO of `N` elements of type `T`.
///
/// [`try_send`](Self::try_send) and [`try_receive`](Self::try_receive) are
/// ISR-safe.
///
/// A queue can be bound to a channel of a [`Signal`] with
/// [`with_signal`](Self::with_signal). Every successful send then raises the
/// channel's bit, and a consumer can wait on several queues at once with
/// [`wait_on_multi_queue`].
///
/// ```rust,ignore
/// static EVENTS: Signal<SystemTraits> = Signal::new();
/// static URGENT: Queue<SystemTraits, u32, 4> = Queue::new().with_signal(&EVENTS, 0);
/// static NORMAL: Queue<SystemTraits, u32, 16> = Queue::new().with_signal(&EVENTS, 1);
///
/// let mut pending = 0;
/// loop {
///     let item = match wait_on_multi_queue(&EVENTS, &mut pending).unwrap() {
///         0 => URGENT.try_receive(),
///         _ => NORMAL.try_receive(),
///     };
/// }
/// ```
pub struct Queue<Traits: PortThreading, T, const N: usize> {
    ring: IrqLockCell<Traits, Ring<T, N>>,
    free: SemCore<Traits>,
    filled: SemCore<Traits>,
    channel: Option<(&'static Signal<Traits>, u8)>,
}

impl<Traits: PortThreading, T: Copy + Send + 'static, const N: usize> Queue<Traits, T, N> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        assert!(N > 0, "a queue must have at least one slot");
        assert!(N <= u32::MAX as usize, "queue capacity is too large");
        Self {
            ring: IrqLockCell::new(Ring::new()),
            free: SemCore::new(SemMode::Counting, N as u32),
            filled: SemCore::new(SemMode::Counting, 0),
            channel: None,
        }
    }

    /// Bind the queue to bit `channel` of `signal`.
    pub const fn with_signal(self, signal: &'static Signal<Traits>, channel: u8) -> Self {
        assert!(channel < 32, "`channel` must be in range `0..32`");
        Self {
            channel: Some((signal, channel)),
            ..self
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<Traits: KernelTraits, T: Copy + Send + 'static, const N: usize> Queue<Traits, T, N> {
    /// Append `item`, blocking while the queue is full.
    pub fn send(&'static self, item: T) -> Result<(), WaitError> {
        self.free.wait(None).map_err(expect_not_timeout)?;
        self.commit_send(item);
        Ok(())
    }

    /// [`send`](Self::send) with a timeout measured in ticks.
    pub fn send_or_timeout(&'static self, item: T, ticks: u32) -> Result<(), WaitTimeoutError> {
        self.free.wait(Some(ticks))?;
        self.commit_send(item);
        Ok(())
    }

    /// Append `item` if there's a free slot. Returns `false` if the queue is
    /// full. ISR-safe.
    pub fn try_send(&'static self, item: T) -> bool {
        if self.free.try_take().is_none() {
            return false;
        }
        self.commit_send(item);
        true
    }

    /// Remove the oldest element, blocking while the queue is empty.
    pub fn receive(&'static self) -> Result<T, WaitError> {
        self.filled.wait(None).map_err(expect_not_timeout)?;
        Ok(self.commit_receive())
    }

    /// [`receive`](Self::receive) with a timeout measured in ticks.
    pub fn receive_or_timeout(&'static self, ticks: u32) -> Result<T, WaitTimeoutError> {
        self.filled.wait(Some(ticks))?;
        Ok(self.commit_receive())
    }

    /// Remove the oldest element if there's one. ISR-safe.
    pub fn try_receive(&'static self) -> Option<T> {
        self.filled.try_take()?;
        Some(self.commit_receive())
    }

    /// Get the number of elements. ISR-safe.
    pub fn len(&'static self) -> usize {
        let lock = klock::lock_irq::<Traits>();
        self.ring.read(&*lock).len
    }

    pub fn is_empty(&'static self) -> bool {
        self.len() == 0
    }

    /// Called after a unit of `free` is taken.
    fn commit_send(&'static self, item: T) {
        {
            let mut lock = klock::lock_irq::<Traits>();
            self.ring.write(&mut *lock).push(item);
        }

        self.filled.post(1);

        if let Some((signal, channel)) = self.channel {
            signal.raise(1 << channel);
        }
    }

    /// Called after a unit of `filled` is taken.
    fn commit_receive(&'static self) -> T {
        let item = {
            let mut lock = klock::lock_irq::<Traits>();
            // Safety: The unit of `filled` we took accounts for an element
            unsafe { self.ring.write(&mut *lock).pop() }
        };

        self.free.post(1);

        // Keep the channel's bit raised while there's something left so that a
        // multi-queue consumer comes back to this queue
        if let Some((signal, channel)) = self.channel {
            if self.filled.value() != 0 {
                signal.raise(1 << channel);
            }
        }

        item
    }
}

impl<Traits: KernelTraits, T, const N: usize> fmt::Debug for Queue<Traits, T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("self", &(self as *const _))
            .field("capacity", &N)
            .field("filled", &self.filled.value())
            .field("channel", &self.channel.map(|(_, ch)| ch))
            .finish_non_exhaustive()
    }
}

/// Wait until one of the queues bound to `signal` has data, and return the
/// lowest channel number that does.
///
/// `pending` holds the channels that were reported by the signal but haven't
/// been returned yet. It should start at `0` and be passed unchanged to every
/// call by the one consumer of `signal`. The caller is expected to take one
/// element from the returned channel's queue with `try_receive`.
pub fn wait_on_multi_queue<Traits: KernelTraits>(
    signal: &'static Signal<Traits>,
    pending: &mut u32,
) -> Result<u32, WaitError> {
    *pending |= signal.poll();
    if *pending == 0 {
        *pending = signal.wait()?;
    }
    Ok(take_lowest_channel(pending))
}

/// [`wait_on_multi_queue`] with a timeout measured in ticks.
pub fn wait_on_multi_queue_or_timeout<Traits: KernelTraits>(
    signal: &'static Signal<Traits>,
    pending: &mut u32,
    ticks: u32,
) -> Result<u32, WaitTimeoutError> {
    *pending |= signal.poll();
    if *pending == 0 {
        *pending = signal.wait_or_timeout(ticks)?;
    }
    Ok(take_lowest_channel(pending))
}

fn take_lowest_channel(pending: &mut u32) -> u32 {
    debug_assert_ne!(*pending, 0);
    let channel = pending.trailing_zeros();
    *pending &= !(1 << channel);
    channel
}
