//! The simulated tick timer
use mos_portkit::tickless::ReloadTimer;

/// A 24-bit down-counting reload timer modeled after Arm SysTick, clocked by
/// simulated CPU cycles.
#[derive(Debug)]
pub(crate) struct SimTimer {
    value: u32,
    reload: u32,
    enabled: bool,
    /// `COUNTFLAG`
    wrapped: bool,
    /// The timer interrupt is pending.
    pending: bool,
}

impl SimTimer {
    pub(crate) const fn new() -> Self {
        Self {
            value: 0,
            reload: 0,
            enabled: false,
            wrapped: false,
            pending: false,
        }
    }

    /// Get the number of cycles until the counter wraps next. Returns `None`
    /// if the counter is stopped.
    pub(crate) fn cycles_to_wrap(&self) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        match self.value {
            0 if self.reload == 0 => None,
            0 => Some(self.reload + 1),
            value => Some(value),
        }
    }

    /// Advance the counter by `cycles` cycles.
    pub(crate) fn advance(&mut self, mut cycles: u32) {
        while self.enabled && cycles > 0 {
            if self.value == 0 {
                if self.reload == 0 {
                    // The counter stays at zero, like the real thing
                    break;
                }
                self.value = self.reload;
                cycles -= 1;
                continue;
            }

            let step = cycles.min(self.value);
            self.value -= step;
            cycles -= step;

            if self.value == 0 {
                self.wrapped = true;
                self.pending = true;
            }
        }
    }

    /// Acknowledge the timer interrupt. Returns `true` if it was pending.
    pub(crate) fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }
}

impl ReloadTimer for SimTimer {
    const MAX_RELOAD: u32 = 0xff_ffff;

    fn current(&mut self) -> u32 {
        self.value
    }

    fn take_wrapped(&mut self) -> bool {
        std::mem::take(&mut self.wrapped)
    }

    fn set_reload(&mut self, reload: u32) {
        debug_assert!(reload <= Self::MAX_RELOAD);
        self.reload = reload;
    }

    fn restart(&mut self) {
        self.value = 0;
        self.wrapped = false;
        self.pending = false;
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mos_portkit::tickless::{TicklessCfg, TicklessState};
    use std::num::NonZeroU32;

    #[test]
    fn period_is_reload_plus_one() {
        let mut timer = SimTimer::new();
        timer.set_reload(9);
        timer.restart();
        timer.set_enabled(true);

        assert_eq!(timer.cycles_to_wrap(), Some(10));
        timer.advance(9);
        assert!(!timer.take_pending());
        timer.advance(1);
        assert!(timer.take_pending());
        assert!(timer.take_wrapped());

        // The next period is as long
        assert_eq!(timer.cycles_to_wrap(), Some(10));
        timer.advance(25);
        assert!(timer.take_wrapped());
        assert_eq!(timer.current(), 5);
    }

    #[test]
    fn stopped_timer_doesnt_count() {
        let mut timer = SimTimer::new();
        timer.set_reload(9);
        assert_eq!(timer.cycles_to_wrap(), None);
        timer.advance(100);
        assert_eq!(timer.current(), 0);
        assert!(!timer.take_pending());
    }

    #[test]
    fn tickless_driver_counts_ticks() {
        const CFG: TicklessCfg = TicklessCfg::new(100, 1, SimTimer::MAX_RELOAD, 0);
        let mut timer = SimTimer::new();
        let mut tickless = TicklessState::new();

        // The next interrupt should come in 3 ticks
        assert_eq!(tickless.set_tick_interval(&CFG, &mut timer, NonZeroU32::new(3)), 0);
        assert_eq!(timer.cycles_to_wrap(), Some(300));

        timer.advance(150);
        assert_eq!(tickless.elapsed_ticks(&CFG, &mut timer), 1);

        let to_wrap = timer.cycles_to_wrap().unwrap();
        assert_eq!(to_wrap, 150);
        timer.advance(to_wrap);
        assert!(timer.take_pending());
        assert_eq!(tickless.elapsed_ticks(&CFG, &mut timer), 2);

        // Stop the timer in the middle of a tick. The partial tick is kept.
        timer.advance(40);
        assert_eq!(tickless.set_tick_interval(&CFG, &mut timer, None), 0);
        timer.advance(1000);
        assert_eq!(tickless.elapsed_ticks(&CFG, &mut timer), 0);

        assert_eq!(tickless.set_tick_interval(&CFG, &mut timer, NonZeroU32::new(1)), 0);
        assert_eq!(timer.cycles_to_wrap(), Some(60));
    }
}
