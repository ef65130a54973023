//! The adaptive tick state machine for a down-counting reload timer.
//!
//! The kernel asks the port for two things: how many whole ticks have elapsed
//! since the last report, and to deliver the next tick interrupt a given
//! number of ticks after the last tick boundary (or never). This module
//! implements both on top of a timer that counts down to zero and reloads
//! itself, like Arm SysTick:
//!
//! ```text
//!  counter   ╲      ╲         ╲      ╲
//!              ╲      ╲         ╲      ╲
//!  flag/IRQ     ↑      ↑         ↑      ↑
//!           ├──────┼──────┼─────────┼──────┤
//!  period      first  steady  ...
//! ```
//!
//! The state machine keeps exact cycle accounting across reprogramming:
//!
//!  - **Stopped**: The counter is disabled. Ticks don't advance. The cycles
//!    of the partial tick at the moment of stopping are kept as `carry`.
//!  - **Running**: The counter is enabled. `offset` is the number of
//!    accounted cycles between the last reported tick boundary and the start
//!    of the current hardware period. `period` is the length of the current
//!    period, `reload` the length of the next one, and `steady` the length
//!    requested for subsequent ones. A reprogram restarts the counter with a
//!    shortened `first` period that ends exactly at the requested tick
//!    boundary, and the reload is switched to `steady` as soon as it's safe.
//!
//! # Race handling
//!
//! The counter value and the wrap flag can't be read atomically. The flag is
//! read *after* the value. If it's clear, no wrap happened before the value
//! was read. If it's set, the value might be from either side of the wrap, so
//! the value is read again (it's now certainly from the new period).
//!
//! Restarting the counter clears the wrap flag, so the counter must not be
//! restarted while a wrap is imminent. If fewer than `headroom` cycles remain
//! in the current period, the state machine keeps observing the counter until
//! the wrap has been accounted for. Similarly, the reload value is only
//! changed when at least `headroom` cycles remain, and a new period is never
//! shorter than `headroom` cycles (the requested boundary is pushed back by a
//! tick instead).
//!
//! Both rely on the following, which the port must guarantee: `headroom`
//! covers the few instructions between reading the counter and writing it,
//! and the timer is observed (by the tick interrupt handler, at worst) at
//! least once per hardware period.
use core::num::NonZeroU32;

/// A down-counting reload timer, e.g., Arm SysTick.
///
/// The counter counts down to zero. The transition from one to zero sets the
/// wrap flag (and raises an interrupt), and on the next cycle the counter
/// loads the reload value. A period is therefore `reload + 1` cycles long.
pub trait ReloadTimer {
    /// The largest reload value the timer accepts.
    const MAX_RELOAD: u32;

    /// Read the counter.
    fn current(&mut self) -> u32;

    /// Read and clear the wrap flag.
    fn take_wrapped(&mut self) -> bool;

    /// Set the value the counter loads at the next reload.
    fn set_reload(&mut self, reload: u32);

    /// Clear the counter and the wrap flag. The counter loads the reload
    /// value on the next cycle.
    fn restart(&mut self);

    fn set_enabled(&mut self, enabled: bool);
}

/// The precomputed parameters of [`TicklessState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicklessCfg {
    cycles_per_tick: u32,
    headroom: u32,
    max_tick_interval: u32,
}

impl TicklessCfg {
    /// Construct a `TicklessCfg`.
    ///
    /// `frequency` is the counter's clock frequency in hertz. The tick period
    /// is rounded down to a whole number of cycles. `headroom` is measured in
    /// cycles and must be shorter than a tick.
    pub const fn new(frequency: u64, ticks_per_second: u32, max_reload: u32, headroom: u32) -> Self {
        if ticks_per_second == 0 {
            panic!("`ticks_per_second` must not be zero");
        }

        let cycles_per_tick = frequency / ticks_per_second as u64;
        let max_period = max_reload as u64 + 1;

        if cycles_per_tick < 2 {
            panic!("the timer frequency is too low for the tick rate");
        } else if cycles_per_tick * 2 > max_period {
            panic!("the timer frequency is too high; two ticks must fit in the counter");
        } else if headroom as u64 >= cycles_per_tick {
            panic!("`headroom` must be shorter than a tick");
        }

        Self {
            cycles_per_tick: cycles_per_tick as u32,
            headroom,
            max_tick_interval: (max_period / cycles_per_tick) as u32,
        }
    }

    pub const fn cycles_per_tick(&self) -> u32 {
        self.cycles_per_tick
    }

    /// The largest tick interval [`TicklessState::set_tick_interval`]
    /// accepts. Suitable for `PortTimer::MAX_TICK_INTERVAL`.
    pub const fn max_tick_interval(&self) -> u32 {
        self.max_tick_interval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped {
        carry: u32,
    },
    Running {
        offset: i64,
        period: u32,
        reload: u32,
        steady: u32,
    },
}

/// The state of the adaptive tick timer. See the [module-level
/// documentation](self).
#[derive(Debug, Clone, Copy)]
pub struct TicklessState {
    phase: Phase,
}

impl Default for TicklessState {
    fn default() -> Self {
        Self::new()
    }
}

impl TicklessState {
    /// Construct a `TicklessState` in the stopped state. The counter must be
    /// disabled.
    pub const fn new() -> Self {
        Self {
            phase: Phase::Stopped { carry: 0 },
        }
    }

    /// Implements `PortTimer::elapsed_ticks`.
    pub fn elapsed_ticks(&mut self, cfg: &TicklessCfg, hw: &mut impl ReloadTimer) -> u32 {
        let cycles = self.observe(cfg, hw);
        self.report(cfg, cycles)
    }

    /// Implements `PortTimer::set_tick_interval`. Intervals longer than
    /// [`TicklessCfg::max_tick_interval`] are clamped.
    pub fn set_tick_interval(
        &mut self,
        cfg: &TicklessCfg,
        hw: &mut impl ReloadTimer,
        interval: Option<NonZeroU32>,
    ) -> u32 {
        let mut elapsed = 0;

        // The cycles elapsed since the last tick boundary
        let carry = match self.phase {
            Phase::Stopped { carry } => carry,
            Phase::Running { .. } => loop {
                let cycles = self.observe(cfg, hw);
                elapsed += self.report(cfg, cycles);

                let Phase::Running { offset, period, .. } = self.phase else {
                    unreachable!()
                };
                if period - cycles > cfg.headroom {
                    break (offset + i64::from(cycles)) as u32;
                }

                // A wrap is imminent. Wait for it.
            },
        };
        debug_assert!(carry < cfg.cycles_per_tick);

        match interval {
            None => {
                hw.set_enabled(false);
                self.phase = Phase::Stopped { carry };
            }
            Some(interval) => {
                let interval = interval.get().min(cfg.max_tick_interval);
                let steady = interval * cfg.cycles_per_tick;

                let mut first = steady - carry;
                if first <= cfg.headroom.max(1) {
                    // The boundary is too close to make it. Take the next one.
                    first += cfg.cycles_per_tick;
                }

                hw.set_reload(first - 1);
                hw.restart();
                hw.set_enabled(true);

                self.phase = Phase::Running {
                    offset: i64::from(carry),
                    period: first,
                    reload: first,
                    steady,
                };
            }
        }

        elapsed
    }

    /// Read the counter, accounting for a wrap if there was one. Returns the
    /// number of cycles elapsed in the current period.
    fn observe(&mut self, cfg: &TicklessCfg, hw: &mut impl ReloadTimer) -> u32 {
        let Phase::Running {
            offset,
            period,
            reload,
            steady,
        } = &mut self.phase
        else {
            return 0;
        };

        let mut value = hw.current();
        if hw.take_wrapped() {
            *offset += i64::from(*period);
            *period = *reload;
            value = hw.current();
        }

        let cycles = if value == 0 { 0 } else { *period - value };

        // `value == 0` might mean the counter is about to load `reload`, in
        // which case changing it now would be racy
        if *reload != *steady && value != 0 && *period - cycles > cfg.headroom {
            hw.set_reload(*steady - 1);
            *reload = *steady;
        }

        cycles
    }

    /// Convert the cycles elapsed since the last tick boundary into whole
    /// ticks and move the boundary forward.
    fn report(&mut self, cfg: &TicklessCfg, cycles: u32) -> u32 {
        let Phase::Running { offset, .. } = &mut self.phase else {
            return 0;
        };

        let since_boundary = *offset + i64::from(cycles);
        debug_assert!(since_boundary >= 0);

        let ticks = since_boundary / i64::from(cfg.cycles_per_tick);
        *offset -= ticks * i64::from(cfg.cycles_per_tick);
        ticks as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A cycle-accurate model of a down-counting reload timer.
    #[derive(Debug)]
    struct SimTimer<const MAX_RELOAD: u32> {
        enabled: bool,
        value: u32,
        reload: u32,
        wrapped: bool,
        /// The number of cycles counted while enabled.
        time: u64,
        /// The time of the last `current` call.
        last_read: u64,
        /// The cycles the state machine couldn't account for because they
        /// passed between a read and a restart.
        lost: u64,
        /// The cycles that pass between reading the counter and reading the
        /// wrap flag, consumed one by one.
        latencies: VecDeque<u32>,
    }

    impl<const MAX_RELOAD: u32> SimTimer<MAX_RELOAD> {
        fn new() -> Self {
            Self {
                enabled: false,
                value: 0,
                reload: 0,
                wrapped: false,
                time: 0,
                last_read: 0,
                lost: 0,
                latencies: VecDeque::new(),
            }
        }

        /// Advance the clock by up to `cycles` cycles. Stops short of a
        /// second unobserved wrap, which the state machine can't detect.
        fn advance(&mut self, mut cycles: u64) {
            while cycles > 0 && self.enabled {
                if self.value == 0 {
                    self.value = self.reload;
                    self.time += 1;
                    cycles -= 1;
                } else if cycles < u64::from(self.value) {
                    self.value -= cycles as u32;
                    self.time += cycles;
                    cycles = 0;
                } else if self.wrapped {
                    let to_wrap = u64::from(self.value) - 1;
                    self.value -= to_wrap as u32;
                    self.time += to_wrap;
                    break;
                } else {
                    self.time += u64::from(self.value);
                    cycles -= u64::from(self.value);
                    self.value = 0;
                    self.wrapped = true;
                }
            }
        }

        /// The cycles until the next wrap flag.
        fn cycles_to_wrap(&self) -> u64 {
            if self.value == 0 {
                u64::from(self.reload) + 1
            } else {
                u64::from(self.value)
            }
        }
    }

    impl<const MAX_RELOAD: u32> ReloadTimer for SimTimer<MAX_RELOAD> {
        const MAX_RELOAD: u32 = MAX_RELOAD;

        fn current(&mut self) -> u32 {
            self.last_read = self.time;
            self.value
        }

        fn take_wrapped(&mut self) -> bool {
            // Guarantee progress for spinning readers
            let latency = self.latencies.pop_front().unwrap_or(1);
            self.advance(u64::from(latency));
            std::mem::replace(&mut self.wrapped, false)
        }

        fn set_reload(&mut self, reload: u32) {
            assert!(reload <= MAX_RELOAD);
            assert!(reload > 0);
            self.reload = reload;
        }

        fn restart(&mut self) {
            if self.enabled {
                self.lost += self.time - self.last_read;
            }
            self.value = 0;
            self.wrapped = false;
        }

        fn set_enabled(&mut self, enabled: bool) {
            if self.enabled && !enabled {
                self.lost += self.time - self.last_read;
                self.last_read = self.time;
            }
            self.enabled = enabled;
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Advance(u64),
        Elapsed { latency: u32 },
        SetInterval { interval: Option<NonZeroU32>, latency: u32 },
    }

    macro_rules! tickless_simulate {
        (
            mod $ident:ident {},
            $frequency:expr, $ticks_per_second:expr, $max_reload:expr, $headroom:expr
        ) => {
            mod $ident {
                use super::*;

                const CFG: TicklessCfg =
                    TicklessCfg::new($frequency, $ticks_per_second, $max_reload, $headroom);
                const CPT: u32 = CFG.cycles_per_tick();

                fn do_test(ops: impl IntoIterator<Item = Op>) {
                    let _ = env_logger::builder().is_test(true).try_init();
                    log::info!("CFG = {:?}", CFG);

                    let mut state = TicklessState::new();
                    let mut hw = SimTimer::<{ $max_reload }>::new();
                    let mut reported = 0u64;

                    for op in ops {
                        log::debug!("  {:?}", op);
                        match op {
                            Op::Advance(cycles) => hw.advance(cycles),
                            Op::Elapsed { latency } => {
                                hw.latencies.push_back(latency);
                                reported += u64::from(state.elapsed_ticks(&CFG, &mut hw));
                            }
                            Op::SetInterval { interval, latency } => {
                                hw.latencies.push_back(latency);
                                reported +=
                                    u64::from(state.set_tick_interval(&CFG, &mut hw, interval));
                                check_programmed(&state, &hw, interval);
                            }
                        }
                        log::trace!("    state = {:?}", state);
                        log::trace!("    hw = {:?}", hw);

                        // Never runs ahead of the hardware
                        assert!(reported * u64::from(CPT) <= hw.time);
                    }

                    hw.latencies.clear();
                    hw.latencies.push_back(0);
                    reported += u64::from(state.elapsed_ticks(&CFG, &mut hw));

                    // Every accounted cycle is reported exactly once
                    assert_eq!(reported, (hw.last_read - hw.lost) / u64::from(CPT));
                }

                /// After reprogramming, the next wrap must be at the requested
                /// tick boundary (or the one after it, if it was too close).
                fn check_programmed(
                    state: &TicklessState,
                    hw: &SimTimer<{ $max_reload }>,
                    interval: Option<NonZeroU32>,
                ) {
                    match (state.phase, interval) {
                        (Phase::Stopped { .. }, None) => assert!(!hw.enabled),
                        (Phase::Running { offset, period, .. }, Some(interval)) => {
                            assert!(hw.enabled);
                            assert_eq!(hw.cycles_to_wrap(), u64::from(period));
                            assert!(period > CFG.headroom);

                            let ticks = interval.get().min(CFG.max_tick_interval());
                            let at = offset + i64::from(period);
                            let steady = i64::from(ticks * CPT);
                            assert!(
                                at == steady || at == steady + i64::from(CPT),
                                "next wrap at {} cycles after the boundary, expected {}",
                                at,
                                steady
                            );
                        }
                        (phase, interval) => panic!("{:?} after {:?}", phase, interval),
                    }
                }

                fn interval(x: u32) -> Option<NonZeroU32> {
                    NonZeroU32::new(x)
                }

                #[test]
                fn periodic() {
                    let mut ops = vec![Op::SetInterval {
                        interval: interval(1),
                        latency: 0,
                    }];
                    for _ in 0..20 {
                        ops.push(Op::Advance(u64::from(CPT)));
                        ops.push(Op::SetInterval {
                            interval: interval(1),
                            latency: 0,
                        });
                    }
                    do_test(ops);
                }

                #[test]
                fn max_interval() {
                    let max = CFG.max_tick_interval();
                    let mut ops = vec![];
                    for _ in 0..5 {
                        ops.push(Op::SetInterval {
                            interval: interval(max),
                            latency: 0,
                        });
                        ops.push(Op::Advance(u64::from(max * CPT) - 1));
                        ops.push(Op::Elapsed { latency: 1 });
                        ops.push(Op::Advance(2));
                    }
                    do_test(ops);
                }

                #[test]
                fn stop_and_resume() {
                    do_test(vec![
                        Op::SetInterval {
                            interval: interval(2),
                            latency: 0,
                        },
                        Op::Advance(u64::from(CPT) + u64::from(CPT) / 2),
                        Op::SetInterval {
                            interval: None,
                            latency: 0,
                        },
                        Op::Advance(u64::from(CPT) * 10),
                        Op::Elapsed { latency: 0 },
                        Op::SetInterval {
                            interval: interval(1),
                            latency: 0,
                        },
                        Op::Advance(u64::from(CPT)),
                        Op::Elapsed { latency: 0 },
                    ]);
                }

                #[test]
                fn reprogram_just_before_boundary() {
                    for lead in 0..=CFG.headroom + 2 {
                        do_test(vec![
                            Op::SetInterval {
                                interval: interval(1),
                                latency: 0,
                            },
                            Op::Advance(u64::from(CPT - 1 - lead.min(CPT - 1))),
                            Op::SetInterval {
                                interval: interval(1),
                                latency: 1,
                            },
                            Op::Advance(u64::from(CPT) * 2),
                            Op::Elapsed { latency: 0 },
                        ]);
                    }
                }

                #[test]
                fn quickcheck() {
                    quickcheck::quickcheck::<fn(Vec<(u8, u32, u32)>)>(
                        |values: Vec<(u8, u32, u32)>| {
                            let max_advance =
                                u64::from(CFG.max_tick_interval()) * u64::from(CPT) * 2;
                            let max_latency = CFG.headroom * 2 + 2;
                            let ops = values.into_iter().map(|(kind, a, b)| match kind % 4 {
                                0 | 1 => Op::Advance(u64::from(a) % (max_advance + 1)),
                                2 => Op::Elapsed {
                                    latency: b % (max_latency + 1),
                                },
                                _ => Op::SetInterval {
                                    interval: interval(a % (CFG.max_tick_interval() + 2)),
                                    latency: b % (max_latency + 1),
                                },
                            });
                            do_test(
                                std::iter::once(Op::SetInterval {
                                    interval: interval(1),
                                    latency: 0,
                                })
                                .chain(ops),
                            );
                        },
                    );
                }
            }
        };
    }

    tickless_simulate!(mod sim1 {}, 2_000, 1_000, 0xf, 0);
    tickless_simulate!(mod sim2 {}, 100, 10, 0xff, 3);
    tickless_simulate!(mod sim3 {}, 32, 1, 0x3f, 5);
    tickless_simulate!(mod sim4 {}, 16_000_000, 1_000, 0xff_ffff, 64);
    tickless_simulate!(mod sim5 {}, 1_000_000, 3, 0xff_ffff, 100);

    #[test]
    #[should_panic]
    fn headroom_longer_than_tick() {
        let _ = TicklessCfg::new(1000, 100, 0xff_ffff, 10);
    }

    #[test]
    fn max_tick_interval_fits_counter() {
        let cfg = TicklessCfg::new(16_000_000, 1_000, 0xff_ffff, 64);
        assert_eq!(cfg.cycles_per_tick(), 16_000);
        assert_eq!(cfg.max_tick_interval(), 1048);
        assert!(u64::from(cfg.max_tick_interval()) * 16_000 <= 0x100_0000);
    }
}
