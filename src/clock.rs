//! Prescaler and period register solver for 16-bit timers.
//!
//! The timer counts in whole microseconds whenever the registers allow it.
//! Long periods do not fit, so a software prescaler is doubled until both
//! registers fit again, trading resolution for range: the produced period is
//! `(period_register + 1) * prescaler`, which overshoots the request by less
//! than `prescaler` microseconds.

use crate::{PulseOutError, error};

/// Largest value the prescaler and auto-reload registers can hold.
pub const REGISTER_MAX: u32 = 0xFFFF;

/// Upper bound on prescaler doublings. Any `u32` period fits the period
/// register after this many halvings.
const MAX_DOUBLINGS: u32 = 16;

const HZ_PER_MHZ: u32 = 1_000_000;

/// Peripheral bus a timer is clocked from.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Apb1,
    Apb2,
}

/// APB prescaler setting relative to the AHB clock.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApbDivider {
    /// HCLK is passed through, timers run at PCLK
    Bypassed,
    /// HCLK is divided, the timer clock multiplier doubles PCLK
    Divided,
}

/// Current configuration of one peripheral bus.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusClock {
    pub pclk_hz: u32,
    pub divider: ApbDivider,
}

impl BusClock {
    pub const fn new(pclk_hz: u32, divider: ApbDivider) -> Self {
        Self { pclk_hz, divider }
    }

    /// Frequency seen by the timer counter input.
    pub const fn timer_clock_hz(&self) -> u64 {
        match self.divider {
            ApbDivider::Bypassed => self.pclk_hz as u64,
            ApbDivider::Divided => self.pclk_hz as u64 * 2,
        }
    }
}

/// Register values for one period setting.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockParams {
    /// Microseconds per counter tick
    pub prescaler: u32,
    /// Hardware prescaler register (division factor minus one)
    pub prescaler_register: u16,
    /// Auto-reload register (ticks per period minus one)
    pub period_register: u16,
}

impl ClockParams {
    /// Period the timer will actually produce, in microseconds.
    pub const fn effective_period_us(&self) -> u64 {
        (self.period_register as u64 + 1) * self.prescaler as u64
    }
}

/// Finds the finest prescaler/period pair for `period_us`.
///
/// Starts from a 1 us tick and doubles the software prescaler while either
/// register overflows. Fails with [`PulseOutError::ClockOutOfRange`] as soon
/// as the period fits but the prescaler no longer does, and with
/// [`PulseOutError::ClockTooSlow`] when the clock cannot produce a 1 us tick.
pub fn solve(clock: BusClock, period_us: u32) -> Result<ClockParams, PulseOutError> {
    if period_us == 0 {
        error!("zero period requested");
        return Err(PulseOutError::InvalidPulse);
    }

    let ticks_per_us = clock.timer_clock_hz() / HZ_PER_MHZ as u64;
    if ticks_per_us == 0 {
        error!("timer clock {} Hz is below 1 MHz", clock.pclk_hz);
        return Err(PulseOutError::ClockTooSlow);
    }

    let max = REGISTER_MAX as u64;
    let mut prescaler: u64 = 1;
    let mut prescaler_register = ticks_per_us - 1;
    let mut period_register = period_us as u64 - 1;
    let mut doublings = 0;

    while period_register > max || prescaler_register > max {
        if doublings == MAX_DOUBLINGS {
            error!("period {} us does not fit after {} doublings", period_us, doublings);
            return Err(PulseOutError::ClockOutOfRange);
        }
        doublings += 1;

        prescaler *= 2;
        prescaler_register = ticks_per_us * prescaler - 1;
        period_register = (period_us as u64 - 1) / prescaler;

        // The period only shrinks and the prescaler only grows from here.
        if period_register <= max && prescaler_register > max {
            error!("cannot fit {} us period with a {} MHz tick", period_us, ticks_per_us);
            return Err(PulseOutError::ClockOutOfRange);
        }
    }

    Ok(ClockParams {
        prescaler: prescaler as u32,
        prescaler_register: prescaler_register as u16,
        period_register: period_register as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const F72: BusClock = BusClock::new(72_000_000, ApbDivider::Bypassed);

    #[test]
    fn short_period_uses_microsecond_tick() {
        let params = solve(F72, 4).unwrap();
        assert_eq!(
            params,
            ClockParams {
                prescaler: 1,
                prescaler_register: 71,
                period_register: 3,
            }
        );
        assert_eq!(params.effective_period_us(), 4);
    }

    #[test]
    fn divided_bus_doubles_timer_clock() {
        let clock = BusClock::new(36_000_000, ApbDivider::Divided);
        assert_eq!(clock.timer_clock_hz(), 72_000_000);
        let params = solve(clock, 4).unwrap();
        assert_eq!(params.prescaler_register, 71);
    }

    #[test]
    fn largest_direct_period() {
        let params = solve(F72, 65_536).unwrap();
        assert_eq!(params.prescaler, 1);
        assert_eq!(params.period_register, 0xFFFF);
    }

    #[test]
    fn long_period_doubles_prescaler() {
        // 72 * 2 - 1 = 143, (100_000 - 1) / 2 = 49_999
        let params = solve(F72, 100_000).unwrap();
        assert_eq!(params.prescaler, 2);
        assert_eq!(params.prescaler_register, 143);
        assert_eq!(params.period_register, 49_999);
        assert_eq!(params.effective_period_us(), 100_000);
    }

    #[test]
    fn truncation_error_stays_below_prescaler() {
        for clock_hz in [8_000_000, 16_000_000, 48_000_000, 72_000_000, 170_000_000] {
            let clock = BusClock::new(clock_hz, ApbDivider::Bypassed);
            for period_us in [1, 2, 3, 999, 65_535, 65_537, 131_071, 200_001, 1_000_003] {
                let Ok(params) = solve(clock, period_us) else {
                    continue;
                };
                let effective = params.effective_period_us();
                assert!(u32::from(params.prescaler_register) <= REGISTER_MAX);
                assert!(u32::from(params.period_register) <= REGISTER_MAX);
                assert!(effective >= u64::from(period_us));
                assert!(effective - u64::from(period_us) < u64::from(params.prescaler));
            }
        }
    }

    #[test]
    fn fast_clock_cannot_reach_long_period() {
        // 170 ticks per us: the prescaler overflows at x512, the period only fits at x1024
        let clock = BusClock::new(170_000_000, ApbDivider::Bypassed);
        assert_eq!(solve(clock, 40_000_000), Err(PulseOutError::ClockOutOfRange));
    }

    #[test]
    fn very_fast_clock_runs_out_of_prescaler() {
        // 8589 ticks per us: the prescaler register overflows at x8
        let clock = BusClock::new(u32::MAX, ApbDivider::Divided);
        assert!(solve(clock, 10).is_ok());
        assert_eq!(solve(clock, 1_000_000), Err(PulseOutError::ClockOutOfRange));
    }

    #[test]
    fn sub_megahertz_clock_is_rejected() {
        let clock = BusClock::new(500_000, ApbDivider::Bypassed);
        assert_eq!(solve(clock, 10), Err(PulseOutError::ClockTooSlow));
    }

    #[test]
    fn zero_period_is_rejected() {
        assert_eq!(solve(F72, 0), Err(PulseOutError::InvalidPulse));
    }
}
