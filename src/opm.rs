use crate::clock::{self, Bus, BusClock};
use crate::sleep::DeepSleepLock;
use crate::{PulseOutError, debug, error, trace, validate_shape};

/// Burst size that every supported timer can emit in one go.
pub const DEFAULT_BATCH_SIZE: u32 = 256;

/// Hook called while waiting for a burst to finish, e.g. a thread yield.
pub type YieldFn = fn();

/// Timer peripherals a pin can be routed to.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerInstance {
    Tim1,
    Tim2,
    Tim3,
    Tim4,
    Tim5,
    Tim8,
    Tim15,
    Tim16,
    Tim17,
    Tim20,
}

impl TimerInstance {
    /// Advanced and small general purpose timers carry the RCR register.
    pub const fn has_repetition_counter(&self) -> bool {
        matches!(
            self,
            Self::Tim1 | Self::Tim8 | Self::Tim15 | Self::Tim16 | Self::Tim17 | Self::Tim20
        )
    }

    pub const fn bus(&self) -> Bus {
        match self {
            Self::Tim2 | Self::Tim3 | Self::Tim4 | Self::Tim5 => Bus::Apb1,
            _ => Bus::Apb2,
        }
    }
}

impl core::fmt::Display for TimerInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let number = match self {
            Self::Tim1 => 1,
            Self::Tim2 => 2,
            Self::Tim3 => 3,
            Self::Tim4 => 4,
            Self::Tim5 => 5,
            Self::Tim8 => 8,
            Self::Tim15 => 15,
            Self::Tim16 => 16,
            Self::Tim17 => 17,
            Self::Tim20 => 20,
        };
        write!(f, "TIM{}", number)
    }
}

/// Timer channels able to drive a one-pulse output.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Ch1,
    Ch2,
}

impl Channel {
    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::Ch1),
            2 => Some(Self::Ch2),
            _ => None,
        }
    }
}

/// Which of the channel's outputs a pin is wired to.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// CHx
    Normal,
    /// CHxN
    Complementary,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    Up,
    Down,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

/// Time base settings written by [`OnePulseTimer::init_one_pulse`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub prescaler: u16,
    pub period: u16,
    /// Number of extra periods before the counter stops
    pub repetition_counter: u16,
    pub counter_mode: CounterMode,
    /// CKD division factor, 1, 2 or 4
    pub clock_division: u8,
    pub auto_reload_preload: bool,
}

/// PWM mode 1 output compare settings.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputCompare {
    /// Compare value, the output switches to its pulse level here
    pub pulse: u16,
    pub polarity: Polarity,
    pub complementary_polarity: Polarity,
    pub fast_mode: bool,
    pub idle_high: bool,
}

/// Result of looking a pin up in the board's timer routing table.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinRoute {
    pub timer: TimerInstance,
    /// Channel number as listed in the routing table, 1 based
    pub channel: u8,
    /// Pin is the complementary CHxN output
    pub inverted: bool,
    /// Alternate function selector for the pin
    pub function: u8,
}

/// Board services needed to claim a timer channel for a pin.
pub trait TimerPlatform {
    type Pin: Copy;
    type Timer: OnePulseTimer;

    fn route(&self, pin: Self::Pin) -> Option<PinRoute>;

    /// Returns `false` if the platform does not know this timer.
    fn enable_clock(&mut self, timer: TimerInstance) -> bool;

    fn configure_pin(&mut self, pin: Self::Pin, function: u8);

    fn take_timer(&mut self, timer: TimerInstance) -> Self::Timer;
}

/// Register level access to one timer peripheral.
pub trait OnePulseTimer {
    fn disable_counter(&mut self);

    fn enable_counter(&mut self);

    /// The counter clears its enable bit by itself at the end of a burst.
    fn counter_enabled(&self) -> bool;

    fn bus_clock(&self, bus: Bus) -> BusClock;

    fn init_one_pulse(&mut self, time_base: &TimeBase) -> Result<(), PulseOutError>;

    fn configure_channel(
        &mut self,
        channel: Channel,
        compare: &OutputCompare,
    ) -> Result<(), PulseOutError>;

    fn start(&mut self, channel: Channel, output: OutputKind) -> Result<(), PulseOutError>;

    fn set_repetition_counter(&mut self, value: u16);

    /// Forces an update event so preloaded registers take effect.
    fn generate_update(&mut self);

    /// Largest burst the repetition counter can express.
    ///
    /// 65536 on the advanced timers of F3/F7/G0/G4/L4/L5/U5/H7 parts.
    fn max_repetitions(&self) -> u32 {
        DEFAULT_BATCH_SIZE
    }

    /// Returns the peripheral to the board.
    fn free(&mut self) {}
}

/// Splits a pulse count into hardware sized bursts.
#[derive(Debug, Clone)]
pub struct Batches {
    remaining: u32,
    batch_size: u32,
}

impl Batches {
    pub const fn new(total: u32, batch_size: u32) -> Self {
        Self {
            remaining: total,
            batch_size,
        }
    }
}

impl Iterator for Batches {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 || self.batch_size == 0 {
            return None;
        }
        let batch = self.remaining.min(self.batch_size);
        self.remaining -= batch;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = match self.batch_size {
            0 => 0,
            size => self.remaining.div_ceil(size) as usize,
        };
        (count, Some(count))
    }
}

impl ExactSizeIterator for Batches {}

/// Pulse generator based on the timer one-pulse mode.
///
/// Once started the hardware emits the whole burst without interrupts or DMA.
/// Only channel 1 and 2 of the timers with a repetition counter (TIM1, TIM8,
/// TIM15, TIM16, TIM17 and TIM20) can be used. Deep sleep is locked for the
/// lifetime of the instance.
pub struct OpmPulseOut<T: OnePulseTimer, P> {
    timer: T,
    pin: P,
    route: PinRoute,
    period_us: u32,
    width_us: u32,
    prescaler: u32,
    yield_fn: YieldFn,
    _sleep_lock: DeepSleepLock,
}

impl<T: OnePulseTimer, P: Copy> OpmPulseOut<T, P> {
    /// Claims the timer channel behind `pin`.
    pub fn new<B>(platform: &mut B, pin: P) -> Result<Self, PulseOutError>
    where
        B: TimerPlatform<Pin = P, Timer = T>,
    {
        let route = platform.route(pin).ok_or_else(|| {
            error!("pin has no timer function");
            PulseOutError::UnroutablePin
        })?;

        if !route.timer.has_repetition_counter() || !platform.enable_clock(route.timer) {
            error!("{} cannot run in one-pulse mode", route.timer);
            return Err(PulseOutError::UnsupportedTimer);
        }

        platform.configure_pin(pin, route.function);
        let timer = platform.take_timer(route.timer);

        debug!(
            "claimed {} channel {} (inverted: {})",
            route.timer, route.channel, route.inverted
        );

        Ok(Self {
            timer,
            pin,
            route,
            period_us: 0,
            width_us: 0,
            prescaler: 1,
            yield_fn: core::hint::spin_loop,
            _sleep_lock: DeepSleepLock::acquire(),
        })
    }

    /// Replaces the hook run between completion polls.
    #[must_use]
    pub fn with_yield(mut self, yield_fn: YieldFn) -> Self {
        self.yield_fn = yield_fn;
        self
    }

    pub fn pin(&self) -> P {
        self.pin
    }

    pub fn route(&self) -> &PinRoute {
        &self.route
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn period_us(&self) -> u32 {
        self.period_us
    }

    pub fn width_us(&self) -> u32 {
        self.width_us
    }

    /// Software prescaler chosen by the last configuration.
    pub fn prescaler(&self) -> u32 {
        self.prescaler
    }

    fn check_count(&self, count: u32) -> Result<u16, PulseOutError> {
        let max = self.timer.max_repetitions();
        if count == 0 || count > max {
            error!("burst of {} pulses outside 1..={}", count, max);
            return Err(PulseOutError::InvalidCount);
        }

        u16::try_from(count - 1).map_err(|_| {
            error!("burst of {} pulses exceeds the repetition counter", count);
            PulseOutError::InvalidCount
        })
    }

    /// Programs the pulse shape and starts a burst of `count` pulses.
    ///
    /// Returns immediately; the burst runs on its own. `count` must be within
    /// `1..=max_repetitions()`.
    pub fn configure_and_start(
        &mut self,
        period_us: u32,
        width_us: u32,
        count: u32,
    ) -> Result<(), PulseOutError> {
        validate_shape(period_us, width_us)?;
        let repetition_counter = self.check_count(count)?;

        self.timer.disable_counter();
        // Cleared until the new shape is fully programmed.
        self.period_us = 0;

        let clock = self.timer.bus_clock(self.route.timer.bus());
        let params = clock::solve(clock, period_us)?;

        self.timer.init_one_pulse(&TimeBase {
            prescaler: params.prescaler_register,
            period: params.period_register,
            repetition_counter,
            counter_mode: CounterMode::Up,
            clock_division: 1,
            auto_reload_preload: false,
        })?;

        // Output is low until the compare match, then high to the end of
        // the period.
        let ticks = u64::from(params.period_register) + 1;
        let pulse = u64::from(period_us - width_us) * ticks / u64::from(period_us);
        let compare = OutputCompare {
            pulse: pulse as u16,
            polarity: Polarity::ActiveLow,
            complementary_polarity: Polarity::ActiveHigh,
            fast_mode: false,
            idle_high: false,
        };

        let channel = Channel::from_number(self.route.channel).ok_or_else(|| {
            error!("channel {} does not support one-pulse mode", self.route.channel);
            PulseOutError::UnsupportedChannel
        })?;

        self.timer.configure_channel(channel, &compare)?;

        let output = if self.route.inverted {
            OutputKind::Complementary
        } else {
            OutputKind::Normal
        };
        self.timer.start(channel, output)?;

        self.period_us = period_us;
        self.width_us = width_us;
        self.prescaler = params.prescaler;

        debug!(
            "{}: {} x {}/{} us, psc {} arr {} ccr {}",
            self.route.timer,
            count,
            width_us,
            period_us,
            params.prescaler_register,
            params.period_register,
            compare.pulse
        );

        Ok(())
    }

    /// Starts another burst with the shape of the last
    /// [`configure_and_start`](Self::configure_and_start).
    ///
    /// The previous burst must have completed.
    pub fn continue_burst(&mut self, count: u32) -> Result<(), PulseOutError> {
        if self.period_us == 0 {
            error!("burst continued before configuration");
            return Err(PulseOutError::NotInitialized);
        }
        let repetition_counter = self.check_count(count)?;

        self.timer.set_repetition_counter(repetition_counter);
        self.timer.generate_update();
        self.timer.enable_counter();

        trace!("{}: {} more pulses", self.route.timer, count);
        Ok(())
    }

    /// Blocks until the hardware stops the counter at the end of the burst.
    pub fn wait_for_completion(&self) {
        while self.timer.counter_enabled() {
            (self.yield_fn)();
        }
    }

    /// Emits `total_count` pulses in bursts of [`DEFAULT_BATCH_SIZE`].
    ///
    /// Blocks for the whole train.
    pub fn emit(
        &mut self,
        period_us: u32,
        width_us: u32,
        total_count: u32,
    ) -> Result<(), PulseOutError> {
        self.emit_in_batches(period_us, width_us, total_count, DEFAULT_BATCH_SIZE)
    }

    /// Emits `total_count` pulses in bursts of at most `batch_size`.
    ///
    /// The first burst programs the timer, the rest only reload the
    /// repetition counter. Blocks for the whole train.
    pub fn emit_in_batches(
        &mut self,
        period_us: u32,
        width_us: u32,
        total_count: u32,
        batch_size: u32,
    ) -> Result<(), PulseOutError> {
        if total_count == 0 {
            return Ok(());
        }
        if batch_size == 0 || batch_size > self.timer.max_repetitions() {
            error!("batch size {} not supported by {}", batch_size, self.route.timer);
            return Err(PulseOutError::InvalidCount);
        }

        let mut batches = Batches::new(total_count, batch_size);
        if let Some(first) = batches.next() {
            self.configure_and_start(period_us, width_us, first)?;
            self.wait_for_completion();
        }

        for batch in batches {
            self.continue_burst(batch)?;
            self.wait_for_completion();
        }

        Ok(())
    }
}

impl<T: OnePulseTimer, P> Drop for OpmPulseOut<T, P> {
    fn drop(&mut self) {
        self.timer.disable_counter();
        self.timer.free();
        debug!("released {}", self.route.timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_split_long_train() {
        let batches: Vec<u32> = Batches::new(1000, 256).collect();
        assert_eq!(batches, [256, 256, 256, 232]);
    }

    #[test]
    fn batches_exact_multiple() {
        let batches = Batches::new(512, 256);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.collect::<Vec<_>>(), [256, 256]);
    }

    #[test]
    fn batches_short_train() {
        assert_eq!(Batches::new(3, 256).collect::<Vec<_>>(), [3]);
        assert_eq!(Batches::new(0, 256).count(), 0);
    }

    #[test]
    fn batches_sum_to_total() {
        for (total, size) in [(1, 1), (7, 3), (65_537, 65_536), (100_000, 256)] {
            let batches = Batches::new(total, size);
            let expected = total.div_ceil(size) as usize;
            assert_eq!(batches.len(), expected);
            let all: Vec<u32> = batches.collect();
            assert_eq!(all.len(), expected);
            assert_eq!(all.iter().sum::<u32>(), total);
            assert!(all.iter().all(|&b| b <= size));
        }
    }

    #[test]
    fn repetition_counter_timers() {
        assert!(TimerInstance::Tim1.has_repetition_counter());
        assert!(TimerInstance::Tim17.has_repetition_counter());
        assert!(!TimerInstance::Tim2.has_repetition_counter());
        assert_eq!(TimerInstance::Tim3.bus(), Bus::Apb1);
        assert_eq!(TimerInstance::Tim8.bus(), Bus::Apb2);
    }
}
