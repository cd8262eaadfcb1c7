use core::cell::RefCell;

use critical_section::Mutex;

use crate::slot::{OutputFactory, PulseSlot, SlotInfo};
use crate::{PulseOutError, debug, error, validate_shape};

/// Number of pulse trains that can run at the same time.
pub const DEFAULT_SLOT_COUNT: usize = 4;

/// Period of the shared tick, the time resolution of all slots.
pub const DEFAULT_TICK_INTERVAL_US: u32 = 10;

/// Index of the slot a pulse train was placed in.
pub type SlotId = usize;

/// Callback invoked when the first slot is occupied (tick should start).
///
/// # Parameters
/// - `interval_us`: tick period in microseconds
pub type TimerStartCallback = fn(u32);

/// Callback invoked when the last slot runs empty (tick can stop).
pub type TimerStopCallback = fn();

/// The periodic interrupt whose handler calls
/// [`TickerPulseOut::tick_callback`].
pub trait TickSource {
    fn start(&mut self, interval_us: u32);

    fn stop(&mut self);
}

/// [`TickSource`] made of two plain functions.
pub struct CallbackTickSource {
    start: TimerStartCallback,
    stop: TimerStopCallback,
}

impl CallbackTickSource {
    pub const fn new(start: TimerStartCallback, stop: TimerStopCallback) -> Self {
        Self { start, stop }
    }
}

impl TickSource for CallbackTickSource {
    fn start(&mut self, interval_us: u32) {
        (self.start)(interval_us);
    }

    fn stop(&mut self) {
        (self.stop)();
    }
}

struct Scheduler<F: OutputFactory, S, const N: usize> {
    factory: F,
    tick_source: S,
    running: bool,
    slots: [PulseSlot<F::Pin, F::Output>; N],
}

impl<F: OutputFactory, S: TickSource, const N: usize> Scheduler<F, S, N> {
    fn schedule(
        &mut self,
        pin: F::Pin,
        period_us: i32,
        width_us: i32,
        count: u32,
        tick_us: u32,
    ) -> Result<SlotId, PulseOutError> {
        let Some((id, slot)) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.is_occupied())
        else {
            return Err(PulseOutError::NoSlotAvailable);
        };

        slot.arm(&mut self.factory, pin, period_us, width_us, count, tick_us as i32);

        if !self.running {
            self.tick_source.start(tick_us);
            self.running = true;
            debug!("pulse ticker started at {} us", tick_us);
        }

        Ok(id)
    }

    fn tick(&mut self, tick_us: i32) {
        let mut active = false;
        for slot in self.slots.iter_mut() {
            active |= slot.tick(tick_us);
        }

        if !active && self.running {
            self.tick_source.stop();
            self.running = false;
        }
    }
}

/// Pulse generator multiplexing up to `N` GPIO outputs on one periodic tick.
///
/// Works on any pin, but every edge costs CPU time in the tick interrupt and
/// edges are quantized to `TICK_US`. Unsuitable for output frequencies of
/// 10 kHz and above.
///
/// Meant to live in a `static`; [`TickerPulseOut::init`] hands it the board's
/// outputs and tick source once at startup:
/// ```ignore
/// static PULSES: TickerPulseOut<Pins, SysTickSource> = TickerPulseOut::new();
///
/// #[exception]
/// fn SysTick() {
///     PULSES.tick_callback();
/// }
/// ```
pub struct TickerPulseOut<
    F: OutputFactory,
    S: TickSource,
    const N: usize = DEFAULT_SLOT_COUNT,
    const TICK_US: u32 = DEFAULT_TICK_INTERVAL_US,
> {
    inner: Mutex<RefCell<Option<Scheduler<F, S, N>>>>,
}

impl<F: OutputFactory, S: TickSource, const N: usize, const TICK_US: u32>
    TickerPulseOut<F, S, N, TICK_US>
{
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Installs the output factory and the tick source.
    pub fn init(&self, factory: F, tick_source: S) -> Result<(), PulseOutError> {
        Self::check_tick()?;

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.is_some() {
                return Err(PulseOutError::AlreadyInitialized);
            }

            *inner = Some(Scheduler {
                factory,
                tick_source,
                running: false,
                slots: core::array::from_fn(|_| PulseSlot::default()),
            });
            Ok(())
        })
    }

    fn check_tick() -> Result<(), PulseOutError> {
        if TICK_US == 0 || TICK_US > i32::MAX as u32 {
            error!("tick interval {} us not usable", TICK_US);
            return Err(PulseOutError::InvalidPulse);
        }
        Ok(())
    }

    /// Starts `count` pulses on `pin` without blocking.
    ///
    /// The first rising edge happens on the next tick. The falling edge lands
    /// on the first tick at or after `width_us`, which has to come before the
    /// end of the period. Fails with [`PulseOutError::NoSlotAvailable`] when
    /// all `N` slots are busy; nothing is queued in that case.
    pub fn schedule(
        &self,
        pin: F::Pin,
        period_us: u32,
        width_us: u32,
        count: u32,
    ) -> Result<SlotId, PulseOutError> {
        Self::check_tick()?;
        validate_shape(period_us, width_us)?;
        if period_us > i32::MAX as u32 - TICK_US {
            error!("period {} us too long for the ticker", period_us);
            return Err(PulseOutError::InvalidPulse);
        }
        let falling_us = width_us.div_ceil(TICK_US) * TICK_US;
        if falling_us >= period_us {
            error!(
                "falling edge at {} us misses the {} us period",
                falling_us, period_us
            );
            return Err(PulseOutError::InvalidPulse);
        }
        if count == 0 {
            return Err(PulseOutError::InvalidCount);
        }

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let scheduler = inner.as_mut().ok_or(PulseOutError::NotInitialized)?;
            scheduler.schedule(pin, period_us as i32, width_us as i32, count, TICK_US)
        })
    }

    /// Advances every occupied slot by one tick.
    ///
    /// Call from the tick source's interrupt handler. Stops the tick source
    /// once no slot has pulses left.
    pub fn tick_callback(&self) {
        critical_section::with(|cs| {
            if let Some(scheduler) = self.inner.borrow_ref_mut(cs).as_mut() {
                scheduler.tick(TICK_US as i32);
            }
        });
    }

    /// `true` while the tick source is started.
    pub fn is_running(&self) -> bool {
        critical_section::with(|cs| {
            self.inner
                .borrow_ref(cs)
                .as_ref()
                .is_some_and(|scheduler| scheduler.running)
        })
    }

    /// Number of slots with pulses left.
    pub fn active_slots(&self) -> usize {
        critical_section::with(|cs| {
            self.inner.borrow_ref(cs).as_ref().map_or(0, |scheduler| {
                scheduler
                    .slots
                    .iter()
                    .filter(|slot| slot.is_occupied())
                    .count()
            })
        })
    }

    pub fn slot(&self, id: SlotId) -> Option<SlotInfo<F::Pin>> {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner.as_ref()?.slots.get(id).map(PulseSlot::info)
        })
    }
}

impl<F: OutputFactory, S: TickSource, const N: usize, const TICK_US: u32> Default
    for TickerPulseOut<F, S, N, TICK_US>
{
    fn default() -> Self {
        Self::new()
    }
}
