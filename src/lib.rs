//! Counted rectangular pulse trains for stepper drivers and other
//! pulse-counted actuators.
//!
//! Two independent engines are provided:
//!
//! - [`OpmPulseOut`] drives one timer channel in one-pulse mode with a
//!   repetition counter. The hardware emits each burst on its own; long
//!   trains are split into bursts and chained with a cheap reload.
//! - [`TickerPulseOut`] multiplexes up to `N` arbitrary GPIO outputs from one
//!   shared periodic tick. It is CPU bound and limited to the tick
//!   resolution, but works on any pin.
//!
//! Usage of the software engine:
//! ```ignore
//! static PULSES: TickerPulseOut<Pins, SysTickSource> = TickerPulseOut::new();
//!
//! PULSES.init(Pins::new(), SysTickSource::new())?;
//! // 1000 steps at 200us period, 100us active
//! PULSES.schedule(Pin::D2, 200, 100, 1000)?;
//!
//! // from the periodic interrupt handler
//! PULSES.tick_callback();
//! ```
#![cfg_attr(not(test), no_std)]

#[cfg(feature = "defmt")]
pub(crate) use defmt::{debug, error, trace, warn};
#[cfg(not(feature = "defmt"))]
pub(crate) use log::{debug, error, trace, warn};

pub mod clock;
mod opm;
pub mod sleep;
mod slot;
mod ticker;

pub use clock::{ApbDivider, Bus, BusClock, ClockParams};
pub use opm::{
    Batches, Channel, CounterMode, DEFAULT_BATCH_SIZE, OnePulseTimer, OpmPulseOut, OutputCompare,
    OutputKind, PinRoute, Polarity, TimeBase, TimerInstance, TimerPlatform, YieldFn,
};
pub use slot::{OutputFactory, OutputHandle, SlotInfo};
pub use ticker::{
    CallbackTickSource, DEFAULT_SLOT_COUNT, DEFAULT_TICK_INTERVAL_US, SlotId, TickSource,
    TickerPulseOut, TimerStartCallback, TimerStopCallback,
};

/// Errors reported by both pulse engines.
///
/// Everything except [`PulseOutError::NoSlotAvailable`] is a configuration or
/// wiring mistake and is not expected to go away on retry.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseOutError {
    /// The pin is not routed to any timer channel
    UnroutablePin,
    /// The timer has no repetition counter, or its clock cannot be enabled
    UnsupportedTimer,
    /// Only channel 1 and 2 support one-pulse output
    UnsupportedChannel,
    /// The timer clock is below 1 MHz, a microsecond tick is not possible
    ClockTooSlow,
    /// No prescaler/period pair fits the 16-bit registers
    ClockOutOfRange,
    /// Period or width is zero, or the width is not shorter than the period
    InvalidPulse,
    /// Pulse count is zero or larger than the hardware can emit in one burst
    InvalidCount,
    /// The timer driver rejected the configuration
    Hardware,
    /// All software pulse slots are busy
    NoSlotAvailable,
    /// The software engine has not been given its collaborators yet
    NotInitialized,
    /// The software engine was already initialized
    AlreadyInitialized,
}

impl core::fmt::Display for PulseOutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnroutablePin => write!(f, "pin is not connected to a timer channel"),
            Self::UnsupportedTimer => {
                write!(f, "only TIM1, TIM8, TIM15, TIM16, TIM17 and TIM20 are supported")
            }
            Self::UnsupportedChannel => write!(f, "only channel 1 and 2 support one-pulse mode"),
            Self::ClockTooSlow => write!(f, "timer clock is slower than 1 MHz"),
            Self::ClockOutOfRange => write!(f, "cannot fit prescaler and period registers"),
            Self::InvalidPulse => write!(f, "invalid pulse period or width"),
            Self::InvalidCount => write!(f, "invalid pulse count"),
            Self::Hardware => write!(f, "timer driver error"),
            Self::NoSlotAvailable => write!(f, "no free pulse slot"),
            Self::NotInitialized => write!(f, "pulse engine not initialized"),
            Self::AlreadyInitialized => write!(f, "pulse engine already initialized"),
        }
    }
}

/// Checks that a pulse shape is drawable: a non-empty active phase followed
/// by a non-empty idle phase.
pub(crate) fn validate_shape(period_us: u32, width_us: u32) -> Result<(), PulseOutError> {
    if period_us == 0 || width_us == 0 || width_us >= period_us {
        error!("rejected pulse shape {}/{} us", width_us, period_us);
        return Err(PulseOutError::InvalidPulse);
    }

    Ok(())
}
