use embedded_hal::digital::OutputPin;

use crate::warn;

/// Hands out GPIO outputs by pin identifier.
pub trait OutputFactory {
    type Pin: Copy + PartialEq;
    type Output: OutputPin;

    /// Configures `pin` as a push-pull output.
    fn acquire(&mut self, pin: Self::Pin) -> Self::Output;

    /// Gives an output back before its pin is reused.
    fn release(&mut self, output: Self::Output) {
        drop(output);
    }
}

/// An output that can be moved to another pin.
pub struct OutputHandle<P, O> {
    pin: Option<P>,
    output: Option<O>,
}

impl<P: Copy, O: OutputPin> OutputHandle<P, O> {
    pub const fn unbound() -> Self {
        Self {
            pin: None,
            output: None,
        }
    }

    pub fn pin(&self) -> Option<P> {
        self.pin
    }

    pub fn is_bound(&self) -> bool {
        self.output.is_some()
    }

    /// Releases the current output, if any, then binds to `pin`.
    pub fn rebind<F>(&mut self, factory: &mut F, pin: P)
    where
        F: OutputFactory<Pin = P, Output = O>,
    {
        if let Some(previous) = self.output.take() {
            factory.release(previous);
        }
        self.pin = None;

        self.output = Some(factory.acquire(pin));
        self.pin = Some(pin);
    }

    pub fn set_high(&mut self) {
        if let Some(output) = self.output.as_mut()
            && output.set_high().is_err()
        {
            warn!("pulse output set high failed");
        }
    }

    pub fn set_low(&mut self) {
        if let Some(output) = self.output.as_mut()
            && output.set_low().is_err()
        {
            warn!("pulse output set low failed");
        }
    }
}

impl<P: Copy, O: OutputPin> Default for OutputHandle<P, O> {
    fn default() -> Self {
        Self::unbound()
    }
}

/// Snapshot of one slot.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo<P> {
    pub pin: Option<P>,
    pub period_us: u32,
    pub width_us: u32,
    pub remaining: u32,
    pub phase: i32,
}

/// One software pulse channel. Free while `remaining` is zero.
pub(crate) struct PulseSlot<P, O> {
    output: OutputHandle<P, O>,
    period_us: i32,
    width_us: i32,
    remaining: u32,
    phase: i32,
}

impl<P: Copy, O: OutputPin> PulseSlot<P, O> {
    pub(crate) fn is_occupied(&self) -> bool {
        self.remaining > 0
    }

    /// Takes over the slot for a new train.
    ///
    /// The phase starts one tick early so the first tick after this call
    /// produces the rising edge.
    pub(crate) fn arm<F>(
        &mut self,
        factory: &mut F,
        pin: P,
        period_us: i32,
        width_us: i32,
        count: u32,
        tick_us: i32,
    ) where
        F: OutputFactory<Pin = P, Output = O>,
    {
        self.output.rebind(factory, pin);
        self.period_us = period_us;
        self.width_us = width_us;
        self.remaining = count;
        self.phase = -tick_us;
        self.output.set_low();
    }

    /// Advances the slot by one tick. Returns `true` while pulses remain.
    pub(crate) fn tick(&mut self, tick_us: i32) -> bool {
        if self.remaining == 0 {
            return false;
        }

        self.phase += tick_us;
        if self.phase >= self.period_us {
            self.phase = 0;
            self.remaining -= 1;
        }
        if self.remaining == 0 {
            return false;
        }

        // Rising edge only on the exact period start, falling edge on the
        // first tick at or past the width.
        if self.phase == 0 {
            self.output.set_high();
        } else if self.phase >= self.width_us && self.phase < self.width_us + tick_us {
            self.output.set_low();
        }

        true
    }

    pub(crate) fn info(&self) -> SlotInfo<P> {
        SlotInfo {
            pin: self.output.pin(),
            period_us: self.period_us as u32,
            width_us: self.width_us as u32,
            remaining: self.remaining,
            phase: self.phase,
        }
    }
}

impl<P: Copy, O: OutputPin> Default for PulseSlot<P, O> {
    fn default() -> Self {
        Self {
            output: OutputHandle::unbound(),
            period_us: 0,
            width_us: 0,
            remaining: 0,
            phase: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    type Log = Rc<RefCell<Vec<(u8, bool)>>>;

    struct Pin {
        id: u8,
        log: Log,
    }

    impl embedded_hal::digital::ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.log.borrow_mut().push((self.id, false));
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.log.borrow_mut().push((self.id, true));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Pins {
        log: Log,
        acquired: Vec<u8>,
        released: Vec<u8>,
    }

    impl OutputFactory for Pins {
        type Pin = u8;
        type Output = Pin;

        fn acquire(&mut self, pin: u8) -> Pin {
            self.acquired.push(pin);
            Pin {
                id: pin,
                log: self.log.clone(),
            }
        }

        fn release(&mut self, output: Pin) {
            self.released.push(output.id);
        }
    }

    #[test]
    fn rebind_releases_previous_output() {
        let mut pins = Pins::default();
        let mut handle = OutputHandle::<u8, Pin>::unbound();
        assert!(!handle.is_bound());

        handle.rebind(&mut pins, 3);
        handle.rebind(&mut pins, 5);
        handle.set_high();

        assert_eq!(handle.pin(), Some(5));
        assert_eq!(pins.acquired, [3, 5]);
        assert_eq!(pins.released, [3]);
        assert_eq!(*pins.log.borrow(), [(5, true)]);
    }

    #[test]
    fn unbound_handle_ignores_writes() {
        let mut handle = OutputHandle::<u8, Pin>::default();
        handle.set_high();
        handle.set_low();
        assert_eq!(handle.pin(), None);
    }

    #[test]
    fn armed_slot_starts_one_tick_early() {
        let mut pins = Pins::default();
        let mut slot = PulseSlot::default();
        assert!(!slot.is_occupied());

        slot.arm(&mut pins, 7, 20, 10, 2, 5);
        let info = slot.info();
        assert!(slot.is_occupied());
        assert_eq!(info.pin, Some(7));
        assert_eq!(info.phase, -5);
        assert_eq!(info.remaining, 2);
        assert_eq!(*pins.log.borrow(), [(7, false)]);
    }

    #[test]
    fn slot_runs_out_after_count_periods() {
        let mut pins = Pins::default();
        let mut slot = PulseSlot::default();
        slot.arm(&mut pins, 1, 20, 10, 2, 5);
        pins.log.borrow_mut().clear();

        // 2 periods of 4 ticks each, freed on the wrap after the second
        let busy: Vec<bool> = (0..9).map(|_| slot.tick(5)).collect();
        assert_eq!(busy, [true, true, true, true, true, true, true, true, false]);
        assert!(!slot.is_occupied());
        assert!(!slot.tick(5));

        assert_eq!(
            *pins.log.borrow(),
            [(1, true), (1, false), (1, true), (1, false)]
        );
    }

    #[test]
    fn falling_edge_rounds_up_to_tick() {
        let mut pins = Pins::default();
        let mut slot = PulseSlot::default();
        // width 7 with 5 us ticks: low at phase 10
        slot.arm(&mut pins, 1, 20, 7, 1, 5);

        assert!(slot.tick(5));
        assert_eq!(slot.info().phase, 0);
        assert!(slot.tick(5));
        assert!(slot.tick(5));
        assert_eq!(slot.info().phase, 10);
        assert_eq!(*pins.log.borrow(), [(1, false), (1, true), (1, false)]);
    }
}
