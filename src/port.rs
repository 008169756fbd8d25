//! Port abstraction: the traits an integrator implements to wire this crate
//! to a real UART and a handful of GPIOs. Kept MCU-agnostic on top of
//! `embedded-hal` so the core never depends on a concrete HAL crate.

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};

/// Non-blocking byte-oriented UART. `read_byte` returns `Ok(None)` rather
/// than blocking when nothing is available; the AT client polls it inside
/// its own timeout loop.
pub trait UartPort {
    type Error: core::fmt::Debug;

    fn write_byte(&mut self, byte: u8) -> Result<(), Self::Error>;
    fn read_byte(&mut self) -> Result<Option<u8>, Self::Error>;
}

/// Monotonic millisecond clock, used for transaction timeouts and the
/// inter-CFUN delay.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Logic-level polarity of a GPIO relative to its asserted/"active" meaning.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

/// A named GPIO with its polarity baked in, so callers drive "asserted" /
/// "deasserted" instead of juggling `set_high`/`set_low` at every call site.
pub struct OutPin<P: OutputPin> {
    pin: P,
    polarity: Polarity,
}

impl<P: OutputPin> OutPin<P> {
    pub fn new(pin: P, polarity: Polarity) -> Self {
        Self { pin, polarity }
    }

    pub fn assert(&mut self) -> Result<(), P::Error> {
        match self.polarity {
            Polarity::ActiveHigh => self.pin.set_high(),
            Polarity::ActiveLow => self.pin.set_low(),
        }
    }

    pub fn deassert(&mut self) -> Result<(), P::Error> {
        match self.polarity {
            Polarity::ActiveHigh => self.pin.set_low(),
            Polarity::ActiveLow => self.pin.set_high(),
        }
    }
}

pub struct InPin<P: InputPin> {
    pin: P,
    polarity: Polarity,
}

impl<P: InputPin> InPin<P> {
    pub fn new(pin: P, polarity: Polarity) -> Self {
        Self { pin, polarity }
    }

    pub fn is_asserted(&mut self) -> Result<bool, P::Error> {
        match self.polarity {
            Polarity::ActiveHigh => self.pin.is_high(),
            Polarity::ActiveLow => self.pin.is_low(),
        }
    }
}

/// Stand-in activity pin for clients with no DTR-driven wake mode wired up.
/// `AtClient`'s activity-pin type parameter defaults to this so callers that
/// never call `set_activity_pin` don't have to name a pin type at all.
pub struct NoActivityPin;

impl ErrorType for NoActivityPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for NoActivityPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Stand-in VINT pin for instances with no VINT wired up. Always reads
/// "deasserted" so liveness falls back to an `AT` probe.
pub struct NoInputPin;

impl ErrorType for NoInputPin {
    type Error = core::convert::Infallible;
}

impl InputPin for NoInputPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(false)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
