//! sdmmc-volumes - SPI transport and time keeping
//!
//! The card protocol is written once against [`SpiBus`] and [`Clock`]. A
//! board provides both; [`HalSpiBus`] covers the common case of an
//! `embedded-hal` SPI peripheral plus one chip select pin per slot.

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use crate::Slot;

/// SPI clock rates used by the driver.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockSpeed {
    /// 100-400 kHz, for card bring-up.
    Slow,
    /// Full speed, for block transfers.
    Fast,
}

/// An SPI bus shared by up to two card slots.
///
/// At most one chip select may be asserted at a time. The driver always calls
/// [`SpiBus::deselect`] before selecting another slot.
pub trait SpiBus {
    /// Errors from the peripheral or its pins.
    type Error: core::fmt::Debug;

    /// Assert the chip select line of `slot`.
    fn select(&mut self, slot: Slot) -> Result<(), Self::Error>;

    /// Release every chip select line.
    fn deselect(&mut self) -> Result<(), Self::Error>;

    /// Clock out one byte and return the byte clocked in.
    fn exchange(&mut self, byte: u8) -> Result<u8, Self::Error>;

    /// Fill `buf` with bytes clocked in while sending 0xFF.
    fn receive_block(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        for b in buf.iter_mut() {
            *b = self.exchange(0xFF)?;
        }
        Ok(())
    }

    /// Clock out every byte of `buf`, discarding whatever comes back.
    fn send_block(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        for &b in buf.iter() {
            self.exchange(b)?;
        }
        Ok(())
    }

    /// Reprogram the bit rate.
    fn set_clock(&mut self, _speed: ClockSpeed) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Configure the pins and peripheral for card access.
    fn power_on(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Release the peripheral after a failed bring-up.
    fn power_off(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Is there a card in the socket? Boards without a card detect switch
    /// always say yes.
    fn card_detected(&mut self, _slot: Slot) -> bool {
        true
    }

    /// Is the write protect tab of the card set?
    fn write_protected(&mut self, _slot: Slot) -> bool {
        false
    }
}

impl<T> SpiBus for &mut T
where
    T: SpiBus,
{
    type Error = T::Error;

    fn select(&mut self, slot: Slot) -> Result<(), Self::Error> {
        (*self).select(slot)
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        (*self).deselect()
    }

    fn exchange(&mut self, byte: u8) -> Result<u8, Self::Error> {
        (*self).exchange(byte)
    }

    fn receive_block(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        (*self).receive_block(buf)
    }

    fn send_block(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        (*self).send_block(buf)
    }

    fn set_clock(&mut self, speed: ClockSpeed) -> Result<(), Self::Error> {
        (*self).set_clock(speed)
    }

    fn power_on(&mut self) -> Result<(), Self::Error> {
        (*self).power_on()
    }

    fn power_off(&mut self) -> Result<(), Self::Error> {
        (*self).power_off()
    }

    fn card_detected(&mut self, slot: Slot) -> bool {
        (*self).card_detected(slot)
    }

    fn write_protected(&mut self, slot: Slot) -> bool {
        (*self).write_protected(slot)
    }
}

/// A free running millisecond counter plus a way to pause.
///
/// The counter is allowed to wrap; the driver only ever looks at the
/// difference between two readings.
pub trait Clock {
    /// Milliseconds since some arbitrary point in time.
    fn now_ms(&self) -> u32;

    /// Busy wait (or sleep) for at least `ms` milliseconds.
    fn delay_ms(&self, ms: u32);
}

impl<T> Clock for &T
where
    T: Clock,
{
    fn now_ms(&self) -> u32 {
        (*self).now_ms()
    }

    fn delay_ms(&self, ms: u32) {
        (*self).delay_ms(ms)
    }
}

/// Errors from a [`HalSpiBus`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HalBusError {
    /// We got an error from the SPI peripheral
    Spi,
    /// Couldn't set a GPIO pin
    Gpio,
}

/// Hook that reprograms the SPI peripheral for the given clock rate.
pub type ClockHook<SPI> = fn(&mut SPI, ClockSpeed);

/// [`SpiBus`] built from an `embedded-hal` SPI peripheral and one chip select
/// pin per slot.
pub struct HalSpiBus<SPI, CS0, CS1>
where
    SPI: Transfer<u8>,
    CS0: OutputPin,
    CS1: OutputPin,
{
    spi: SPI,
    cs: (CS0, CS1),
    clock_hook: Option<ClockHook<SPI>>,
}

impl<SPI, CS0, CS1> HalSpiBus<SPI, CS0, CS1>
where
    SPI: Transfer<u8>,
    CS0: OutputPin,
    CS1: OutputPin,
{
    pub fn new(spi: SPI, cs0: CS0, cs1: CS1) -> Self {
        HalSpiBus {
            spi,
            cs: (cs0, cs1),
            clock_hook: None,
        }
    }

    /// Call `hook` whenever the driver switches between bring-up and
    /// transfer clock rates.
    pub fn with_clock_hook(mut self, hook: ClockHook<SPI>) -> Self {
        self.clock_hook = Some(hook);
        self
    }

    /// Get a temporary borrow on the underlying SPI device, for sharing the
    /// bus with other peripherals.
    pub fn spi<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut SPI) -> T,
    {
        func(&mut self.spi)
    }

    pub fn release(self) -> (SPI, CS0, CS1) {
        (self.spi, self.cs.0, self.cs.1)
    }
}

impl<SPI, CS0, CS1> SpiBus for HalSpiBus<SPI, CS0, CS1>
where
    SPI: Transfer<u8>,
    CS0: OutputPin,
    CS1: OutputPin,
{
    type Error = HalBusError;

    fn select(&mut self, slot: Slot) -> Result<(), Self::Error> {
        match slot {
            Slot::Zero => self.cs.0.set_low().map_err(|_| HalBusError::Gpio),
            Slot::One => self.cs.1.set_low().map_err(|_| HalBusError::Gpio),
        }
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        self.cs.0.set_high().map_err(|_| HalBusError::Gpio)?;
        self.cs.1.set_high().map_err(|_| HalBusError::Gpio)
    }

    fn exchange(&mut self, byte: u8) -> Result<u8, Self::Error> {
        self.spi
            .transfer(&mut [byte])
            .map(|b| b[0])
            .map_err(|_e| HalBusError::Spi)
    }

    fn receive_block(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        for b in buf.iter_mut() {
            *b = 0xFF;
        }
        self.spi.transfer(buf).map_err(|_e| HalBusError::Spi)?;
        Ok(())
    }

    fn set_clock(&mut self, speed: ClockSpeed) -> Result<(), Self::Error> {
        if let Some(hook) = self.clock_hook {
            hook(&mut self.spi, speed);
        }
        Ok(())
    }

    fn power_on(&mut self) -> Result<(), Self::Error> {
        self.deselect()
    }
}
