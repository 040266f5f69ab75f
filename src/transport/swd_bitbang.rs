//! Bit-banged SWD line driver.
//!
//! The ARM ADIv5 DAP/AP transport primitives and wire timing stay out of
//! the core's scope — the `Transport` trait treats them as an opaque
//! 32-bit memory space. This module is the thin sliver of platform glue
//! that *does* belong next to the core on a bit-banged probe (as opposed
//! to one with a hardware SWD peripheral): turning two GPIOs into the SWD
//! line protocol's bit primitives, the same way a plain SPI Flash driver
//! turns two GPIOs (SPI + chip-select) into 25-series Flash opcodes. It is
//! deliberately small: everything above "clock one bit" is ADIv5
//! sequencing, which stays external.

use crate::error::Error;
use embedded_hal::digital::v2::{InputPin, OutputPin};

/// SWCLK + bidirectional SWDIO, driven by plain GPIOs.
///
/// `SWDIO` must be switched between output and input by the caller around
/// `turnaround()`; this type only ever drives or samples, it never owns the
/// pin-direction switch (that's a platform-specific GPIO feature this crate
/// doesn't assume exists).
pub struct SwdBitbang<CLK, DIO> {
    clk: CLK,
    dio: DIO,
}

impl<CLK, DIO> SwdBitbang<CLK, DIO>
where
    CLK: OutputPin,
    DIO: OutputPin + InputPin,
{
    pub fn new(clk: CLK, dio: DIO) -> Self {
        Self { clk, dio }
    }

    fn clock_low(&mut self) -> Result<(), Error> {
        self.clk.set_low().map_err(|_| Error::Transport)
    }

    fn clock_high(&mut self) -> Result<(), Error> {
        self.clk.set_high().map_err(|_| Error::Transport)
    }

    /// Drives one bit onto SWDIO and toggles SWCLK once.
    pub fn write_bit(&mut self, bit: bool) -> Result<(), Error> {
        if bit {
            self.dio.set_high().map_err(|_| Error::Transport)?;
        } else {
            self.dio.set_low().map_err(|_| Error::Transport)?;
        }
        self.clock_low()?;
        self.clock_high()
    }

    /// Samples one bit from SWDIO and toggles SWCLK once. The caller must
    /// have already turned SWDIO around to an input.
    pub fn read_bit(&mut self) -> Result<bool, Error> {
        self.clock_low()?;
        let bit = self.dio.is_high().map_err(|_| Error::Transport)?;
        self.clock_high()?;
        Ok(bit)
    }

    /// A line reset: >= 50 cycles with SWDIO high, matching the ADIv5 line
    /// reset sequence every SWD transaction group begins with.
    pub fn line_reset(&mut self) -> Result<(), Error> {
        self.dio.set_high().map_err(|_| Error::Transport)?;
        for _ in 0..50 {
            self.clock_low()?;
            self.clock_high()?;
        }
        Ok(())
    }

    /// Idle cycles with SWDIO low, used between transactions.
    pub fn idle_cycles(&mut self, count: u32) -> Result<(), Error> {
        self.dio.set_low().map_err(|_| Error::Transport)?;
        for _ in 0..count {
            self.clock_low()?;
            self.clock_high()?;
        }
        Ok(())
    }
}
