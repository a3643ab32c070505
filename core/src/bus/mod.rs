//! Hardware seams: the physical bus driver and the time source.
//!
//! The transport talks to the secure element through these two traits only,
//! so the physical driver stays outside the crate and the polling logic can
//! run against test doubles without real delays.

use std::time::Instant;

use thiserror::Error;

/// Register map of the device's polled bus interface.
pub mod reg {
    /// Frame data register.
    pub const DATA: u8 = 0x80;
    /// Maximum data register length, 2 bytes big endian.
    pub const DATA_LEN: u8 = 0x81;
    /// Bus state register, 4 bytes.
    pub const I2C_STATE: u8 = 0x82;
    /// Writing 0xFF 0xFF here triggers a warm device reset.
    pub const SOFT_RESET: u8 = 0x88;
}

/// State register byte 0: device is busy executing a command.
pub const STATE_BUSY: u8 = 0x80;
/// State register byte 0: a response is ready to be read.
pub const STATE_RESP_READY: u8 = 0x40;

/// A single bounded-time bus transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bus transfer failed")]
pub struct BusError;

/// One address on the half-duplex bus.
///
/// Each call is a single transaction attempt with the driver's own timeout;
/// retry budgets live above this trait.
pub trait SeBus {
    /// Write all of `data` to the device.
    fn write(&mut self, data: &[u8]) -> std::result::Result<(), BusError>;
    /// Fill all of `buf` from the device.
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<(), BusError>;
}

/// Millisecond tick source and sleep, injectable for tests.
pub trait Clock {
    /// Monotonic milliseconds since an arbitrary origin.
    fn ticks_ms(&self) -> u64;
    /// Block the calling thread for at least `ms` milliseconds.
    fn sleep_ms(&mut self, ms: u32);
}

/// Wall clock backed by `std::time`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn ticks_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep_ms(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }
}
