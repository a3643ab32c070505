//! Readiness polling and flow control.
//!
//! The device exposes a 4-byte state register. Before any exchange the host
//! polls it until the device is neither busy nor holding an unread response;
//! stale responses are drained first so a fresh exchange never starts against
//! a half-finished previous one.

use tracing::{trace, warn};

use crate::bus::{self, reg, Clock, SeBus};
use crate::frame;
use crate::{Error, Result};

use super::Link;

/// Retry and deadline budget for the polled link.
///
/// The defaults are the reference timings for this device family: a command
/// can be throttled for several seconds when the security event counter is
/// high, so the poll deadline is generous.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Bus transfer retries after the first attempt of a write or read.
    pub max_bus_retries: u32,
    /// Settle delay between bus attempts, in milliseconds.
    pub bus_settle_ms: u32,
    /// Deadline for one round of state-register polling, in milliseconds.
    pub poll_deadline_ms: u64,
    /// Consecutive idle-without-response polls tolerated while a response is
    /// expected.
    pub max_not_busy_polls: u32,
    /// Stale responses drained before readiness is abandoned.
    pub max_flush_frames: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_bus_retries: 10,
            bus_settle_ms: 1,
            poll_deadline_ms: 6000,
            max_not_busy_polls: 10,
            max_flush_frames: 15,
        }
    }
}

/// Decoded contents of the state register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub busy: bool,
    pub response_ready: bool,
    /// Declared length of the pending response frame, in bytes.
    pub response_len: u16,
}

impl DeviceState {
    pub fn from_bytes(raw: [u8; 4]) -> Self {
        Self {
            busy: raw[0] & bus::STATE_BUSY != 0,
            response_ready: raw[0] & bus::STATE_RESP_READY != 0,
            response_len: u16::from_be_bytes([raw[2], raw[3]]),
        }
    }
}

impl<B: SeBus, C: Clock> Link<B, C> {
    /// Write `data` to the device, retrying within the policy budget.
    pub(crate) fn write_bus(&mut self, data: &[u8]) -> Result<()> {
        trace!(">>> {}", hex::encode(data));
        for attempt in 0..=self.policy.max_bus_retries {
            if attempt != 0 {
                self.clock.sleep_ms(self.policy.bus_settle_ms);
            }
            if self.bus.write(data).is_ok() {
                self.clock.sleep_ms(self.policy.bus_settle_ms);
                return Ok(());
            }
            self.clock.sleep_ms(self.policy.bus_settle_ms);
        }
        warn!("bus write failed after {} attempts", self.policy.max_bus_retries + 1);
        Err(Error::BusWrite)
    }

    /// Fill `buf` from the device, retrying within the policy budget.
    pub(crate) fn read_bus(&mut self, buf: &mut [u8]) -> Result<()> {
        for _ in 0..=self.policy.max_bus_retries {
            self.clock.sleep_ms(self.policy.bus_settle_ms);
            if self.bus.read(buf).is_ok() {
                trace!("<<< {}", hex::encode(&*buf));
                return Ok(());
            }
        }
        warn!("bus read failed after {} attempts", self.policy.max_bus_retries + 1);
        Err(Error::BusRead)
    }

    /// One poll of the state register.
    pub(crate) fn poll_state(&mut self) -> Result<DeviceState> {
        self.write_bus(&[reg::I2C_STATE])?;
        let mut raw = [0u8; 4];
        self.read_bus(&mut raw)?;
        Ok(DeviceState::from_bytes(raw))
    }

    /// Wait until the device is idle with no unread response.
    ///
    /// Any pending response is drained in full. A drained data frame also
    /// resynchronizes the sequence counters from its control byte and is
    /// acknowledged, so the device does not keep retransmitting it.
    pub(crate) fn ensure_ready(&mut self) -> Result<()> {
        for _ in 0..self.policy.max_flush_frames {
            let deadline = self.clock.ticks_ms() + self.policy.poll_deadline_ms;
            let state = loop {
                let state = self.poll_state()?;
                if state.response_ready {
                    break state;
                }
                if !state.busy {
                    return Ok(());
                }
                if self.clock.ticks_ms() >= deadline {
                    return Err(Error::Busy);
                }
            };

            // Drain the stale response. Its checksum is irrelevant; only the
            // control byte matters for counter resynchronization.
            let size = state.response_len as usize;
            let mut buf = self.fetch_raw(size)?;
            if size < 3 {
                self.frame_buf = buf;
                return Err(Error::UnexpectedFrame);
            }
            buf.truncate(size - 2);
            let fctr = buf[0];
            self.frame_buf = buf;
            self.frame_pending = true;

            if frame::is_data(fctr) {
                self.frame_num_in = (fctr & frame::FRNR_MASK) >> frame::FRNR_SHIFT;
                self.frame_num_out = fctr & frame::ACKNR_MASK;
                trace!(
                    "flushed stale data frame, counters resynced to ({}, {})",
                    self.frame_num_out,
                    self.frame_num_in
                );
                self.send_ack()?;
            } else if frame::is_reset(fctr) {
                self.desync();
            }
        }
        Err(Error::Timeout)
    }

    /// Poll for the response to a sent frame and load it, checksum verified.
    pub(crate) fn read_frame(&mut self) -> Result<()> {
        let mut not_busy_polls = 0;
        let deadline = self.clock.ticks_ms() + self.policy.poll_deadline_ms;
        loop {
            let state = self.poll_state()?;
            if state.response_ready {
                return self.fetch_checked(state.response_len as usize);
            }
            if !state.busy {
                // The device occasionally reports idle with no response even
                // though one was requested; a few more polls shake it loose.
                if not_busy_polls >= self.policy.max_not_busy_polls {
                    return Err(Error::UnexpectedFrame);
                }
                not_busy_polls += 1;
            }
            if let Some(progress) = self.progress.as_mut() {
                progress();
            }
            if self.clock.ticks_ms() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// Read a raw frame of `size` bytes from the data register into the
    /// frame buffer's storage, which is returned for the caller to restore.
    fn fetch_raw(&mut self, size: usize) -> Result<Vec<u8>> {
        if size > self.data_reg_len as usize {
            return Err(Error::Size);
        }
        self.write_bus(&[reg::DATA])?;
        let mut buf = std::mem::take(&mut self.frame_buf);
        self.frame_pending = false;
        buf.resize(size, 0);
        if let Err(e) = self.read_bus(&mut buf) {
            self.frame_buf = buf;
            return Err(e);
        }
        Ok(buf)
    }

    /// Fetch and fully validate one frame, then store it checksum-stripped.
    fn fetch_checked(&mut self, size: usize) -> Result<()> {
        let mut buf = self.fetch_raw(size)?;
        let verdict = frame::decode(&buf).map(|f| f.crc_ok);
        match verdict {
            Ok(true) => {
                buf.truncate(size - 2);
                self.frame_buf = buf;
                self.frame_pending = true;
                Ok(())
            }
            Ok(false) => {
                self.frame_buf = buf;
                Err(Error::Crc)
            }
            Err(e) => {
                self.frame_buf = buf;
                Err(e)
            }
        }
    }
}
