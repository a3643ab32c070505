//! Reliable framed link: sequence tracking, packet chaining, transceive.
//!
//! One logical exchange is strictly request then response. Outbound payloads
//! larger than a frame are chained across data frames, each acknowledged by
//! the peer; inbound responses are reassembled the same way. Both sides keep
//! a pair of mod-4 frame counters that start from an unsynchronized sentinel
//! and advance by one per frame.

pub mod flow;

use tracing::debug;

use crate::bus::{reg, Clock, SeBus};
use crate::frame::{self, ChainState, PacketCtl};
use crate::{Error, Result};

pub use flow::{DeviceState, RetryPolicy};

/// Default DATA register length negotiated at initialization.
pub const DATA_REG_LEN: u16 = 277;

/// Sequence counter value meaning "not synchronized yet".
pub const FRAME_NUM_UNSYNCED: u8 = 0xFF;

/// The framed link over one bus device.
///
/// Exactly one exchange is in flight at a time; every operation takes the
/// link by exclusive reference, so overlapping transactions cannot compile.
pub struct Link<B, C> {
    bus: B,
    clock: C,
    policy: RetryPolicy,
    data_reg_len: u16,
    frame_num_out: u8,
    frame_num_in: u8,
    /// Last received frame, checksum stripped, valid while `frame_pending`.
    frame_buf: Vec<u8>,
    frame_pending: bool,
    /// Scratch for outgoing bus writes.
    tx_buf: Vec<u8>,
    /// Invoked on every poll iteration while waiting for a response, so a UI
    /// can animate through multi-second device latencies.
    progress: Option<Box<dyn FnMut()>>,
}

impl<B: SeBus, C: Clock> Link<B, C> {
    pub fn new(bus: B, clock: C, policy: RetryPolicy) -> Self {
        Self {
            bus,
            clock,
            policy,
            data_reg_len: DATA_REG_LEN,
            frame_num_out: FRAME_NUM_UNSYNCED,
            frame_num_in: FRAME_NUM_UNSYNCED,
            frame_buf: Vec::with_capacity(DATA_REG_LEN as usize),
            frame_pending: false,
            tx_buf: Vec::with_capacity(1 + DATA_REG_LEN as usize),
            progress: None,
        }
    }

    /// Largest frame payload at the negotiated register length.
    pub fn max_packet_size(&self) -> usize {
        self.data_reg_len as usize - frame::MIN_FRAME_LEN
    }

    pub fn data_reg_len(&self) -> u16 {
        self.data_reg_len
    }

    /// Current (outgoing, incoming) frame counters.
    pub fn frame_counters(&self) -> (u8, u8) {
        (self.frame_num_out, self.frame_num_in)
    }

    pub fn set_progress_hook(&mut self, hook: impl FnMut() + 'static) {
        self.progress = Some(Box::new(hook));
    }

    pub fn clear_progress_hook(&mut self) {
        self.progress = None;
    }

    /// Negotiate the maximum frame size with the device.
    ///
    /// The device echoes the register back; a mismatched echo means the
    /// length was not accepted.
    pub fn set_data_reg_len(&mut self, len: u16) -> Result<()> {
        // A frame must at least fit its packet control byte.
        if len as usize <= frame::MIN_FRAME_LEN + 1 {
            return Err(Error::Size);
        }
        self.write_bus(&[reg::DATA_LEN, (len >> 8) as u8, len as u8])?;
        self.write_bus(&[reg::DATA_LEN])?;
        let mut echo = [0u8; 2];
        self.read_bus(&mut echo)?;
        if u16::from_be_bytes(echo) != len {
            return Err(Error::Size);
        }
        self.data_reg_len = len;
        Ok(())
    }

    /// Drop both counters back to the unsynchronized sentinel and tell the
    /// device to do the same with a sync-reset control frame.
    pub fn resync(&mut self) -> Result<()> {
        debug!("resyncing link sequence counters");
        self.desync();
        self.frame_pending = false;
        self.send_frame(frame::reset_fctr(), &[])
    }

    /// Trigger a warm device reset, then desynchronize the local counters.
    pub fn soft_reset(&mut self) -> Result<()> {
        debug!("soft resetting device");
        self.write_bus(&[reg::SOFT_RESET, 0xFF, 0xFF])?;
        self.desync();
        self.frame_pending = false;
        Ok(())
    }

    /// One full exchange: chain out `request`, reassemble the response.
    ///
    /// Fails closed: any checksum, counter or length inconsistency aborts the
    /// exchange and no partial response is ever returned.
    pub fn transceive(
        &mut self,
        presentation_layer: bool,
        request: &[u8],
        max_response_len: usize,
    ) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        self.frame_pending = false;

        // Transmit the request, one packet per frame.
        let mut remaining = request;
        let mut chain = ChainState::None;
        loop {
            let capacity = self.max_packet_size() - 1;
            let take = if remaining.len() > capacity {
                chain = if chain == ChainState::None {
                    ChainState::First
                } else {
                    ChainState::Middle
                };
                capacity
            } else {
                if chain != ChainState::None {
                    chain = ChainState::Last;
                }
                remaining.len()
            };
            let ctl = PacketCtl {
                chain,
                presentation_layer,
            };

            self.frame_num_out = self.frame_num_out.wrapping_add(1);
            self.send_packet(ctl.as_byte(), &remaining[..take])?;
            remaining = &remaining[take..];

            self.read_frame()?;
            if frame::is_data(self.frame_buf[0]) {
                // The device sometimes skips the separate ACK control frame
                // and answers directly with data, also mid-chain on errors.
                // Accepted variance: stop sending and take the response.
                break;
            }
            self.check_ack()?;
            if remaining.is_empty() {
                break;
            }
        }

        // Reassemble the response chain.
        let mut response = Vec::new();
        loop {
            self.frame_num_in = self.frame_num_in.wrapping_add(1);
            if !self.frame_pending {
                self.read_frame()?;
            }
            let (pctr, data) = self.receive_packet()?;
            if response.len() + data.len() > max_response_len {
                return Err(Error::Size);
            }
            response.extend_from_slice(data);
            self.send_ack()?;
            let ctl = PacketCtl::from_byte(pctr).ok_or(Error::UnexpectedFrame)?;
            if !ctl.chain.continues() {
                break;
            }
        }

        if !remaining.is_empty() {
            return Err(Error::IncompleteRequest);
        }
        Ok(response)
    }

    fn desync(&mut self) {
        self.frame_num_out = FRAME_NUM_UNSYNCED;
        self.frame_num_in = FRAME_NUM_UNSYNCED;
    }

    fn send_frame(&mut self, fctr: u8, parts: &[&[u8]]) -> Result<()> {
        let mut buf = std::mem::take(&mut self.tx_buf);
        buf.clear();
        buf.push(reg::DATA);
        frame::encode_into(fctr, parts, &mut buf);
        let result = self.write_bus(&buf);
        self.tx_buf = buf;
        result
    }

    /// Send one data frame carrying `pctr` and `data` under the current
    /// counters.
    fn send_packet(&mut self, pctr: u8, data: &[u8]) -> Result<()> {
        if data.len() > self.max_packet_size() - 1 {
            return Err(Error::Size);
        }
        let fctr = frame::data_fctr(self.frame_num_out, self.frame_num_in);
        let head = [pctr];
        self.send_frame(fctr, &[&head[..], data])
    }

    /// Acknowledge the last received frame with a control frame.
    fn send_ack(&mut self) -> Result<()> {
        self.send_frame(frame::ack_fctr(self.frame_num_in), &[])
    }

    /// Consume the pending frame, which must be an ACK for our last frame.
    fn check_ack(&mut self) -> Result<()> {
        let expected = frame::ack_fctr(self.frame_num_out);
        let pending = std::mem::take(&mut self.frame_pending);
        let buf = &self.frame_buf;
        if !pending || buf.len() != 3 || buf[0] != expected || buf[1] != 0 || buf[2] != 0 {
            return Err(Error::UnexpectedFrame);
        }
        Ok(())
    }

    /// Consume the pending frame as a data packet under the expected
    /// counters, returning its packet control byte and payload.
    fn receive_packet(&mut self) -> Result<(u8, &[u8])> {
        let expected = frame::data_fctr(self.frame_num_in, self.frame_num_out);
        let pending = std::mem::take(&mut self.frame_pending);
        let buf = &self.frame_buf;
        if !pending || buf.len() < 4 || buf[0] != expected {
            return Err(Error::UnexpectedFrame);
        }
        let declared = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if declared + 3 != buf.len() {
            return Err(Error::UnexpectedFrame);
        }
        Ok((buf[3], &buf[4..]))
    }
}
