//! Transport facade: the single entry point callers use.
//!
//! Owns the framed link and the secure channel and routes every command
//! through whichever path is active. Establishing or tearing down the secure
//! channel is always an explicit call; a failed exchange never re-establishes
//! trust on its own.

use tracing::debug;

use crate::bus::{Clock, SeBus};
use crate::channel::{self, SecureChannel};
use crate::crypto::ChannelCrypto;
use crate::link::{Link, RetryPolicy, DATA_REG_LEN};
use crate::Result;

/// One secure element behind one bus address.
///
/// All operations take `&mut self`: a single logical transaction at a time is
/// part of the wire protocol, and exclusive borrows make overlap impossible
/// rather than merely forbidden.
pub struct Transport<B, C, K> {
    link: Link<B, C>,
    channel: SecureChannel<K>,
}

impl<B: SeBus, C: Clock, K: ChannelCrypto> Transport<B, C, K> {
    pub fn new(bus: B, clock: C, crypto: K) -> Self {
        Self::with_policy(bus, clock, crypto, RetryPolicy::default())
    }

    pub fn with_policy(bus: B, clock: C, crypto: K, policy: RetryPolicy) -> Self {
        Self {
            link: Link::new(bus, clock, policy),
            channel: SecureChannel::new(crypto),
        }
    }

    /// Bring up the link by negotiating the maximum frame size.
    pub fn init(&mut self) -> Result<()> {
        self.link.set_data_reg_len(DATA_REG_LEN)?;
        debug!("link initialized, data register length {}", DATA_REG_LEN);
        Ok(())
    }

    /// Execute one command and return its response.
    ///
    /// Runs encrypted when the secure channel is established, in plaintext
    /// otherwise.
    pub fn execute_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        if self.channel.is_established() {
            self.channel.execute(&mut self.link, command)
        } else {
            self.link
                .transceive(false, command, channel::MAX_APDU_SIZE)
        }
    }

    /// Establish the secure channel from a pre-shared secret.
    pub fn handshake(&mut self, secret: &[u8]) -> Result<()> {
        self.channel.handshake(&mut self.link, secret)
    }

    /// Tear down the secure channel, zeroizing its secrets. Subsequent
    /// commands run in plaintext until the next handshake.
    pub fn close_channel(&mut self) {
        self.channel.close();
    }

    pub fn channel_established(&self) -> bool {
        self.channel.is_established()
    }

    /// Recovery: force both link counters back to the unsynchronized
    /// sentinel and tell the device to resync.
    pub fn resync(&mut self) -> Result<()> {
        self.link.resync()
    }

    /// Recovery: trigger a warm device reset and desynchronize the link.
    pub fn soft_reset(&mut self) -> Result<()> {
        self.link.soft_reset()
    }

    /// Renegotiate the maximum frame size.
    pub fn set_data_reg_len(&mut self, len: u16) -> Result<()> {
        self.link.set_data_reg_len(len)
    }

    /// Current (outgoing, incoming) link frame counters.
    pub fn frame_counters(&self) -> (u8, u8) {
        self.link.frame_counters()
    }

    /// Install a callback invoked on every poll while waiting on the device.
    pub fn set_progress_hook(&mut self, hook: impl FnMut() + 'static) {
        self.link.set_progress_hook(hook);
    }
}
