//! Authenticated encrypted channel layered on the framed link.
//!
//! A handshake derives two independent cipher directions from a pre-shared
//! secret and 32 bytes of device randomness. After that every application
//! payload travels as a protected record whose nonce embeds a monotonic
//! sequence counter, one counter per direction. A counter rollover destroys
//! the channel: all secrets are zeroized and a fresh handshake is required.

pub mod record;

use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::bus::{Clock, SeBus};
use crate::crypto::{ChannelCrypto, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::link::Link;
use crate::{Error, Result};

use record::{
    Record, RECORD_OVERHEAD, RND_SIZE, SCTR_FINISHED, SCTR_PROTECTED, SEQ_SIZE,
};

/// Payload of the Finished exchange: peer randomness plus a sequence value.
pub const HANDSHAKE_SIZE: usize = RND_SIZE + SEQ_SIZE;

/// Largest application payload carried in one exchange.
pub const MAX_APDU_SIZE: usize = 1547;

/// Largest record the channel will send or accept.
pub const MAX_RECORD_SIZE: usize = MAX_APDU_SIZE + RECORD_OVERHEAD;

/// Two keys and two nonce seeds.
const KEY_BLOCK_SIZE: usize = 2 * KEY_SIZE + 2 * SEQ_SIZE;

/// Derivation label fixed by the device's platform binding scheme.
const BINDING_LABEL: &[u8] = b"Platform Binding";

/// Advance the 32-bit big-endian counter in the nonce's trailing bytes.
/// Returns false when the counter rolls over.
fn increment_seq(nonce: &mut [u8; NONCE_SIZE]) -> bool {
    for byte in nonce[SEQ_SIZE..].iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return true;
        }
    }
    false
}

/// Secure-channel state: one encrypt direction, one decrypt direction.
pub struct SecureChannel<K> {
    crypto: K,
    established: bool,
    encr_key: [u8; KEY_SIZE],
    decr_key: [u8; KEY_SIZE],
    /// Outgoing nonce; trailing bytes are the send sequence counter.
    encr_nonce: [u8; NONCE_SIZE],
    /// Incoming nonce; trailing bytes are the receive sequence counter.
    decr_nonce: [u8; NONCE_SIZE],
    /// Scratch for outgoing sealed records.
    record_buf: Vec<u8>,
}

impl<K> SecureChannel<K> {
    pub fn new(crypto: K) -> Self {
        Self {
            crypto,
            established: false,
            encr_key: [0; KEY_SIZE],
            decr_key: [0; KEY_SIZE],
            encr_nonce: [0; NONCE_SIZE],
            decr_nonce: [0; NONCE_SIZE],
            record_buf: Vec::with_capacity(MAX_RECORD_SIZE),
        }
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Zeroize all channel secrets and drop back to the unestablished state.
    pub fn close(&mut self) {
        if self.established {
            debug!("secure channel closed");
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.established = false;
        self.encr_key.zeroize();
        self.decr_key.zeroize();
        self.encr_nonce.zeroize();
        self.decr_nonce.zeroize();
    }
}

impl<K: ChannelCrypto> SecureChannel<K> {
    /// Establish the channel from a pre-shared `secret`.
    ///
    /// Any previous channel state is discarded first. On any mismatch the
    /// channel stays unestablished and holds no secrets.
    pub fn handshake<B: SeBus, C: Clock>(
        &mut self,
        link: &mut Link<B, C>,
        secret: &[u8],
    ) -> Result<()> {
        self.teardown();

        let reply = link.transceive(true, &record::hello(), MAX_RECORD_SIZE)?;
        let (rnd, sseq) = match Record::parse(&reply)? {
            Record::HelloReply { rnd, sseq } => (rnd, sseq),
            _ => return Err(Error::UnexpectedRecord),
        };

        // Split the derived key block into per-direction keys and nonce
        // seeds.
        let mut key_block = [0u8; KEY_BLOCK_SIZE];
        self.crypto
            .derive(secret, BINDING_LABEL, &rnd, &mut key_block)?;
        self.encr_key.copy_from_slice(&key_block[..KEY_SIZE]);
        self.decr_key.copy_from_slice(&key_block[KEY_SIZE..2 * KEY_SIZE]);
        self.encr_nonce[..SEQ_SIZE].copy_from_slice(&key_block[32..36]);
        self.decr_nonce[..SEQ_SIZE].copy_from_slice(&key_block[36..40]);
        key_block.zeroize();

        // Finished: prove key possession by sealing the device's randomness
        // and sequence value under the fresh outgoing direction.
        self.encr_nonce[SEQ_SIZE..].copy_from_slice(&sseq);
        let mut payload = [0u8; HANDSHAKE_SIZE];
        payload[..RND_SIZE].copy_from_slice(&rnd);
        payload[RND_SIZE..].copy_from_slice(&sseq);
        let aad = record::associated_data(SCTR_FINISHED, sseq, HANDSHAKE_SIZE as u16);

        let mut finished = Vec::with_capacity(RECORD_OVERHEAD + HANDSHAKE_SIZE);
        finished.push(SCTR_FINISHED);
        finished.extend_from_slice(&sseq);
        let sealed = self.crypto.seal(
            &self.encr_key,
            &self.encr_nonce,
            &aad,
            &payload,
            &mut finished,
        );
        if let Err(e) = sealed {
            self.teardown();
            return Err(e);
        }

        let reply = match link.transceive(true, &finished, MAX_RECORD_SIZE) {
            Ok(reply) => reply,
            Err(e) => {
                self.teardown();
                return Err(e);
            }
        };
        let outcome = self.verify_finished(&reply, &rnd, sseq);
        if outcome.is_err() {
            self.teardown();
            return outcome;
        }

        self.established = true;
        debug!("secure channel established");
        Ok(())
    }

    /// Check the device's Finished reply and fix the final counter values.
    fn verify_finished(
        &mut self,
        reply: &[u8],
        rnd: &[u8; RND_SIZE],
        sseq: [u8; SEQ_SIZE],
    ) -> Result<()> {
        let (mseq, sealed) = match Record::parse(reply)? {
            Record::Finished { seq, sealed } => (seq, sealed),
            _ => return Err(Error::UnexpectedRecord),
        };
        if sealed.len() != HANDSHAKE_SIZE + TAG_SIZE {
            return Err(Error::UnexpectedRecord);
        }

        self.decr_nonce[SEQ_SIZE..].copy_from_slice(&mseq);
        let aad = record::associated_data(SCTR_FINISHED, mseq, HANDSHAKE_SIZE as u16);
        let mut echoed = Vec::with_capacity(HANDSHAKE_SIZE);
        self.crypto
            .open(&self.decr_key, &self.decr_nonce, &aad, sealed, &mut echoed)?;

        let mut expected = [0u8; HANDSHAKE_SIZE];
        expected[..RND_SIZE].copy_from_slice(rnd);
        expected[RND_SIZE..].copy_from_slice(&mseq);
        if !bool::from(echoed.as_slice().ct_eq(&expected)) {
            return Err(Error::UnexpectedRecord);
        }

        // Send counter continues from the device's value, receive counter
        // from the one it announced in the hello.
        self.encr_nonce[SEQ_SIZE..].copy_from_slice(&mseq);
        self.decr_nonce[SEQ_SIZE..].copy_from_slice(&sseq);
        Ok(())
    }

    /// Run one application payload through the established channel.
    ///
    /// A tag failure or sequence mismatch discards the reply in full; no
    /// partially trusted plaintext is ever returned.
    pub fn execute<B: SeBus, C: Clock>(
        &mut self,
        link: &mut Link<B, C>,
        command: &[u8],
    ) -> Result<Vec<u8>> {
        if !self.established {
            return Err(Error::ChannelNotEstablished);
        }
        if command.len() > MAX_APDU_SIZE {
            return Err(Error::Size);
        }
        if !increment_seq(&mut self.encr_nonce) {
            warn!("outgoing sequence counter rolled over, tearing channel down");
            self.teardown();
            return Err(Error::ChannelNotEstablished);
        }
        let mut mseq = [0u8; SEQ_SIZE];
        mseq.copy_from_slice(&self.encr_nonce[SEQ_SIZE..]);

        let mut sealed_record = std::mem::take(&mut self.record_buf);
        sealed_record.clear();
        sealed_record.push(SCTR_PROTECTED);
        sealed_record.extend_from_slice(&mseq);
        let aad = record::associated_data(SCTR_PROTECTED, mseq, command.len() as u16);
        let outcome = self.crypto.seal(
            &self.encr_key,
            &self.encr_nonce,
            &aad,
            command,
            &mut sealed_record,
        );
        if let Err(e) = outcome {
            self.record_buf = sealed_record;
            return Err(e);
        }

        let reply = link.transceive(true, &sealed_record, MAX_RECORD_SIZE);
        self.record_buf = sealed_record;
        let reply = reply?;

        if !increment_seq(&mut self.decr_nonce) {
            warn!("incoming sequence counter rolled over, tearing channel down");
            self.teardown();
            return Err(Error::ChannelNotEstablished);
        }
        let mut sseq = [0u8; SEQ_SIZE];
        sseq.copy_from_slice(&self.decr_nonce[SEQ_SIZE..]);

        let (seq, sealed) = match Record::parse(&reply)? {
            Record::Protected { seq, sealed } => (seq, sealed),
            _ => return Err(Error::UnexpectedRecord),
        };
        if !bool::from(seq.ct_eq(&sseq)) {
            return Err(Error::AuthFailed);
        }

        let response_len = sealed.len() - TAG_SIZE;
        let aad = record::associated_data(SCTR_PROTECTED, sseq, response_len as u16);
        let mut response = Vec::with_capacity(response_len);
        self.crypto
            .open(&self.decr_key, &self.decr_nonce, &aad, sealed, &mut response)?;
        Ok(response)
    }
}

impl<K> Drop for SecureChannel<K> {
    fn drop(&mut self) {
        self.teardown();
    }
}
