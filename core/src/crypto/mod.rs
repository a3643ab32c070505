//! Cryptographic seams of the secure channel.
//!
//! The channel needs exactly three primitives: a key-derivation PRF for the
//! handshake and an authenticated cipher pair for record protection. All
//! three sit behind [`ChannelCrypto`] so the actual implementation (hardware
//! AES-CCM, a software cipher, a test double) stays outside the transport.

pub mod prf;

use crate::Result;

/// Record cipher key size in bytes.
pub const KEY_SIZE: usize = 16;
/// Record nonce size in bytes; the trailing four bytes are the sequence
/// counter.
pub const NONCE_SIZE: usize = 8;
/// Authentication tag size in bytes.
pub const TAG_SIZE: usize = 8;

/// Key derivation and authenticated encryption for one secure channel.
pub trait ChannelCrypto {
    /// Fill `out` with key material derived from `secret`, `label` and
    /// `seed`. Errors map to [`crate::Error::Crypto`].
    fn derive(&self, secret: &[u8], label: &[u8], seed: &[u8], out: &mut [u8]) -> Result<()>;

    /// Encrypt and authenticate `plaintext`, appending ciphertext followed
    /// by a [`TAG_SIZE`]-byte tag to `out`.
    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()>;

    /// Verify and decrypt `sealed` (ciphertext plus trailing tag), appending
    /// the plaintext to `out`.
    ///
    /// Implementations must return [`crate::Error::AuthFailed`] on any tag
    /// mismatch and must not write plaintext in that case.
    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        sealed: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()>;
}
