// selink — transport layer for a polled secure-element bus.
//
// The device speaks a narrow half-duplex register protocol: the host polls a
// state register, exchanges CRC-checked frames through a data register, and
// chains oversized payloads across frames. On top of that sits an optional
// authenticated encrypted channel bound to a pre-shared platform secret.
//
// Layering is strictly downward:
//
//   transport (facade) -> channel -> link -> bus traits + frame codec

pub mod bus;
pub mod channel;
pub mod crypto;
pub mod frame;
pub mod link;
pub mod transport;

use thiserror::Error;

/// Everything that can go wrong between the caller and the device.
///
/// Every layer fails closed: after any error the caller decides whether to
/// retry, resync, soft reset or re-handshake. Nothing below the bus retry
/// budget is retried silently.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("bus write failed")]
    BusWrite,
    #[error("bus read failed")]
    BusRead,
    #[error("device busy")]
    Busy,
    #[error("length exceeds buffer capacity")]
    Size,
    #[error("frame checksum mismatch")]
    Crc,
    #[error("unexpected frame")]
    UnexpectedFrame,
    #[error("timed out waiting for device")]
    Timeout,
    #[error("request was not fully transmitted")]
    IncompleteRequest,
    #[error("malformed secure channel record")]
    UnexpectedRecord,
    #[error("record authentication failed")]
    AuthFailed,
    #[error("secure channel not established")]
    ChannelNotEstablished,
    #[error("cipher failure")]
    Crypto,
}

pub type Result<T> = std::result::Result<T, Error>;

pub use bus::{BusError, Clock, SeBus, SystemClock};
pub use channel::SecureChannel;
pub use crypto::ChannelCrypto;
pub use link::{Link, RetryPolicy};
pub use transport::Transport;
