//! Wire records of the secure channel.
//!
//! Everything exchanged with the presentation layer flag set is one of three
//! record shapes. A record is decoded into this tagged form once, before any
//! field is interpreted.

use crate::crypto::TAG_SIZE;
use crate::{Error, Result};

/// Record type: handshake hello.
pub const SCTR_HELLO: u8 = 0x00;
/// Record type: handshake finished.
pub const SCTR_FINISHED: u8 = 0x08;
/// Record type: fully protected application record.
pub const SCTR_PROTECTED: u8 = 0x23;

/// Protocol version carried in the hello exchange and in associated data.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Peer randomness size in the hello reply.
pub const RND_SIZE: usize = 32;
/// Sequence field size.
pub const SEQ_SIZE: usize = 4;
/// Record type byte, sequence field and authentication tag.
pub const RECORD_OVERHEAD: usize = 1 + SEQ_SIZE + TAG_SIZE;

/// One decoded secure-channel record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record<'a> {
    /// Hello reply: peer randomness and the peer's initial sequence value.
    HelloReply {
        rnd: [u8; RND_SIZE],
        sseq: [u8; SEQ_SIZE],
    },
    /// Finished message: sequence value and sealed handshake payload.
    Finished {
        seq: [u8; SEQ_SIZE],
        sealed: &'a [u8],
    },
    /// Protected application record: sequence value and sealed payload.
    Protected {
        seq: [u8; SEQ_SIZE],
        sealed: &'a [u8],
    },
}

impl<'a> Record<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        match bytes.first().copied() {
            Some(SCTR_HELLO) => {
                if bytes.len() != 2 + RND_SIZE + SEQ_SIZE || bytes[1] != PROTOCOL_VERSION {
                    return Err(Error::UnexpectedRecord);
                }
                let mut rnd = [0u8; RND_SIZE];
                rnd.copy_from_slice(&bytes[2..2 + RND_SIZE]);
                let mut sseq = [0u8; SEQ_SIZE];
                sseq.copy_from_slice(&bytes[2 + RND_SIZE..]);
                Ok(Record::HelloReply { rnd, sseq })
            }
            Some(sctr @ (SCTR_FINISHED | SCTR_PROTECTED)) => {
                if bytes.len() < RECORD_OVERHEAD {
                    return Err(Error::UnexpectedRecord);
                }
                let mut seq = [0u8; SEQ_SIZE];
                seq.copy_from_slice(&bytes[1..1 + SEQ_SIZE]);
                let sealed = &bytes[1 + SEQ_SIZE..];
                if sctr == SCTR_FINISHED {
                    Ok(Record::Finished { seq, sealed })
                } else {
                    Ok(Record::Protected { seq, sealed })
                }
            }
            _ => Err(Error::UnexpectedRecord),
        }
    }
}

/// The fixed hello message opening a handshake.
pub fn hello() -> [u8; 2] {
    [SCTR_HELLO, PROTOCOL_VERSION]
}

/// Associated data binding a record's type, sequence and payload length.
pub fn associated_data(sctr: u8, seq: [u8; SEQ_SIZE], payload_len: u16) -> [u8; 8] {
    let len = payload_len.to_be_bytes();
    [
        sctr,
        seq[0],
        seq[1],
        seq[2],
        seq[3],
        PROTOCOL_VERSION,
        len[0],
        len[1],
    ]
}
