//! Block framing for the MCU serial protocol.
//!
//! Every block on the wire is at most 64 bytes:
//! - 1-byte total length
//! - 1-byte sequence (low nibble) with the 0x10 destination bit
//! - payload: one or more VLQ-encoded messages
//! - 2-byte CRC16 (big-endian) over everything before it
//! - 1-byte sync marker (0x7E)
//!
//! A 5-byte block with an empty payload is an ACK (or NAK when its sequence
//! does not advance).

pub mod codec;
pub mod crc;
pub mod error;
pub mod reader;
pub mod sequence;
pub mod vlq;
pub mod writer;

pub use codec::{
    encode_block, Block, BlockCheck, BlockChecker, MESSAGE_DEST, MESSAGE_HEADER_SIZE,
    MESSAGE_MAX, MESSAGE_MIN, MESSAGE_PAYLOAD_MAX, MESSAGE_SEQ_MASK, MESSAGE_SYNC,
    MESSAGE_TRAILER_SIZE,
};
pub use crc::crc16_ccitt;
pub use error::{FrameError, Result};
pub use reader::{BlockDecoder, BlockReader};
pub use sequence::{reconstruct_seq, wire_seq};
pub use writer::BlockWriter;
