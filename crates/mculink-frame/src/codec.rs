use bytes::{BufMut, Bytes, BytesMut};

use crate::crc::crc16_ccitt;
use crate::error::{FrameError, Result};
use crate::sequence::wire_seq;

/// Smallest block: header + trailer with an empty payload (ACK/NAK).
pub const MESSAGE_MIN: usize = 5;
/// Largest block on the wire.
pub const MESSAGE_MAX: usize = 64;
/// Length byte + sequence byte.
pub const MESSAGE_HEADER_SIZE: usize = 2;
/// CRC (2) + sync (1).
pub const MESSAGE_TRAILER_SIZE: usize = 3;
/// Largest payload a single block can carry.
pub const MESSAGE_PAYLOAD_MAX: usize = MESSAGE_MAX - MESSAGE_MIN;
/// Mask for the sequence nibble.
pub const MESSAGE_SEQ_MASK: u8 = 0x0f;
/// Destination bit carried in every sequence byte.
pub const MESSAGE_DEST: u8 = 0x10;
/// Block terminator and resynchronization marker.
pub const MESSAGE_SYNC: u8 = 0x7e;

const MESSAGE_POS_LEN: usize = 0;
const MESSAGE_POS_SEQ: usize = 1;
const MESSAGE_TRAILER_CRC: usize = 3;
const MESSAGE_TRAILER_SYNC: usize = 1;

/// A validated block as received from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    raw: Bytes,
}

impl Block {
    /// Wrap bytes that [`BlockChecker::check`] reported as a valid block.
    pub fn from_validated(raw: Bytes) -> Self {
        Self { raw }
    }

    /// Sequence nibble carried by the block.
    pub fn seq(&self) -> u8 {
        self.raw[MESSAGE_POS_SEQ] & MESSAGE_SEQ_MASK
    }

    /// Message bytes between header and trailer.
    pub fn payload(&self) -> &[u8] {
        &self.raw[MESSAGE_HEADER_SIZE..self.raw.len() - MESSAGE_TRAILER_SIZE]
    }

    /// Total wire length.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// A block always carries at least header and trailer.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// True for header+trailer-only blocks (ACK/NAK).
    pub fn is_ack(&self) -> bool {
        self.raw.len() == MESSAGE_MIN
    }

    /// The full block including header and trailer.
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }
}

/// Encode a block into the wire format.
///
/// Wire format:
/// ```text
/// ┌─────────┬──────────────┬────────────────┬────────────┬──────┐
/// │ Len (1) │ 0x10|seq (1) │ Payload (0-59) │ CRC16 (BE) │ 0x7E │
/// └─────────┴──────────────┴────────────────┴────────────┴──────┘
/// ```
pub fn encode_block(seq: u64, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MESSAGE_PAYLOAD_MAX {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MESSAGE_PAYLOAD_MAX,
        });
    }
    let start = dst.len();
    let len = payload.len() + MESSAGE_MIN;
    dst.reserve(len);
    dst.put_u8(len as u8);
    dst.put_u8(wire_seq(seq));
    dst.put_slice(payload);
    let crc = crc16_ccitt(&dst[start..]);
    dst.put_u16(crc);
    dst.put_u8(MESSAGE_SYNC);
    Ok(())
}

/// Outcome of inspecting the front of a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCheck {
    /// Not enough bytes to decide.
    NeedMore,
    /// A complete, CRC-valid block of this length starts at offset 0.
    Valid(usize),
    /// Drop this many leading bytes and check again.
    Discard(usize),
}

impl BlockCheck {
    /// The classic signed encoding: 0, +length, or -discard.
    pub fn as_signed(self) -> isize {
        match self {
            BlockCheck::NeedMore => 0,
            BlockCheck::Valid(len) => len as isize,
            BlockCheck::Discard(n) => -(n as isize),
        }
    }
}

/// Incremental validator for the front of a receive buffer.
///
/// After a discard that found no sync byte the checker stays in "need sync"
/// mode, rejecting everything up to the next sync byte so a stray length
/// byte cannot be taken for the start of a block.
#[derive(Debug, Default, Clone)]
pub struct BlockChecker {
    need_sync: bool,
}

impl BlockChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the checker is waiting for a sync byte.
    pub fn need_sync(&self) -> bool {
        self.need_sync
    }

    /// Inspect `buf`, which must start where the previous check left off.
    pub fn check(&mut self, buf: &[u8]) -> BlockCheck {
        if buf.len() < MESSAGE_MIN {
            return BlockCheck::NeedMore;
        }
        if !self.need_sync {
            match validate(buf) {
                Some(BlockCheck::Discard(_)) | None => {}
                Some(result) => return result,
            }
        }
        match buf.iter().position(|&b| b == MESSAGE_SYNC) {
            Some(pos) => {
                self.need_sync = false;
                BlockCheck::Discard(pos + 1)
            }
            None => {
                self.need_sync = true;
                BlockCheck::Discard(buf.len())
            }
        }
    }
}

// `None` means the header or trailer is wrong and the caller must resync.
fn validate(buf: &[u8]) -> Option<BlockCheck> {
    let len = buf[MESSAGE_POS_LEN] as usize;
    if !(MESSAGE_MIN..=MESSAGE_MAX).contains(&len) {
        return None;
    }
    if buf[MESSAGE_POS_SEQ] & !MESSAGE_SEQ_MASK != MESSAGE_DEST {
        return None;
    }
    if buf.len() < len {
        return Some(BlockCheck::NeedMore);
    }
    if buf[len - MESSAGE_TRAILER_SYNC] != MESSAGE_SYNC {
        return None;
    }
    let wire_crc = u16::from_be_bytes([
        buf[len - MESSAGE_TRAILER_CRC],
        buf[len - MESSAGE_TRAILER_CRC + 1],
    ]);
    if crc16_ccitt(&buf[..len - MESSAGE_TRAILER_SIZE]) != wire_crc {
        return None;
    }
    Some(BlockCheck::Valid(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(seq: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_block(seq, payload, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn encode_known_blocks() {
        assert_eq!(block(0, &[]), [0x05, 0x10, 0x9e, 0x81, 0x7e]);
        assert_eq!(block(1, &[]), [0x05, 0x11, 0x8f, 0x08, 0x7e]);
        assert_eq!(
            block(1, &[0x01, 0x00, 0x28]),
            [0x08, 0x11, 0x01, 0x00, 0x28, 0x42, 0x24, 0x7e]
        );
        // Only the low nibble of the counter reaches the wire.
        assert_eq!(block(0x13, &[1, 2, 3])[1], 0x13);
        assert_eq!(block(0x23, &[1, 2, 3]), block(3, &[1, 2, 3]));
    }

    #[test]
    fn check_accepts_encoded_block() {
        for len in [0usize, 1, 17, MESSAGE_PAYLOAD_MAX] {
            let payload: Vec<u8> = (0..len as u8).collect();
            let wire = block(7, &payload);
            let mut checker = BlockChecker::new();
            assert_eq!(checker.check(&wire), BlockCheck::Valid(len + MESSAGE_MIN));
            assert_eq!(checker.check(&wire).as_signed(), (len + MESSAGE_MIN) as isize);
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        let err = encode_block(0, &[0u8; MESSAGE_PAYLOAD_MAX + 1], &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 60, max: 59 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn any_single_byte_corruption_fails() {
        let wire = block(2, b"heater_set");
        for idx in MESSAGE_HEADER_SIZE..wire.len() - MESSAGE_TRAILER_SIZE {
            for flip in [0x01u8, 0x80, 0xff] {
                let mut corrupt = wire.clone();
                corrupt[idx] ^= flip;
                let mut checker = BlockChecker::new();
                assert!(
                    matches!(checker.check(&corrupt), BlockCheck::Discard(_)),
                    "byte {idx} flip {flip:#x} slipped through"
                );
            }
        }
    }

    #[test]
    fn garbage_prefix_discarded_exactly() {
        let garbage = [0x33u8, 0x00, 0x91, 0x42];
        let wire = block(4, &[9, 8, 7]);
        let mut buf = garbage.to_vec();
        buf.push(MESSAGE_SYNC);
        buf.extend_from_slice(&wire);

        let mut checker = BlockChecker::new();
        assert_eq!(checker.check(&buf), BlockCheck::Discard(garbage.len() + 1));
        assert_eq!(
            checker.check(&buf[garbage.len() + 1..]),
            BlockCheck::Valid(wire.len())
        );
    }

    #[test]
    fn short_buffer_needs_more() {
        let wire = block(4, &[1, 2, 3, 4, 5, 6]);
        let mut checker = BlockChecker::new();
        assert_eq!(checker.check(&wire[..3]), BlockCheck::NeedMore);
        assert_eq!(checker.check(&wire[..wire.len() - 1]), BlockCheck::NeedMore);
        assert_eq!(checker.check(&wire), BlockCheck::Valid(wire.len()));
    }

    #[test]
    fn need_sync_rejects_until_sync_byte() {
        let mut checker = BlockChecker::new();
        let noise = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06];
        assert_eq!(checker.check(&noise), BlockCheck::Discard(noise.len()));
        assert!(checker.need_sync());

        // A well-formed block is still dropped up to its sync byte while resyncing.
        let wire = block(0, &[]);
        assert_eq!(checker.check(&wire), BlockCheck::Discard(wire.len()));
        assert!(!checker.need_sync());
        assert_eq!(checker.check(&wire), BlockCheck::Valid(wire.len()));
    }

    #[test]
    fn bad_header_fields() {
        let mut checker = BlockChecker::new();
        // Length below minimum.
        assert_eq!(checker.check(&[0x04, 0x10, 0, 0, 0x7e]), BlockCheck::Discard(5));
        // Missing destination bit.
        let mut wire = block(0, &[]);
        wire[1] = 0x00;
        assert_eq!(checker.check(&wire), BlockCheck::Discard(5));
        // Length above maximum.
        let mut long = vec![65u8, 0x10];
        long.extend_from_slice(&[0; 10]);
        assert!(matches!(checker.check(&long), BlockCheck::Discard(12)));
        assert!(checker.need_sync());
    }

    #[test]
    fn block_accessors() {
        let wire = block(0x1a, &[0x20, 0x21]);
        let blk = Block::from_validated(Bytes::from(wire));
        assert_eq!(blk.seq(), 0x0a);
        assert_eq!(blk.payload(), &[0x20, 0x21]);
        assert_eq!(blk.len(), 7);
        assert!(!blk.is_ack());
    }
}
