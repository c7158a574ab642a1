use crate::codec::{MESSAGE_DEST, MESSAGE_SEQ_MASK};

const SEQ_SPAN: u64 = MESSAGE_SEQ_MASK as u64 + 1;

/// The sequence byte sent on the wire for a 64-bit counter.
pub fn wire_seq(seq: u64) -> u8 {
    MESSAGE_DEST | (seq as u8 & MESSAGE_SEQ_MASK)
}

/// Extend a 4-bit wire sequence to the 64-bit counter it belongs to.
///
/// The result is the first counter at or after `prior` whose low nibble
/// matches `wire`, so it never moves backwards and advances by less than 16.
pub fn reconstruct_seq(prior: u64, wire: u8) -> u64 {
    let rseq = (prior & !u64::from(MESSAGE_SEQ_MASK)) | u64::from(wire & MESSAGE_SEQ_MASK);
    if rseq < prior {
        rseq + SEQ_SPAN
    } else {
        rseq
    }
}
