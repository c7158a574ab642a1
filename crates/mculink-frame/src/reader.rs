use std::io::{ErrorKind, Read};

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::codec::{Block, BlockCheck, BlockChecker};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;
const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Push-style block extractor.
///
/// Feed it whatever the serial port returned and pull complete blocks out.
/// Bytes dropped while resynchronizing are counted, never surfaced as errors.
#[derive(Debug, Default)]
pub struct BlockDecoder {
    buf: BytesMut,
    checker: BlockChecker,
    bytes_invalid: u64,
}

impl BlockDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            checker: BlockChecker::new(),
            bytes_invalid: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete block, or `None` when more input is needed.
    pub fn next_block(&mut self) -> Option<Block> {
        loop {
            match self.checker.check(&self.buf) {
                BlockCheck::NeedMore => return None,
                BlockCheck::Valid(len) => {
                    let raw = self.buf.split_to(len).freeze();
                    return Some(Block::from_validated(raw));
                }
                BlockCheck::Discard(n) => {
                    trace!(discarded = n, "dropping invalid bytes");
                    self.bytes_invalid += n as u64;
                    self.buf.advance(n);
                }
            }
        }
    }

    /// Total bytes discarded during resynchronization.
    pub fn bytes_invalid(&self) -> u64 {
        self.bytes_invalid
    }

    /// Bytes waiting for the rest of a block.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop buffered input and resynchronization state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.checker = BlockChecker::new();
    }
}

/// Reads complete blocks from any `Read` stream.
///
/// Handles partial reads and resynchronization internally; callers only see
/// valid blocks.
pub struct BlockReader<T> {
    inner: T,
    decoder: BlockDecoder,
}

impl<T: Read> BlockReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            decoder: BlockDecoder::new(),
        }
    }

    /// Read the next valid block (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_block(&mut self) -> Result<Block> {
        loop {
            if let Some(block) = self.decoder.next_block() {
                return Ok(block);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.decoder.extend(&chunk[..read]);
        }
    }

    /// Total bytes discarded while resynchronizing.
    pub fn bytes_invalid(&self) -> u64 {
        self.decoder.bytes_invalid()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::{encode_block, MESSAGE_SYNC};

    fn wire(blocks: &[(u64, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (seq, payload) in blocks {
            encode_block(*seq, payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_multiple_blocks() {
        let bytes = wire(&[(1, &b"one"[..]), (2, &b"two"[..]), (3, &b""[..])]);
        let mut reader = BlockReader::new(Cursor::new(bytes));

        let b1 = reader.read_block().unwrap();
        let b2 = reader.read_block().unwrap();
        let b3 = reader.read_block().unwrap();

        assert_eq!((b1.seq(), b1.payload()), (1, b"one".as_ref()));
        assert_eq!((b2.seq(), b2.payload()), (2, b"two".as_ref()));
        assert!(b3.is_ack());
        assert!(matches!(
            reader.read_block(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn partial_read_handling() {
        let bytes = wire(&[(4, &b"slow"[..])]);
        let byte_reader = ByteByByteReader { bytes, pos: 0 };
        let mut reader = BlockReader::new(byte_reader);

        let block = reader.read_block().unwrap();
        assert_eq!(block.seq(), 4);
        assert_eq!(block.payload(), b"slow");
    }

    #[test]
    fn corrupted_block_skipped_and_counted() {
        let mut bytes = wire(&[(1, &b"bad!"[..])]);
        bytes[3] ^= 0x40;
        let bad_len = bytes.len();
        bytes.extend(wire(&[(2, &b"good"[..])]));

        let mut reader = BlockReader::new(Cursor::new(bytes));
        let block = reader.read_block().unwrap();
        assert_eq!(block.payload(), b"good");
        assert_eq!(reader.bytes_invalid(), bad_len as u64);
    }

    #[test]
    fn decoder_resyncs_after_noise() {
        let mut decoder = BlockDecoder::new();
        decoder.extend(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert!(decoder.next_block().is_none());
        assert_eq!(decoder.bytes_invalid(), 6);

        decoder.extend(&[MESSAGE_SYNC]);
        decoder.extend(&wire(&[(9, &b"ok"[..])]));
        // The lone sync byte ends the resync.
        let block = decoder.next_block().unwrap();
        assert_eq!(block.payload(), b"ok");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_waits_for_tail() {
        let bytes = wire(&[(5, &b"split"[..])]);
        let mut decoder = BlockDecoder::new();
        decoder.extend(&bytes[..6]);
        assert!(decoder.next_block().is_none());
        assert_eq!(decoder.bytes_invalid(), 0);
        decoder.extend(&bytes[6..]);
        assert_eq!(decoder.next_block().unwrap().payload(), b"split");
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }
}
