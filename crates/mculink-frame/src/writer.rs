use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_block, MESSAGE_MAX};
use crate::error::{FrameError, Result};

/// Writes blocks (or pre-encoded runs of blocks) to any `Write` stream.
///
/// Writes are all-or-nothing from the caller's view: partial writes and
/// `WouldBlock` on a non-blocking descriptor are retried until every byte
/// has been handed to the stream.
pub struct BlockWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> BlockWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(MESSAGE_MAX),
        }
    }

    /// Encode and send one block.
    pub fn send(&mut self, seq: u64, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_block(seq, payload, &mut self.buf)?;
        let encoded = self.buf.split().freeze();
        self.write_raw(&encoded)
    }

    /// Send bytes that are already framed (e.g. a retransmit window).
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < bytes.len() {
            match self.inner.write(&bytes[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                    continue;
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}
